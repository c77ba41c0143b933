//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol
//! and to exchange DIMSE service messages over an association.
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and the routines for encoding and decoding them.
//! - The [`machine`] module
//!   implements the upper layer protocol state machine
//!   driving the lifecycle of an association.
//! - The [`association`] module
//!   comprises the abstractions for establishing and negotiating
//!   associations between application entities over TCP.
//! - The [`dimse`] module
//!   implements the message service element on top of an association:
//!   message framing, request/response correlation
//!   and the composite and normalized service operations.
//! - The [`ae`] module
//!   bundles the configuration of one application entity
//!   and runs the server acceptor loop.
//!
//! # Example
//!
//! A verification request against a remote node:
//!
//! ```no_run
//! # use dicom_net::association::client::ClientAssociationOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut association = ClientAssociationOptions::new()
//!     .calling_ae_title("ECHO-SCU")
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .establish_with("MAIN-STORAGE@10.0.0.7:104")?;
//!
//! let status = association.send_c_echo()?;
//! assert_eq!(status, 0x0000);
//! association.release()?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod ae;
pub mod association;
pub mod config;
pub mod dimse;
pub mod machine;
pub mod negotiation;
pub mod pdu;
pub mod primitive;

/// The implementation class UID advertised in association negotiation,
/// identifying this library to its peers.
///
/// The value is a UUID-derived UID (standard part 5, section B.2)
/// and is not a stable identifier across releases:
/// treat it as opaque rather than matching against it.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828047329600838963333029072971827910";

/// The implementation version name advertised
/// alongside [`IMPLEMENTATION_CLASS_UID`].
///
/// Tracks the crate release and is informational only;
/// peers must not rely on its exact contents.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicom-net 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use ae::{ApplicationEntity, ServerHandle};
pub use association::client::ClientAssociationOptions;
pub use association::server::ServerAssociationOptions;
pub use association::Association;
pub use dimse::service::ServiceHandlers;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
