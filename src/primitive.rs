//! Upper layer service primitives
//!
//! The value types exchanged between the state machine
//! and the layers above it (PS3.8 §7).
//! A primitive describes one service interaction
//! independently of its encoding on the wire;
//! the association runtime converts between primitives and PDUs.

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, PDataValue, PresentationContextProposed,
    PresentationContextResult, UserVariableItem,
};

/// The four modes of a confirmed service primitive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Mode {
    /// issued by the requesting service user
    Request,
    /// delivered to the responding service user
    Indication,
    /// issued by the responding service user
    Response,
    /// delivered to the requesting service user
    Confirmation,
}

/// The result of an A-ASSOCIATE confirmation.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociateResult {
    /// the association was accepted
    Accepted,
    /// the association was rejected;
    /// carries the (result, source, reason) triple off the wire
    Rejected {
        result: u8,
        source: u8,
        reason: u8,
    },
}

/// An A-ASSOCIATE service primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct AAssociate {
    pub mode: Mode,
    /// the application entity title of the requesting node
    pub calling_ae_title: String,
    /// the application entity title of the responding node
    pub called_ae_title: String,
    /// the application context name
    pub application_context_name: String,
    /// the presentation contexts proposed by the requestor
    /// (request and indication modes)
    pub presentation_contexts_proposed: Vec<PresentationContextProposed>,
    /// the presentation context results decided by the acceptor
    /// (response and confirmation modes)
    pub presentation_contexts_result: Vec<PresentationContextResult>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
    /// the result of the negotiation (confirmation mode only)
    pub result: Option<AssociateResult>,
}

/// An A-RELEASE service primitive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ARelease {
    pub mode: Mode,
}

/// An A-ABORT service primitive,
/// issued by either service user.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AAbort {
    /// who initiated the abort
    pub source: AbortRQSource,
}

/// An A-P-ABORT service primitive:
/// an abort originated by the upper layer provider itself,
/// such as on transport failure or protocol error.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct APAbort {
    /// the provider reason
    pub reason: AbortRQServiceProviderReason,
}

/// A P-DATA service primitive,
/// carrying one or more presentation data values.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PDataPrimitive {
    pub values: Vec<PDataValue>,
}

/// An indication delivered by the association runtime
/// to the service user.
#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    /// the peer requested release of the association
    Release(ARelease),
    /// the peer aborted the association
    Abort(AAbort),
    /// the provider aborted the association
    ProviderAbort(APAbort),
    /// data arrived on the association
    Data(PDataPrimitive),
}
