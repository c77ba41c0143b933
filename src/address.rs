//! Addresses of nodes in DICOM networks.
//!
//! A DICOM node is reached through a socket address,
//! optionally qualified by the application entity title
//! expected at that endpoint.
//! Both parts are written together as `{ae_title}@{socket_address}`;
//! the AE title is checked against the character rules of the
//! standard whenever an address is parsed or assembled.

use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;

use snafu::{ensure, ResultExt, Snafu};

use crate::config::is_valid_ae_title;

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingPart,

    /// The application entity title part is not valid
    InvalidAeTitle,

    /// Could not parse socket address
    ParseSocketAddress { source: AddrParseError },
}

/// Split an `{ae_title}@{socket_address}` string into its parts,
/// checking the AE title when one is present.
fn split_address(s: &str) -> Result<(Option<&str>, SocketAddr), ParseAeAddressError> {
    match s.split_once('@') {
        Some((ae_title, rest)) => {
            ensure!(is_valid_ae_title(ae_title), InvalidAeTitleSnafu);
            let socket_addr = rest.parse().context(ParseSocketAddressSnafu)?;
            Ok((Some(ae_title), socket_addr))
        }
        None => {
            let socket_addr = s.parse().context(ParseSocketAddressSnafu)?;
            Ok((None, socket_addr))
        }
    }
}

/// A complete address to a DICOM node:
/// an application entity title plus a network socket address.
///
/// # Example
///
/// ```
/// # use dicom_net::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "MAIN-STORAGE@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "MAIN-STORAGE");
/// assert_eq!(addr.socket_addr().port(), 104);
/// assert_eq!(&addr.to_string(), "MAIN-STORAGE@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr {
    ae_title: String,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Combine an AE title and a socket address into a full address.
    ///
    /// Fails if the AE title breaks the character rules of the standard.
    pub fn new(
        ae_title: impl Into<String>,
        socket_addr: SocketAddr,
    ) -> Result<Self, ParseAeAddressError> {
        let ae_title = ae_title.into();
        ensure!(is_valid_ae_title(&ae_title), InvalidAeTitleSnafu);
        Ok(FullAeAddr {
            ae_title,
            socket_addr,
        })
    }

    /// The application entity title at this address.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The network socket part of this address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match split_address(s)? {
            (Some(ae_title), socket_addr) => Ok(FullAeAddr {
                ae_title: ae_title.to_string(),
                socket_addr,
            }),
            (None, _) => Err(ParseAeAddressError::MissingPart),
        }
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}

/// An address to a DICOM node
/// in which the application entity title part is optional.
///
/// # Example
///
/// ```
/// # use dicom_net::{AeAddr, FullAeAddr};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "QUERY-SCP@192.168.1.99:1045".parse()?;
/// assert_eq!(addr.ae_title(), Some("QUERY-SCP"));
///
/// // the AE title can be missing
/// let addr: AeAddr = "192.168.1.99:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// // but can be provided later
/// let full_addr: FullAeAddr = addr.with_ae_title("QUERY-SCP");
/// assert_eq!(full_addr.ae_title(), "QUERY-SCP");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_addr: SocketAddr,
}

impl AeAddr {
    /// The application entity title, when the address names one.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The network socket part of this address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Qualify this address with the given AE title,
    /// replacing any title it already carried.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr: self.socket_addr,
        }
    }

    /// Qualify this address with the given AE title
    /// only where it does not already carry one.
    pub fn with_default_ae_title(self, default: impl Into<String>) -> FullAeAddr {
        match self.ae_title {
            Some(ae_title) => FullAeAddr {
                ae_title,
                socket_addr: self.socket_addr,
            },
            None => FullAeAddr {
                ae_title: default.into(),
                socket_addr: self.socket_addr,
            },
        }
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, socket_addr) = split_address(s)?;
        Ok(AeAddr {
            ae_title: ae_title.map(str::to_string),
            socket_addr,
        })
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ae_title {
            Some(ae_title) => write!(f, "{}@{}", ae_title, self.socket_addr),
            None => write!(f, "{}", self.socket_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_ae_addr() {
        let addr: FullAeAddr = "STORE-SCP@10.0.0.7:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.socket_addr(), SocketAddr::from(([10, 0, 0, 7], 11112)));
        assert_eq!(addr.to_string(), "STORE-SCP@10.0.0.7:11112");
    }

    #[test]
    fn full_ae_addr_requires_a_title() {
        assert_eq!(
            "10.0.0.7:11112".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPart)
        );
    }

    #[test]
    fn ae_title_is_validated() {
        assert_eq!(
            "BAD\\TITLE@10.0.0.7:11112".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::InvalidAeTitle)
        );
        assert!("WAY-TOO-LONG-AE-TITLE@10.0.0.7:11112"
            .parse::<AeAddr>()
            .is_err());
        assert!(FullAeAddr::new("    ", SocketAddr::from(([127, 0, 0, 1], 104))).is_err());
        assert!(FullAeAddr::new("ARCHIVE", SocketAddr::from(([127, 0, 0, 1], 104))).is_ok());
    }

    #[test]
    fn bad_socket_part_is_reported() {
        assert!(matches!(
            "ARCHIVE@nowhere".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::ParseSocketAddress { .. })
        ));
    }

    #[test]
    fn ae_addr_tolerates_missing_title() {
        let addr: AeAddr = "10.0.0.7:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.to_string(), "10.0.0.7:104");
        let full = addr.with_default_ae_title("ANY-SCP");
        assert_eq!(full.ae_title(), "ANY-SCP");

        // an existing title wins over the default
        let addr: AeAddr = "REAL-SCP@10.0.0.7:104".parse().unwrap();
        let full = addr.with_default_ae_title("ANY-SCP");
        assert_eq!(full.ae_title(), "REAL-SCP");
    }
}
