//! DICOM message service element (DIMSE) support
//!
//! This module provides the message layer running on top of an
//! established association:
//! command set construction and interpretation ([`commands`]),
//! and the service operations themselves ([`service`]),
//! which frame messages over P-DATA-TF PDUs
//! and correlate requests with responses.

use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use snafu::{OptionExt, ResultExt, Snafu};

pub mod commands;
pub mod service;

pub use commands::CommandSet;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to encode a command or data set
    EncodeSet {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    /// failed to decode a command or data set
    DecodeSet {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("missing required command set field `{}`", name))]
    MissingField { name: &'static str },

    #[snafu(display("invalid value in command set field `{}`", name))]
    InvalidField {
        name: &'static str,
        #[snafu(source(from(dicom_core::value::ConvertValueError, Box::new)))]
        source: Box<dicom_core::value::ConvertValueError>,
    },

    #[snafu(display("unrecognized command field {:#06x}", value))]
    UnknownCommandField { value: u16 },

    #[snafu(display("transfer syntax `{}` is not supported", uid))]
    UnsupportedTransferSyntax { uid: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The command field values of the DIMSE services (PS3.7 §9.3, §10.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(value: u16) -> Result<Self> {
        use CommandField::*;
        let field = match value {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            0x0FFF => CCancelRq,
            value => return UnknownCommandFieldSnafu { value }.fail(),
        };
        Ok(field)
    }

    /// Whether this command is a response to a request.
    pub fn is_response(&self) -> bool {
        (*self as u16) & 0x8000 != 0
    }
}

/// The priority of a composite service request (PS3.7 §9.1.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// The general class of a DIMSE status code
/// (PS3.7 Annex C).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StatusType {
    Success,
    Warning,
    Failure,
    Cancel,
    Pending,
}

impl StatusType {
    /// Classify a status code.
    pub fn of(status: u16) -> StatusType {
        match status {
            0x0000 => StatusType::Success,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusType::Warning,
            0xFE00 => StatusType::Cancel,
            0xFF00 | 0xFF01 => StatusType::Pending,
            _ => StatusType::Failure,
        }
    }
}

/// Whether a status code means that further responses will follow.
pub fn is_pending(status: u16) -> bool {
    StatusType::of(status) == StatusType::Pending
}

/// A complete DIMSE message taken off an association:
/// the command set plus the accompanying data set bytes, if any.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the command set
    pub command: CommandSet,
    /// the data set bytes, encoded in the context's transfer syntax
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    /// Decode the accompanying data set
    /// against the given transfer syntax.
    pub fn dataset(&self, transfer_syntax_uid: &str) -> Result<Option<InMemDicomObject>> {
        match &self.data {
            None => Ok(None),
            Some(data) => read_dataset(data, transfer_syntax_uid).map(Some),
        }
    }
}

/// Decode a data set against the given transfer syntax.
pub fn read_dataset(data: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    InMemDicomObject::read_dataset_with_ts(data, ts).context(DecodeSetSnafu)
}

/// Encode a data set with the given transfer syntax.
pub fn write_dataset(object: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax_uid)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax_uid,
        })?;
    let mut data = Vec::new();
    object
        .write_dataset_with_ts(&mut data, ts)
        .context(EncodeSetSnafu)?;
    Ok(data)
}
