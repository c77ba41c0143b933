//! PDU decoding routines
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from the given source.
///
/// Returns `Ok(None)` when the source is cleanly closed
/// before the first byte of a new PDU.
/// In strict mode, a PDU longer than `max_pdu_length` is an error;
/// otherwise it is accepted up to the absolute ceiling
/// ([`MAXIMUM_PDU_SIZE`]) with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // If the stream is closed before the PDU type byte arrives,
    // there is no PDU to read at all. A transport closure halfway
    // through a PDU is still reported as an error.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version - one bit per supported protocol
            // version; only bit 0 (version 1) is meaningful here.
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 - Called-AE-title - 16 characters of the ISO 646:1990
            // basic G0 set, leading and trailing spaces not significant.
            let called_ae_title = read_ae_title(&mut cursor, "Called-AE-title", &codec)?;

            // 27-42 - Calling-AE-title - same encoding as the called AE title.
            let calling_ae_title = read_ae_title(&mut cursor, "Calling-AE-title", &codec)?;

            // 43-74 - Reserved
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items: one Application Context Item,
            // one or more Presentation Context Items
            // and one User Information Item.
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Some(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            })))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 and 27-42 - Reserved - echoes of the AE title fields of
            // the A-ASSOCIATE-RQ PDU, not tested when received.
            let called_ae_title = read_ae_title(&mut cursor, "Called-AE-title", &codec)?;
            let calling_ae_title = read_ae_title(&mut cursor, "Calling-AE-title", &codec)?;

            // 43-74 - Reserved
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Some(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            })))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result - 1 rejected-permanent, 2 rejected-transient
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source and 10 - Reason/Diag - the admitted reasons depend
            // on the source (PS3.8 §9.3.4).
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AssociationRJ(AssociationRJ { result, source })))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            // 7-xxx - one or more Presentation-data-value items
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1-4 - Item-length - number of bytes from the
                // presentation context ID to the end of the value field
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID - odd integers between 1 and 255
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message control header: bit 0 set means command set
                // fragment, bit 1 set means last fragment of its stream
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Some(Pdu::PData { data: values }))
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRQ))
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRP))
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7 and 8 - Reserved
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source - 0 service-user, 2 service-provider
            // 10 - Reason/Diag - only significant for provider aborts
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AbortRQ { source }))
        }
        _ => Ok(Some(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        })),
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read.min(1 << 16));
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() != bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "could not read the full field",
        ));
    }
    Ok(result)
}

fn read_ae_title<R>(reader: &mut R, field: &'static str, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_uid<R>(reader: &mut R, len: usize, field: &'static str, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    Ok(codec
        .decode(&read_n(reader, len).context(ReadPduFieldSnafu { field })?)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    // 1 - Item-type
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context Item Structure

            // 5-xxx - Application-context-name, structured as a UID
            let val = codec
                .decode(&cursor.into_inner())
                .context(DecodeTextSnafu {
                    field: "Application-context-name",
                })?
                .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string();
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6, 7, 8 - Reserved
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            // 9-xxx - one Abstract Syntax sub-item
            // followed by one or more Transfer Syntax sub-items
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        // Abstract Syntax Sub-Item Structure
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Abstract-syntax-name",
                            codec,
                        )?);
                    }
                    0x40 => {
                        // Transfer Syntax Sub-Item Structure
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                            codec,
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason - 0 acceptance, 1 user-rejection,
            // 2 no-reason, 3 abstract-syntax-not-supported,
            // 4 transfer-syntaxes-not-supported
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - exactly one Transfer Syntax sub-item,
            // not significant when the context was not accepted
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            return MultipleTransferSyntaxesAcceptedSnafu.fail();
                        }
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                            codec,
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure

            let mut user_variables = vec![];

            // 5-xxx - User-data sub-items
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        // Maximum Length Sub-Item Structure

                        // 5-8 - Maximum-length-received - the largest
                        // P-DATA-TF length value the emitter is willing to
                        // receive; 0 means no maximum is specified.
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        // Implementation Class UID Sub-Item Structure
                        let implementation_class_uid = read_uid(
                            &mut cursor,
                            item_length as usize,
                            "Implementation-class-uid",
                            codec,
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            implementation_class_uid,
                        ));
                    }
                    0x55 => {
                        // Implementation Version Name Structure
                        let implementation_version_name = codec
                            .decode(&read_n(&mut cursor, item_length as usize).context(
                                ReadPduFieldSnafu {
                                    field: "Implementation-version-name",
                                },
                            )?)
                            .context(DecodeTextSnafu {
                                field: "Implementation-version-name",
                            })?
                            .trim()
                            .to_string();
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            implementation_version_name,
                        ));
                    }
                    0x53 => {
                        // Asynchronous Operations Window Sub-Item

                        // 5-6 - Maximum-number-operations-invoked
                        let max_operations_invoked =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        // 7-8 - Maximum-number-operations-performed
                        let max_operations_performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables.push(UserVariableItem::AsyncOperationsWindow(
                            max_operations_invoked,
                            max_operations_performed,
                        ));
                    }
                    0x54 => {
                        // SCP/SCU Role Selection Sub-Item

                        // 5-6 - SOP-class-uid-length
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        // 7-xxx - SOP-class-uid
                        let sop_class_uid =
                            read_uid(&mut cursor, uid_length as usize, "SOP-class-uid", codec)?;
                        // SCU-role and SCP-role, one byte each
                        let scu_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                        let scp_role = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCP-role" })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role != 0,
                            scp_role: scp_role != 0,
                        }));
                    }
                    0x56 => {
                        // SOP Class Extended Negotiation Sub-Item

                        // 5-6 - SOP-class-uid-length
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;

                        // 7-xxx - SOP-class-uid
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            sop_class_uid_length as usize,
                            "SOP-class-uid",
                            codec,
                        )?;

                        // xxx-xxx - Service-class-application-information -
                        // opaque to the upper layer, defined by the service
                        // class specification identified by the SOP class.
                        let data_length = item_length
                            .saturating_sub(2)
                            .saturating_sub(sop_class_uid_length);
                        let data = read_n(&mut cursor, data_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Service-class-application-information",
                            },
                        )?;

                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            data,
                        ));
                    }
                    0x57 => {
                        // SOP Class Common Extended Negotiation Sub-Item
                        // (byte 2 above is the sub-item version rather than
                        // a plain reserved byte; version 0 is assumed)

                        // 5-6 - SOP-class-uid-length
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid =
                            read_uid(&mut cursor, uid_length as usize, "SOP-class-uid", codec)?;

                        // Service-class-uid-length + Service-class-uid
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        let service_class_uid =
                            read_uid(&mut cursor, uid_length as usize, "Service-class-uid", codec)?;

                        // Related-general-sop-class-identification-length,
                        // then a sequence of (uid-length, uid) pairs
                        let related_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification-length",
                            })?;
                        let related_bytes = read_n(&mut cursor, related_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification",
                            },
                        )?;
                        let mut related = Cursor::new(related_bytes);
                        let mut related_general_sop_classes = vec![];
                        while related.position() < related.get_ref().len() as u64 {
                            let uid_length =
                                related.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid-length",
                                })?;
                            related_general_sop_classes.push(read_uid(
                                &mut related,
                                uid_length as usize,
                                "Related-general-sop-class-uid",
                                codec,
                            )?);
                        }

                        user_variables.push(UserVariableItem::SopClassCommonExtendedNegotiation(
                            SopClassCommonExtendedNegotiation {
                                sop_class_uid,
                                service_class_uid,
                                related_general_sop_classes,
                            },
                        ));
                    }
                    0x58 => {
                        // User Identity Negotiation Sub-Item (request)

                        // 5 - User-Identity-Type
                        let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;

                        // 6 - Positive-response-requested
                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        // 7-8 - Primary-field-length, 9-n - Primary-field
                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;

                        // n+1-n+2 - Secondary-field-length, n+3-m -
                        // Secondary-field, non-empty only for identity type 2
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;

                        match UserIdentityType::from(user_identity_type) {
                            Some(user_identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        user_identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("Unknown User Identity Type code {}", user_identity_type);
                            }
                        }
                    }
                    0x59 => {
                        // User Identity Negotiation Sub-Item (acceptor)

                        // 5-6 - Server-response-length, 7-n - Server-response
                        let response_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-server-response-length",
                            })?;
                        let server_response = read_n(&mut cursor, response_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-server-response",
                            })?;
                        user_variables.push(UserVariableItem::UserIdentityResponse(server_response));
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
