//! PDU encoding routines
//!
//! Every PDU and variable item is length-prefixed,
//! so the encoder assembles the whole PDU into one [`BytesMut`] buffer,
//! reserving each length field up front
//! and patching it once the enclosed content has been written.
//! The finished buffer is then flushed to the destination in one write.

use crate::pdu::*;
use bytes::{BufMut, BytesMut};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not encode text field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Could not write the encoded PDU"))]
    WriteOut {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Encode a PDU and write it to the given destination.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let mut out = BytesMut::with_capacity(encoded_size_hint(pdu));
    encode_pdu(&mut out, pdu)?;
    writer.write_all(&out).context(WriteOutSnafu)
}

/// A reasonable buffer capacity for the PDU about to be encoded.
fn encoded_size_hint(pdu: &Pdu) -> usize {
    let header = PDU_HEADER_SIZE as usize;
    match pdu {
        Pdu::PData { data } => {
            header
                + data
                    .iter()
                    .map(|pdv| pdv.data.len() + PDV_HEADER_SIZE as usize)
                    .sum::<usize>()
        }
        Pdu::Unknown { data, .. } => header + data.len(),
        // negotiation PDUs are small; release and abort even smaller
        _ => 512,
    }
}

/// Reserve a 32-bit big-endian length field,
/// let `encode` append the content it measures,
/// then patch the field with the number of bytes that followed it.
fn measured_u32<F>(out: &mut BytesMut, encode: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let length_at = out.len();
    out.put_u32(0);
    encode(out)?;
    let length = (out.len() - length_at - 4) as u32;
    out[length_at..length_at + 4].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

/// Same as [`measured_u32`], for the 16-bit item lengths.
fn measured_u16<F>(out: &mut BytesMut, encode: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let length_at = out.len();
    out.put_u16(0);
    encode(out)?;
    let length = (out.len() - length_at - 2) as u16;
    out[length_at..length_at + 2].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

/// Append an application entity title,
/// space padded to its fixed field width of 16 bytes.
fn put_ae_title(out: &mut BytesMut, ae_title: &str, field: &'static str) -> Result<()> {
    let mut bytes = DefaultCharacterSetCodec
        .encode(ae_title)
        .context(EncodeFieldSnafu { field })?;
    bytes.resize(16, b' ');
    out.put_slice(&bytes);
    Ok(())
}

/// Append a UID field,
/// padded with a single trailing NUL byte if its length is odd.
fn put_uid(out: &mut BytesMut, uid: &str, field: &'static str) -> Result<()> {
    let bytes = DefaultCharacterSetCodec
        .encode(uid.trim())
        .context(EncodeFieldSnafu { field })?;
    out.put_slice(&bytes);
    if bytes.len() % 2 == 1 {
        out.put_u8(b'\0');
    }
    Ok(())
}

fn encode_pdu(out: &mut BytesMut, pdu: &Pdu) -> Result<()> {
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ PDU Structure

            // 1 - PDU-type - 01H, 2 - Reserved
            out.put_u8(0x01);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7-8 - Protocol-version, 9-10 - Reserved
                out.put_u16(*protocol_version);
                out.put_u16(0x0000);

                // 11-26 - Called-AE-title, 27-42 - Calling-AE-title -
                // 16 characters of the ISO 646:1990 basic G0 set,
                // leading and trailing spaces not significant
                put_ae_title(out, called_ae_title, "Called-AE-title")?;
                put_ae_title(out, calling_ae_title, "Calling-AE-title")?;

                // 43-74 - Reserved
                out.put_bytes(0x00, 32);

                // 75-xxx - Variable items: one Application Context Item,
                // one or more Presentation Context Items
                // and one User Information Item
                put_application_context(out, application_context_name)?;
                for presentation_context in presentation_contexts {
                    put_presentation_context_proposed(out, presentation_context)?;
                }
                put_user_information(out, user_variables)
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            application_context_name,
            called_ae_title,
            calling_ae_title,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC PDU Structure

            // 1 - PDU-type - 02H, 2 - Reserved
            out.put_u8(0x02);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7-8 - Protocol-version, 9-10 - Reserved
                out.put_u16(*protocol_version);
                out.put_u16(0x0000);

                // 11-26 and 27-42 - Reserved - sent with the values
                // received in the A-ASSOCIATE-RQ,
                // not tested by the receiver
                put_ae_title(out, called_ae_title, "Called-AE-title")?;
                put_ae_title(out, calling_ae_title, "Calling-AE-title")?;

                // 43-74 - Reserved
                out.put_bytes(0x00, 32);

                // 75-xxx - Variable items
                put_application_context(out, application_context_name)?;
                for presentation_context in presentation_contexts {
                    put_presentation_context_result(out, presentation_context)?;
                }
                put_user_information(out, user_variables)
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // A-ASSOCIATE-RJ PDU Structure

            // 1 - PDU-type - 03H, 2 - Reserved
            out.put_u8(0x03);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7 - Reserved
                out.put_u8(0x00);
                // 8 - Result - 1 rejected-permanent, 2 rejected-transient
                out.put_u8(result.code());
                // 9 - Source and 10 - Reason/Diag - the admitted reasons
                // depend on the source (PS3.8 §9.3.4)
                let (source, reason) = source.codes();
                out.put_u8(source);
                out.put_u8(reason);
                Ok(())
            })
        }
        Pdu::PData { data } => {
            // P-DATA-TF PDU Structure

            // 1 - PDU-type - 04H, 2 - Reserved
            out.put_u8(0x04);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7-xxx - Presentation-data-value items
                for pdv in data {
                    measured_u32(out, |out| {
                        // 5 - Presentation-context-ID
                        out.put_u8(pdv.presentation_context_id);

                        // 6 - Message control header:
                        // bit 0 set for command set fragments,
                        // bit 1 set on the last fragment of its stream
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = pdv.value_type {
                            message_header |= 0x01;
                        }
                        if pdv.is_last {
                            message_header |= 0x02;
                        }
                        out.put_u8(message_header);

                        // Message fragment
                        out.put_slice(&pdv.data);
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            // A-RELEASE-RQ PDU Structure

            // 1 - PDU-type - 05H, 2 - Reserved
            out.put_u8(0x05);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7-10 - Reserved
                out.put_u32(0x0000_0000);
                Ok(())
            })
        }
        Pdu::ReleaseRP => {
            // A-RELEASE-RP PDU Structure

            // 1 - PDU-type - 06H, 2 - Reserved
            out.put_u8(0x06);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7-10 - Reserved
                out.put_u32(0x0000_0000);
                Ok(())
            })
        }
        Pdu::AbortRQ { source } => {
            // A-ABORT PDU Structure

            // 1 - PDU-type - 07H, 2 - Reserved
            out.put_u8(0x07);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                // 7 and 8 - Reserved
                out.put_u16(0x0000);
                // 9 - Source - 0 service-user, 2 service-provider
                // 10 - Reason/Diag - only significant for provider
                // aborts; sent as 00H for service-user aborts
                let (source, reason) = source.codes();
                out.put_u8(source);
                out.put_u8(reason);
                Ok(())
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            // 1 - PDU-type, 2 - Reserved
            out.put_u8(*pdu_type);
            out.put_u8(0x00);

            measured_u32(out, |out| {
                out.put_slice(data);
                Ok(())
            })
        }
    }
}

fn put_application_context(out: &mut BytesMut, application_context_name: &str) -> Result<()> {
    // Application Context Item Structure

    // 1 - Item-type - 10H, 2 - Reserved
    out.put_u8(0x10);
    out.put_u8(0x00);

    measured_u16(out, |out| {
        // 5-xxx - Application-context-name, structured as a UID
        put_uid(out, application_context_name, "Application-context-name")
    })
}

fn put_presentation_context_proposed(
    out: &mut BytesMut,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // Presentation Context Item Structure (proposed)

    // 1 - Item-type - 20H, 2 - Reserved
    out.put_u8(0x20);
    out.put_u8(0x00);

    measured_u16(out, |out| {
        // 5 - Presentation-context-ID - odd integers between 1 and 255
        out.put_u8(presentation_context.id);
        // 6, 7, 8 - Reserved
        out.put_bytes(0x00, 3);

        // 9-xxx - one Abstract Syntax sub-item,
        // then one or more Transfer Syntax sub-items

        // Abstract Syntax Sub-Item: Item-type 30H, Reserved
        out.put_u8(0x30);
        out.put_u8(0x00);
        measured_u16(out, |out| {
            put_uid(
                out,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
            )
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            // Transfer Syntax Sub-Item: Item-type 40H, Reserved
            out.put_u8(0x40);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                put_uid(out, transfer_syntax, "Transfer-syntax-name")
            })?;
        }
        Ok(())
    })
}

fn put_presentation_context_result(
    out: &mut BytesMut,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    // Presentation Context Item Structure (result)

    // 1 - Item-type - 21H, 2 - Reserved
    out.put_u8(0x21);
    out.put_u8(0x00);

    measured_u16(out, |out| {
        // 5 - Presentation-context-ID, 6 - Reserved
        out.put_u8(presentation_context.id);
        out.put_u8(0x00);
        // 7 - Result/Reason, 8 - Reserved
        out.put_u8(presentation_context.reason.code());
        out.put_u8(0x00);

        // 9-xxx - one Transfer Syntax sub-item,
        // not significant when the context was not accepted
        out.put_u8(0x40);
        out.put_u8(0x00);
        measured_u16(out, |out| {
            put_uid(
                out,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
            )
        })
    })
}

fn put_user_information(out: &mut BytesMut, user_variables: &[UserVariableItem]) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information Item Structure

    // 1 - Item-type - 50H, 2 - Reserved
    out.put_u8(0x50);
    out.put_u8(0x00);

    measured_u16(out, |out| {
        // 5-xxx - User-data sub-items
        for user_variable in user_variables {
            put_user_variable(out, user_variable)?;
        }
        Ok(())
    })
}

fn put_user_variable(out: &mut BytesMut, user_variable: &UserVariableItem) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            // Maximum Length Sub-Item - 51H
            out.put_u8(0x51);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-8 - Maximum-length-received
                out.put_u32(*max_length);
                Ok(())
            })
        }
        UserVariableItem::ImplementationClassUID(impl_class_uid) => {
            // Implementation Class UID Sub-Item - 52H
            out.put_u8(0x52);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                put_uid(out, impl_class_uid, "Implementation-class-uid")
            })
        }
        UserVariableItem::ImplementationVersionName(impl_version_name) => {
            // Implementation Version Name Sub-Item - 55H
            out.put_u8(0x55);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-xxx - 1 to 16 ISO 646:1990 characters
                let bytes = DefaultCharacterSetCodec
                    .encode(impl_version_name)
                    .context(EncodeFieldSnafu {
                        field: "Implementation-version-name",
                    })?;
                out.put_slice(&bytes);
                Ok(())
            })
        }
        UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
            // Asynchronous Operations Window Sub-Item - 53H
            out.put_u8(0x53);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-6 - Maximum-number-operations-invoked
                // 7-8 - Maximum-number-operations-performed
                out.put_u16(*invoked);
                out.put_u16(*performed);
                Ok(())
            })
        }
        UserVariableItem::RoleSelection(role_selection) => {
            // SCP/SCU Role Selection Sub-Item - 54H
            out.put_u8(0x54);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-6 - SOP-class-uid-length, 7-xxx - SOP-class-uid
                measured_u16(out, |out| {
                    put_uid(out, &role_selection.sop_class_uid, "SOP-class-uid")
                })?;
                // SCU-role and SCP-role, one byte each
                out.put_u8(role_selection.scu_role as u8);
                out.put_u8(role_selection.scp_role as u8);
                Ok(())
            })
        }
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
            // SOP Class Extended Negotiation Sub-Item - 56H
            out.put_u8(0x56);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-6 - SOP-class-uid-length, 7-xxx - SOP-class-uid
                measured_u16(out, |out| put_uid(out, sop_class_uid, "SOP-class-uid"))?;
                // xxx-xxx - Service-class-application-information,
                // running to the end of the sub-item
                out.put_slice(data);
                Ok(())
            })
        }
        UserVariableItem::SopClassCommonExtendedNegotiation(negotiation) => {
            // SOP Class Common Extended Negotiation Sub-Item - 57H
            // (byte 2 is the sub-item version; version 0)
            out.put_u8(0x57);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // SOP-class-uid-length + SOP-class-uid
                measured_u16(out, |out| {
                    put_uid(out, &negotiation.sop_class_uid, "SOP-class-uid")
                })?;
                // Service-class-uid-length + Service-class-uid
                measured_u16(out, |out| {
                    put_uid(out, &negotiation.service_class_uid, "Service-class-uid")
                })?;
                // Related-general-sop-class-identification-length,
                // then (uid-length, uid) pairs
                measured_u16(out, |out| {
                    for uid in &negotiation.related_general_sop_classes {
                        measured_u16(out, |out| {
                            put_uid(out, uid, "Related-general-sop-class-uid")
                        })?;
                    }
                    Ok(())
                })
            })
        }
        UserVariableItem::UserIdentityItem(user_identity) => {
            // User Identity Negotiation Sub-Item (request) - 58H
            out.put_u8(0x58);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5 - User-Identity-Type
                out.put_u8(user_identity.identity_type().code());
                // 6 - Positive-response-requested
                out.put_u8(user_identity.positive_response_requested() as u8);
                // 7-8 - Primary-field-length, 9-n - Primary-field
                measured_u16(out, |out| {
                    out.put_slice(user_identity.primary_field());
                    Ok(())
                })?;
                // n+1-n+2 - Secondary-field-length, n+3-m - Secondary-field
                measured_u16(out, |out| {
                    out.put_slice(user_identity.secondary_field());
                    Ok(())
                })
            })
        }
        UserVariableItem::UserIdentityResponse(server_response) => {
            // User Identity Negotiation Sub-Item (acceptor) - 59H
            out.put_u8(0x59);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                // 5-6 - Server-response-length, 7-n - Server-response
                measured_u16(out, |out| {
                    out.put_slice(server_response);
                    Ok(())
                })
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            // opaque sub-item carried over from a decoded PDU
            out.put_u8(*item_type);
            out.put_u8(0x00);
            measured_u16(out, |out| {
                out.put_slice(data);
                Ok(())
            })
        }
    }
}
