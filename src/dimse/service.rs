//! DIMSE service operations over an association
//!
//! This module gives [`Association`] its service class user operations
//! (`send_c_echo`, `send_c_store`, `send_c_find`, `send_c_get`,
//! `send_c_move` and the normalized `send_n_*` family)
//! and the service class provider loop ([`Association::serve`]),
//! which dispatches inbound requests to a [`ServiceHandlers`] table.
//!
//! Messages are framed over P-DATA-TF PDUs within the peer's maximum
//! PDU length and reassembled on receipt;
//! requests and responses are correlated by message identifier.

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{OptionExt, Snafu};

use crate::association::pdata::{fragment_message, AssembledPart, MessageAssembler};
use crate::association::Association;
use crate::config::is_conformant_uid;
use crate::pdu::{
    Pdu, PresentationContextNegotiated, PresentationContextResult,
    PresentationContextResultReason, PDV_HEADER_SIZE,
};
use crate::primitive::{AAssociate, AssociateResult, Indication, Mode};

use super::commands::{CommandSet, SubOperations};
use super::{is_pending, read_dataset, write_dataset, CommandField, DimseMessage, Priority};

/// Refused: SOP class not supported (PS3.7 Annex C.5.7).
const STATUS_SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
/// The operation was cancelled on request.
const STATUS_CANCEL: u16 = 0xFE00;
/// Sub-operations complete, one or more failures.
const STATUS_SUBOPS_ONE_OR_MORE_FAILURES: u16 = 0xB000;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association failure during a DIMSE operation
    #[snafu(context(false))]
    Association {
        #[snafu(source(from(crate::association::Error, Box::new)))]
        source: Box<crate::association::Error>,
    },

    /// failed to build or interpret a DIMSE message
    #[snafu(context(false))]
    Message {
        #[snafu(source(from(super::Error, Box::new)))]
        source: Box<super::Error>,
    },

    /// failed to reassemble a DIMSE message from its fragments
    #[snafu(context(false))]
    Assembly {
        source: crate::association::pdata::Error,
    },

    #[snafu(display("no acceptable presentation context for `{}`", sop_class_uid))]
    NoAcceptableContext { sop_class_uid: String },

    #[snafu(display(
        "response refers to message {}, expected {}",
        got,
        expected
    ))]
    MismatchedResponse { expected: u16, got: u16 },

    #[snafu(display("unexpected {:?} message", command_field))]
    UnexpectedMessage { command_field: CommandField },

    /// the command declared a data set, but none arrived
    MissingDataSet,

    #[snafu(display("missing attribute `{}` in data set", name))]
    MissingAttribute { name: &'static str },

    /// a value failed validation before any wire traffic
    #[snafu(display("invalid value `{}` for {:?}", value, vr))]
    InvalidValue { vr: dicom_core::VR, value: String },

    /// a message arrived on a presentation context
    /// that was not accepted at negotiation
    #[snafu(display("message on unaccepted presentation context {}", context_id))]
    UnacceptedContext { context_id: u8 },

    /// the peer released the association during the operation
    PeerReleased,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An inbound C-ECHO request.
#[derive(Debug)]
pub struct CEchoRequest {
    pub presentation_context_id: u8,
    pub message_id: u16,
    pub sop_class_uid: String,
}

/// An inbound C-STORE request,
/// carrying the composite instance to be stored.
#[derive(Debug)]
pub struct CStoreRequest {
    pub presentation_context_id: u8,
    pub message_id: u16,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// the transfer syntax the data set is encoded in
    pub transfer_syntax_uid: String,
    /// the data set bytes, in the negotiated transfer syntax
    pub data: Vec<u8>,
    /// the AE title and message ID of the C-MOVE operation
    /// this store is a sub-operation of, if any
    pub move_originator: Option<(String, u16)>,
}

impl CStoreRequest {
    /// Decode the composite instance data set.
    pub fn dataset(&self) -> super::Result<InMemDicomObject> {
        read_dataset(&self.data, &self.transfer_syntax_uid)
    }
}

/// An inbound C-FIND request.
#[derive(Debug)]
pub struct QueryRequest {
    pub presentation_context_id: u8,
    pub message_id: u16,
    pub sop_class_uid: String,
    /// the query identifier
    pub identifier: InMemDicomObject,
}

/// An inbound C-GET or C-MOVE request.
#[derive(Debug)]
pub struct RetrieveRequest {
    pub presentation_context_id: u8,
    pub message_id: u16,
    pub sop_class_uid: String,
    /// the retrieve identifier
    pub identifier: InMemDicomObject,
    /// the destination AE title (C-MOVE only)
    pub move_destination: Option<String>,
}

/// An inbound normalized service request.
#[derive(Debug)]
pub struct NRequest {
    pub presentation_context_id: u8,
    pub message_id: u16,
    /// the operation conveyed by the command set
    pub command_field: CommandField,
    /// the full command set
    pub command: CommandSet,
    /// the accompanying data set, if any
    pub data: Option<InMemDicomObject>,
}

/// Responses yielded by a C-FIND or C-MOVE handler:
/// pending (status, identifier) pairs,
/// optionally ending with a final status.
///
/// When the iterator ends without a final (non-pending) status,
/// the provider loop reports success on its own.
pub type QueryResponses = Box<dyn Iterator<Item = (u16, Option<InMemDicomObject>)> + Send>;

/// Data sets yielded by a C-GET handler,
/// each to be delivered through a C-STORE sub-operation
/// on the same association.
pub type RetrieveDatasets = Box<dyn Iterator<Item = InMemDicomObject> + Send>;

type EchoHandler = Box<dyn FnMut(&CEchoRequest) -> u16 + Send>;
type StoreHandler = Box<dyn FnMut(&CStoreRequest) -> u16 + Send>;
type FindHandler = Box<dyn FnMut(&QueryRequest) -> QueryResponses + Send>;
type GetHandler = Box<dyn FnMut(&RetrieveRequest) -> RetrieveDatasets + Send>;
type MoveHandler = Box<dyn FnMut(&RetrieveRequest) -> QueryResponses + Send>;
type NHandler = Box<dyn FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send>;
type EstablishedHandler = Box<dyn FnMut(&AAssociate) + Send>;
type EventHandler = Box<dyn FnMut() + Send>;
type IndicationTap = Box<dyn FnMut(&Indication) + Send>;

/// The table of service class handlers of an association.
///
/// Each entry is keyed by the kind of event it reacts to;
/// absent entries fall back to a standard reply
/// (success for C-ECHO, _SOP class not supported_ for the rest).
#[derive(Default)]
pub struct ServiceHandlers {
    pub(crate) on_c_echo: Option<EchoHandler>,
    pub(crate) on_c_store: Option<StoreHandler>,
    pub(crate) on_c_find: Option<FindHandler>,
    pub(crate) on_c_get: Option<GetHandler>,
    pub(crate) on_c_move: Option<MoveHandler>,
    pub(crate) on_n_get: Option<NHandler>,
    pub(crate) on_n_set: Option<NHandler>,
    pub(crate) on_n_create: Option<NHandler>,
    pub(crate) on_n_delete: Option<NHandler>,
    pub(crate) on_n_action: Option<NHandler>,
    pub(crate) on_n_event_report: Option<NHandler>,
    pub(crate) on_established: Option<EstablishedHandler>,
    pub(crate) on_released: Option<EventHandler>,
    pub(crate) on_aborted: Option<EventHandler>,
    pub(crate) on_indication: Option<IndicationTap>,
}

impl std::fmt::Debug for ServiceHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut installed = vec![];
        macro_rules! probe {
            ($($name:ident),*) => {
                $(if self.$name.is_some() {
                    installed.push(stringify!($name));
                })*
            };
        }
        probe!(
            on_c_echo,
            on_c_store,
            on_c_find,
            on_c_get,
            on_c_move,
            on_n_get,
            on_n_set,
            on_n_create,
            on_n_delete,
            on_n_action,
            on_n_event_report,
            on_established,
            on_released,
            on_aborted,
            on_indication
        );
        f.debug_struct("ServiceHandlers")
            .field("installed", &installed)
            .finish()
    }
}

impl ServiceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// React to C-ECHO requests. Returns the response status.
    pub fn on_c_echo(mut self, f: impl FnMut(&CEchoRequest) -> u16 + Send + 'static) -> Self {
        self.on_c_echo = Some(Box::new(f));
        self
    }

    /// React to C-STORE requests. Returns the response status.
    pub fn on_c_store(mut self, f: impl FnMut(&CStoreRequest) -> u16 + Send + 'static) -> Self {
        self.on_c_store = Some(Box::new(f));
        self
    }

    /// React to C-FIND requests with a sequence of matches.
    pub fn on_c_find(
        mut self,
        f: impl FnMut(&QueryRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.on_c_find = Some(Box::new(f));
        self
    }

    /// React to C-GET requests with the data sets to deliver.
    pub fn on_c_get(
        mut self,
        f: impl FnMut(&RetrieveRequest) -> RetrieveDatasets + Send + 'static,
    ) -> Self {
        self.on_c_get = Some(Box::new(f));
        self
    }

    /// React to C-MOVE requests with a sequence of progress reports.
    /// The handler is responsible for the sub-operations
    /// towards the move destination.
    pub fn on_c_move(
        mut self,
        f: impl FnMut(&RetrieveRequest) -> QueryResponses + Send + 'static,
    ) -> Self {
        self.on_c_move = Some(Box::new(f));
        self
    }

    pub fn on_n_get(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_get = Some(Box::new(f));
        self
    }

    pub fn on_n_set(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_set = Some(Box::new(f));
        self
    }

    pub fn on_n_create(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_create = Some(Box::new(f));
        self
    }

    pub fn on_n_delete(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_delete = Some(Box::new(f));
        self
    }

    pub fn on_n_action(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_action = Some(Box::new(f));
        self
    }

    pub fn on_n_event_report(
        mut self,
        f: impl FnMut(&NRequest) -> (u16, Option<InMemDicomObject>) + Send + 'static,
    ) -> Self {
        self.on_n_event_report = Some(Box::new(f));
        self
    }

    /// React to the provider loop starting on an association.
    ///
    /// The handler receives the A-ASSOCIATE indication primitive
    /// describing the negotiated association.
    pub fn on_established(mut self, f: impl FnMut(&AAssociate) + Send + 'static) -> Self {
        self.on_established = Some(Box::new(f));
        self
    }

    /// React to the peer releasing the association.
    pub fn on_released(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_released = Some(Box::new(f));
        self
    }

    /// React to the association being aborted.
    pub fn on_aborted(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_aborted = Some(Box::new(f));
        self
    }

    /// Observe every upper layer indication on the association:
    /// inbound data, release requests and aborts.
    pub fn on_indication(mut self, f: impl FnMut(&Indication) + Send + 'static) -> Self {
        self.on_indication = Some(Box::new(f));
        self
    }
}

/// What arrived while waiting for a DIMSE message.
enum Inbound {
    Message(DimseMessage),
    Released,
}

impl Association {
    /// Find the accepted presentation context
    /// negotiated for the given abstract syntax.
    fn context_for(&self, sop_class_uid: &str) -> Result<PresentationContextNegotiated> {
        self.presentation_contexts()
            .iter()
            .find(|pc| {
                pc.reason == PresentationContextResultReason::Acceptance
                    && pc.abstract_syntax == sop_class_uid
            })
            .cloned()
            .context(NoAcceptableContextSnafu { sop_class_uid })
    }

    fn context_by_id(&self, id: u8) -> Option<PresentationContextNegotiated> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.id == id)
            .cloned()
    }

    /// Frame and transmit one DIMSE message.
    pub(crate) fn send_message(
        &mut self,
        presentation_context_id: u8,
        mut command: CommandSet,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        use snafu::ResultExt;
        use std::io::Write;

        command.set_data_set_present(data.is_some());
        let command_bytes = command.write()?;
        let max_pdu_length = self.peer_max_pdu_length();

        match data {
            // a data set too large for one PDU is streamed
            // fragment by fragment instead of buffering every PDU
            Some(data)
                if self.options.chunked_transfer
                    && command_bytes.len() + data.len()
                        > (max_pdu_length - 2 * PDV_HEADER_SIZE) as usize =>
            {
                for pdu in fragment_message(
                    presentation_context_id,
                    command_bytes,
                    None,
                    max_pdu_length,
                ) {
                    self.send(&pdu)?;
                }
                let mut writer = self.send_pdata(presentation_context_id);
                writer
                    .write_all(&data)
                    .context(crate::association::WireSendSnafu)?;
                writer
                    .finish()
                    .context(crate::association::WireSendSnafu)?;
                Ok(())
            }
            data => {
                for pdu in fragment_message(
                    presentation_context_id,
                    command_bytes,
                    data,
                    max_pdu_length,
                ) {
                    self.send(&pdu)?;
                }
                Ok(())
            }
        }
    }

    /// Receive and reassemble one full DIMSE message,
    /// answering a peer release request if one arrives instead.
    fn receive_inbound(&mut self) -> Result<Inbound> {
        let mut assembler = MessageAssembler::new();
        let mut command: Option<(u8, CommandSet)> = None;
        loop {
            let pdu = self.receive_timeout_opt(self.dimse_timeout())?;
            let values = match pdu {
                Pdu::PData { data } => data,
                Pdu::ReleaseRQ => {
                    // peer wants out; acknowledge and wind down
                    self.send(&Pdu::ReleaseRP)?;
                    self.mark_closed();
                    self.close_transport();
                    tracing::debug!("association released by peer");
                    return Ok(Inbound::Released);
                }
                pdu => {
                    return Err(crate::association::Error::UnexpectedPdu { pdu: Box::new(pdu) }.into());
                }
            };

            for pdv in values {
                match assembler.push(pdv)? {
                    None => {}
                    Some(AssembledPart::Command { context_id, data }) => {
                        // fragments must refer to an accepted context
                        let accepted = self
                            .context_by_id(context_id)
                            .map(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                            .unwrap_or(false);
                        if !accepted {
                            self.abort_provider(
                                crate::pdu::AbortRQServiceProviderReason::UnexpectedPduParameter,
                            );
                            self.mark_closed();
                            return Err(Error::UnacceptedContext { context_id });
                        }
                        let command_set = CommandSet::read(&data)?;
                        if !command_set.has_data_set()? {
                            return Ok(Inbound::Message(DimseMessage {
                                presentation_context_id: context_id,
                                command: command_set,
                                data: None,
                            }));
                        }
                        command = Some((context_id, command_set));
                    }
                    Some(AssembledPart::Data { context_id, data }) => {
                        let (command_context, command_set) =
                            command.take().ok_or(Error::MissingDataSet)?;
                        debug_assert_eq!(command_context, context_id);
                        return Ok(Inbound::Message(DimseMessage {
                            presentation_context_id: context_id,
                            command: command_set,
                            data: Some(data),
                        }));
                    }
                }
            }
        }
    }

    /// Receive one full DIMSE message,
    /// treating a peer release as an error.
    pub(crate) fn receive_message(&mut self) -> Result<DimseMessage> {
        match self.receive_inbound()? {
            Inbound::Message(message) => Ok(message),
            Inbound::Released => Err(Error::PeerReleased),
        }
    }

    /// Send a C-ECHO request and wait for its response.
    ///
    /// Returns the response status, 0 on success.
    pub fn send_c_echo(&mut self) -> Result<u16> {
        const VERIFICATION: &str = "1.2.840.10008.1.1";
        let context = self.context_for(VERIFICATION)?;
        let message_id = self.next_message_id();
        self.send_message(
            context.id,
            CommandSet::c_echo_rq(message_id, VERIFICATION),
            None,
        )?;

        let message = self.receive_message()?;
        expect_response(&message, CommandField::CEchoRsp, message_id)?;
        Ok(message.command.status()?)
    }

    /// Send a composite instance through a C-STORE request
    /// and wait for its response.
    ///
    /// The presentation context is selected by the SOP class UID
    /// of the given data set.
    /// Returns the response status, 0 on success.
    pub fn send_c_store(
        &mut self,
        dataset: &InMemDicomObject,
        move_originator: Option<(&str, u16)>,
    ) -> Result<u16> {
        let sop_class_uid = text_attribute(dataset, tags::SOP_CLASS_UID, "SOP Class UID")?;
        let sop_instance_uid =
            text_attribute(dataset, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
        for uid in [&sop_class_uid, &sop_instance_uid] {
            let conformant = !self.options.enforce_uid_conformance || is_conformant_uid(uid);
            snafu::ensure!(
                conformant && self.options.validate(dicom_core::VR::UI, uid),
                InvalidValueSnafu {
                    vr: dicom_core::VR::UI,
                    value: uid.clone(),
                }
            );
        }

        let context = self.context_for(&sop_class_uid)?;
        let data = write_dataset(dataset, &context.transfer_syntax)?;
        let message_id = self.next_message_id();

        if self.options.log_request_identifiers {
            tracing::info!(
                "C-STORE rq msg {} ({}, {} bytes)",
                message_id,
                sop_instance_uid,
                data.len()
            );
        }

        self.send_message(
            context.id,
            CommandSet::c_store_rq(
                message_id,
                &sop_class_uid,
                &sop_instance_uid,
                Priority::Medium,
                move_originator,
            ),
            Some(data),
        )?;

        let message = self.receive_message()?;
        expect_response(&message, CommandField::CStoreRsp, message_id)?;
        Ok(message.command.status()?)
    }

    /// Send a C-FIND request,
    /// returning an iterator over the responses:
    /// every pending (status, identifier) pair,
    /// terminated by the final status.
    pub fn send_c_find(
        &mut self,
        identifier: &InMemDicomObject,
        sop_class_uid: &str,
    ) -> Result<ResponseIter<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let data = write_dataset(identifier, &context.transfer_syntax)?;
        let message_id = self.next_message_id();
        self.send_message(
            context.id,
            CommandSet::c_find_rq(message_id, sop_class_uid, Priority::Medium),
            Some(data),
        )?;
        Ok(ResponseIter::new(self, context, message_id, CommandField::CFindRsp))
    }

    /// Send a C-GET request,
    /// returning an iterator over the responses.
    ///
    /// Inbound C-STORE sub-operations are dispatched to the
    /// store handler installed on this association
    /// (see [`Association::set_handlers`]).
    pub fn send_c_get(
        &mut self,
        identifier: &InMemDicomObject,
        sop_class_uid: &str,
    ) -> Result<ResponseIter<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let data = write_dataset(identifier, &context.transfer_syntax)?;
        let message_id = self.next_message_id();
        self.send_message(
            context.id,
            CommandSet::c_get_rq(message_id, sop_class_uid, Priority::Medium),
            Some(data),
        )?;
        Ok(ResponseIter::new(self, context, message_id, CommandField::CGetRsp))
    }

    /// Send a C-MOVE request towards the given destination AE title,
    /// returning an iterator over the progress responses.
    pub fn send_c_move(
        &mut self,
        identifier: &InMemDicomObject,
        move_destination: &str,
        sop_class_uid: &str,
    ) -> Result<ResponseIter<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let data = write_dataset(identifier, &context.transfer_syntax)?;
        let message_id = self.next_message_id();
        // AE titles in command sets are space padded to 16 characters
        // unless short titles are configured
        let move_destination = if self.options.use_short_dimse_aet {
            move_destination.trim_end().to_string()
        } else {
            format!("{:<16}", move_destination)
        };
        self.send_message(
            context.id,
            CommandSet::c_move_rq(message_id, sop_class_uid, Priority::Medium, &move_destination),
            Some(data),
        )?;
        Ok(ResponseIter::new(self, context, message_id, CommandField::CMoveRsp))
    }

    fn n_request(
        &mut self,
        sop_class_uid: &str,
        command: CommandSet,
        data: Option<&InMemDicomObject>,
        expected: CommandField,
        message_id: u16,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let context = self.context_for(sop_class_uid)?;
        let data = data
            .map(|object| write_dataset(object, &context.transfer_syntax))
            .transpose()?;
        self.send_message(context.id, command, data)?;

        let message = self.receive_message()?;
        expect_response(&message, expected, message_id)?;
        let status = message.command.status()?;
        let attribute_list = message.dataset(&context.transfer_syntax)?;
        Ok((status, attribute_list))
    }

    /// Send an N-GET request for the given SOP instance,
    /// optionally restricted to the listed attributes.
    pub fn send_n_get(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        attribute_list: &[dicom_core::Tag],
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_get_rq(message_id, sop_class_uid, sop_instance_uid, attribute_list),
            None,
            CommandField::NGetRsp,
            message_id,
        )
    }

    /// Send an N-SET request with the given modification list.
    pub fn send_n_set(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        modification_list: &InMemDicomObject,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_set_rq(message_id, sop_class_uid, sop_instance_uid),
            Some(modification_list),
            CommandField::NSetRsp,
            message_id,
        )
    }

    /// Send an N-CREATE request.
    pub fn send_n_create(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: Option<&str>,
        attribute_list: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_create_rq(message_id, sop_class_uid, sop_instance_uid),
            attribute_list,
            CommandField::NCreateRsp,
            message_id,
        )
    }

    /// Send an N-DELETE request.
    pub fn send_n_delete(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_delete_rq(message_id, sop_class_uid, sop_instance_uid),
            None,
            CommandField::NDeleteRsp,
            message_id,
        )
    }

    /// Send an N-ACTION request.
    pub fn send_n_action(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
        action_information: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_action_rq(message_id, sop_class_uid, sop_instance_uid, action_type_id),
            action_information,
            CommandField::NActionRsp,
            message_id,
        )
    }

    /// Send an N-EVENT-REPORT request.
    pub fn send_n_event_report(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
        event_information: Option<&InMemDicomObject>,
    ) -> Result<(u16, Option<InMemDicomObject>)> {
        let message_id = self.next_message_id();
        self.n_request(
            sop_class_uid,
            CommandSet::n_event_report_rq(
                message_id,
                sop_class_uid,
                sop_instance_uid,
                event_type_id,
            ),
            event_information,
            CommandField::NEventReportRsp,
            message_id,
        )
    }

    /// Dispatch one inbound C-STORE request to the store handler.
    fn dispatch_store(&mut self, message: DimseMessage) -> Result<()> {
        let command = &message.command;
        let message_id = command.message_id()?;
        let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
        let sop_instance_uid = command.affected_sop_instance_uid().unwrap_or_default();
        let transfer_syntax_uid = self
            .context_by_id(message.presentation_context_id)
            .map(|pc| pc.transfer_syntax)
            .unwrap_or_else(|| crate::negotiation::IMPLICIT_VR_LE.to_string());

        let request = CStoreRequest {
            presentation_context_id: message.presentation_context_id,
            message_id,
            sop_class_uid: sop_class_uid.clone(),
            sop_instance_uid: sop_instance_uid.clone(),
            transfer_syntax_uid,
            data: message.data.unwrap_or_default(),
            move_originator: command.move_originator_ae_title().and_then(|aet| {
                command
                    .move_originator_message_id()
                    .map(|id| (aet, id))
            }),
        };

        let mut handler = self.handlers.on_c_store.take();
        let status = match &mut handler {
            Some(handler) => handler(&request),
            None => STATUS_SOP_CLASS_NOT_SUPPORTED,
        };
        self.handlers.on_c_store = handler;

        self.send_message(
            message.presentation_context_id,
            CommandSet::c_store_rsp(message_id, &sop_class_uid, &sop_instance_uid, status),
            None,
        )
    }

    /// Check for an in-band C-CANCEL for the given message.
    ///
    /// Any other PDU is left in order behind the cancel check,
    /// so this must only be called between responses.
    fn cancel_requested(&mut self, message_id: u16) -> Result<bool> {
        let mut assembler = MessageAssembler::new();
        while let Some(pdu) = self.try_receive()? {
            let values = match pdu {
                Pdu::PData { data } => data,
                // anything else ends the exchange
                _ => return Ok(false),
            };
            for pdv in values {
                if let Some(AssembledPart::Command { data, .. }) = assembler.push(pdv)? {
                    let command = CommandSet::read(&data)?;
                    if command.command_field()? == CommandField::CCancelRq
                        && command.message_id_being_responded_to()? == message_id
                    {
                        return Ok(true);
                    }
                    tracing::debug!(
                        "discarding non-cancel message received between responses"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    /// Run the service class provider loop on this association,
    /// dispatching every inbound request to the installed handlers
    /// until the peer releases or aborts the association.
    pub fn serve(&mut self) -> Result<()> {
        if let Some(mut on_established) = self.handlers.on_established.take() {
            let indication = AAssociate {
                mode: Mode::Indication,
                calling_ae_title: self.peer_ae_title().to_string(),
                called_ae_title: self.local_ae_title().to_string(),
                application_context_name: self.application_context_name().to_string(),
                presentation_contexts_proposed: Vec::new(),
                presentation_contexts_result: self
                    .presentation_contexts()
                    .iter()
                    .map(|pc| PresentationContextResult {
                        id: pc.id,
                        reason: pc.reason.clone(),
                        transfer_syntax: pc.transfer_syntax.clone(),
                    })
                    .collect(),
                user_variables: self.peer_user_variables().to_vec(),
                result: Some(AssociateResult::Accepted),
            };
            on_established(&indication);
            self.handlers.on_established = Some(on_established);
        }

        let outcome = self.serve_loop();
        match &outcome {
            Ok(()) | Err(Error::PeerReleased) => {
                if let Some(mut on_released) = self.handlers.on_released.take() {
                    on_released();
                    self.handlers.on_released = Some(on_released);
                }
            }
            Err(_) => {
                if let Some(mut on_aborted) = self.handlers.on_aborted.take() {
                    on_aborted();
                    self.handlers.on_aborted = Some(on_aborted);
                }
            }
        }
        match outcome {
            Err(Error::PeerReleased) => Ok(()),
            other => other,
        }
    }

    fn serve_loop(&mut self) -> Result<()> {
        loop {
            let message = match self.receive_inbound()? {
                Inbound::Message(message) => message,
                Inbound::Released => return Ok(()),
            };

            let command_field = message.command.command_field()?;
            match command_field {
                CommandField::CEchoRq => self.dispatch_echo(message)?,
                CommandField::CStoreRq => self.dispatch_store(message)?,
                CommandField::CFindRq => self.dispatch_find(message)?,
                CommandField::CGetRq => self.dispatch_get(message)?,
                CommandField::CMoveRq => self.dispatch_move(message)?,
                CommandField::NGetRq
                | CommandField::NSetRq
                | CommandField::NCreateRq
                | CommandField::NDeleteRq
                | CommandField::NActionRq
                | CommandField::NEventReportRq => self.dispatch_normalized(message)?,
                CommandField::CCancelRq => {
                    // no operation in progress to cancel
                    tracing::debug!("ignoring C-CANCEL with no pending operation");
                }
                command_field => {
                    tracing::warn!("unexpected {:?} message in provider loop", command_field);
                    return Err(Error::UnexpectedMessage { command_field });
                }
            }
        }
    }

    fn dispatch_echo(&mut self, message: DimseMessage) -> Result<()> {
        let message_id = message.command.message_id()?;
        let sop_class_uid = message
            .command
            .affected_sop_class_uid()
            .unwrap_or_else(|| "1.2.840.10008.1.1".to_string());
        let request = CEchoRequest {
            presentation_context_id: message.presentation_context_id,
            message_id,
            sop_class_uid: sop_class_uid.clone(),
        };
        let mut handler = self.handlers.on_c_echo.take();
        let status = match &mut handler {
            Some(handler) => handler(&request),
            // verification is answered positively by default
            None => 0x0000,
        };
        self.handlers.on_c_echo = handler;

        self.send_message(
            message.presentation_context_id,
            CommandSet::c_echo_rsp(message_id, &sop_class_uid, status),
            None,
        )
    }

    fn query_request(&mut self, message: &DimseMessage) -> Result<(QueryRequest, String)> {
        let message_id = message.command.message_id()?;
        let sop_class_uid = message.command.affected_sop_class_uid().unwrap_or_default();
        let transfer_syntax = self
            .context_by_id(message.presentation_context_id)
            .map(|pc| pc.transfer_syntax)
            .unwrap_or_else(|| crate::negotiation::IMPLICIT_VR_LE.to_string());
        let identifier = match &message.data {
            Some(data) => read_dataset(data, &transfer_syntax)?,
            None => return Err(Error::MissingDataSet),
        };
        if self.options.log_request_identifiers {
            tracing::info!("query identifier: {:?}", identifier);
        }
        Ok((
            QueryRequest {
                presentation_context_id: message.presentation_context_id,
                message_id,
                sop_class_uid,
                identifier,
            },
            transfer_syntax,
        ))
    }

    fn dispatch_find(&mut self, message: DimseMessage) -> Result<()> {
        let context_id = message.presentation_context_id;
        let (request, transfer_syntax) = self.query_request(&message)?;
        let message_id = request.message_id;
        let sop_class_uid = request.sop_class_uid.clone();

        let mut handler = match self.handlers.on_c_find.take() {
            Some(handler) => handler,
            None => {
                return self.send_message(
                    context_id,
                    CommandSet::c_find_rsp(
                        message_id,
                        &sop_class_uid,
                        STATUS_SOP_CLASS_NOT_SUPPORTED,
                    ),
                    None,
                );
            }
        };
        let responses = handler(&request);
        self.handlers.on_c_find = Some(handler);

        let mut outcome = Ok(());
        let mut final_sent = false;
        for (status, identifier) in responses {
            // a cancel request ends the sequence of matches
            if self.cancel_requested(message_id)? {
                self.send_message(
                    context_id,
                    CommandSet::c_find_rsp(message_id, &sop_class_uid, STATUS_CANCEL),
                    None,
                )?;
                final_sent = true;
                break;
            }

            let data = identifier
                .as_ref()
                .map(|identifier| write_dataset(identifier, &transfer_syntax))
                .transpose()?;
            self.send_message(
                context_id,
                CommandSet::c_find_rsp(message_id, &sop_class_uid, status),
                data,
            )?;
            if !is_pending(status) {
                final_sent = true;
                break;
            }
        }
        if !final_sent {
            outcome = self.send_message(
                context_id,
                CommandSet::c_find_rsp(message_id, &sop_class_uid, 0x0000),
                None,
            );
        }
        outcome
    }

    fn dispatch_get(&mut self, message: DimseMessage) -> Result<()> {
        let context_id = message.presentation_context_id;
        let (request, _) = self.query_request(&message)?;
        let request = RetrieveRequest {
            presentation_context_id: request.presentation_context_id,
            message_id: request.message_id,
            sop_class_uid: request.sop_class_uid,
            identifier: request.identifier,
            move_destination: None,
        };
        let message_id = request.message_id;
        let sop_class_uid = request.sop_class_uid.clone();

        let mut handler = match self.handlers.on_c_get.take() {
            Some(handler) => handler,
            None => {
                return self.send_message(
                    context_id,
                    CommandSet::c_get_rsp(
                        message_id,
                        &sop_class_uid,
                        STATUS_SOP_CLASS_NOT_SUPPORTED,
                        SubOperations::default(),
                    ),
                    None,
                );
            }
        };
        let datasets = handler(&request);
        self.handlers.on_c_get = Some(handler);

        let mut completed: u16 = 0;
        let mut failed: u16 = 0;
        let mut cancelled = false;
        for dataset in datasets {
            if self.cancel_requested(message_id)? {
                cancelled = true;
                break;
            }
            match self.sub_store(&dataset) {
                Ok(status) if super::StatusType::of(status) == super::StatusType::Success => {
                    completed += 1;
                }
                Ok(_) => failed += 1,
                Err(e) => {
                    tracing::warn!("C-STORE sub-operation failed: {}", e);
                    failed += 1;
                }
            }
        }

        let status = if cancelled {
            STATUS_CANCEL
        } else if failed > 0 {
            STATUS_SUBOPS_ONE_OR_MORE_FAILURES
        } else {
            0x0000
        };
        self.send_message(
            context_id,
            CommandSet::c_get_rsp(
                message_id,
                &sop_class_uid,
                status,
                SubOperations {
                    remaining: Some(0),
                    completed: Some(completed),
                    failed: Some(failed),
                    warning: Some(0),
                },
            ),
            None,
        )
    }

    /// Deliver one data set back to the peer
    /// through a C-STORE sub-operation on this association.
    fn sub_store(&mut self, dataset: &InMemDicomObject) -> Result<u16> {
        let sop_class_uid = text_attribute(dataset, tags::SOP_CLASS_UID, "SOP Class UID")?;
        let sop_instance_uid =
            text_attribute(dataset, tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
        // sub-operations need a context where the peer agreed
        // to play the storage SCP role
        let context = self
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.reason == PresentationContextResultReason::Acceptance
                    && pc.abstract_syntax == sop_class_uid
                    && pc.scp_role
            })
            .cloned()
            .context(NoAcceptableContextSnafu {
                sop_class_uid: sop_class_uid.clone(),
            })?;

        let data = write_dataset(dataset, &context.transfer_syntax)?;
        let message_id = self.next_message_id();
        self.send_message(
            context.id,
            CommandSet::c_store_rq(
                message_id,
                &sop_class_uid,
                &sop_instance_uid,
                Priority::Medium,
                None,
            ),
            Some(data),
        )?;

        let message = self.receive_message()?;
        expect_response(&message, CommandField::CStoreRsp, message_id)?;
        Ok(message.command.status()?)
    }

    fn dispatch_move(&mut self, message: DimseMessage) -> Result<()> {
        let context_id = message.presentation_context_id;
        let move_destination = message.command.move_destination();
        let (request, transfer_syntax) = self.query_request(&message)?;
        let request = RetrieveRequest {
            presentation_context_id: request.presentation_context_id,
            message_id: request.message_id,
            sop_class_uid: request.sop_class_uid,
            identifier: request.identifier,
            move_destination,
        };
        let message_id = request.message_id;
        let sop_class_uid = request.sop_class_uid.clone();

        let mut handler = match self.handlers.on_c_move.take() {
            Some(handler) => handler,
            None => {
                return self.send_message(
                    context_id,
                    CommandSet::c_move_rsp(
                        message_id,
                        &sop_class_uid,
                        STATUS_SOP_CLASS_NOT_SUPPORTED,
                        SubOperations::default(),
                    ),
                    None,
                );
            }
        };
        let responses = handler(&request);
        self.handlers.on_c_move = Some(handler);

        let mut final_sent = false;
        for (status, identifier) in responses {
            if self.cancel_requested(message_id)? {
                self.send_message(
                    context_id,
                    CommandSet::c_move_rsp(
                        message_id,
                        &sop_class_uid,
                        STATUS_CANCEL,
                        SubOperations::default(),
                    ),
                    None,
                )?;
                final_sent = true;
                break;
            }
            let data = identifier
                .as_ref()
                .map(|identifier| write_dataset(identifier, &transfer_syntax))
                .transpose()?;
            self.send_message(
                context_id,
                CommandSet::c_move_rsp(
                    message_id,
                    &sop_class_uid,
                    status,
                    SubOperations::default(),
                ),
                data,
            )?;
            if !is_pending(status) {
                final_sent = true;
                break;
            }
        }
        if !final_sent {
            self.send_message(
                context_id,
                CommandSet::c_move_rsp(message_id, &sop_class_uid, 0x0000, SubOperations::default()),
                None,
            )?;
        }
        Ok(())
    }

    fn dispatch_normalized(&mut self, message: DimseMessage) -> Result<()> {
        let command_field = message.command.command_field()?;
        let message_id = message.command.message_id()?;
        let context_id = message.presentation_context_id;
        let transfer_syntax = self
            .context_by_id(context_id)
            .map(|pc| pc.transfer_syntax)
            .unwrap_or_else(|| crate::negotiation::IMPLICIT_VR_LE.to_string());
        let sop_class_uid = message
            .command
            .requested_sop_class_uid()
            .or_else(|| message.command.affected_sop_class_uid())
            .unwrap_or_default();
        let data = message.dataset(&transfer_syntax)?;

        let request = NRequest {
            presentation_context_id: context_id,
            message_id,
            command_field,
            command: message.command,
            data,
        };

        let slot = match command_field {
            CommandField::NGetRq => &mut self.handlers.on_n_get,
            CommandField::NSetRq => &mut self.handlers.on_n_set,
            CommandField::NCreateRq => &mut self.handlers.on_n_create,
            CommandField::NDeleteRq => &mut self.handlers.on_n_delete,
            CommandField::NActionRq => &mut self.handlers.on_n_action,
            _ => &mut self.handlers.on_n_event_report,
        };
        let mut handler = slot.take();
        let (status, attribute_list) = match &mut handler {
            Some(handler) => handler(&request),
            None => (STATUS_SOP_CLASS_NOT_SUPPORTED, None),
        };
        let slot = match command_field {
            CommandField::NGetRq => &mut self.handlers.on_n_get,
            CommandField::NSetRq => &mut self.handlers.on_n_set,
            CommandField::NCreateRq => &mut self.handlers.on_n_create,
            CommandField::NDeleteRq => &mut self.handlers.on_n_delete,
            CommandField::NActionRq => &mut self.handlers.on_n_action,
            _ => &mut self.handlers.on_n_event_report,
        };
        *slot = handler;

        let command = match command_field {
            CommandField::NGetRq => CommandSet::n_get_rsp(message_id, &sop_class_uid, status),
            CommandField::NSetRq => CommandSet::n_set_rsp(message_id, &sop_class_uid, status),
            CommandField::NCreateRq => CommandSet::n_create_rsp(message_id, &sop_class_uid, status),
            CommandField::NDeleteRq => CommandSet::n_delete_rsp(message_id, &sop_class_uid, status),
            CommandField::NActionRq => CommandSet::n_action_rsp(message_id, &sop_class_uid, status),
            _ => CommandSet::n_event_report_rsp(message_id, &sop_class_uid, status),
        };
        let data = attribute_list
            .as_ref()
            .map(|object| write_dataset(object, &transfer_syntax))
            .transpose()?;
        self.send_message(context_id, command, data)
    }
}

/// An iterator over the responses of a pending multi-response service
/// (C-FIND, C-GET, C-MOVE).
///
/// Every pending response is yielded as `(status, identifier)`;
/// the first non-pending status ends the iteration
/// after being yielded.
/// Dropping the iterator before the final status leaves the
/// outstanding responses on the association;
/// use [`cancel`](Self::cancel) to end the operation early.
#[must_use]
pub struct ResponseIter<'a> {
    association: &'a mut Association,
    context: PresentationContextNegotiated,
    message_id: u16,
    expected: CommandField,
    finished: bool,
}

impl<'a> ResponseIter<'a> {
    fn new(
        association: &'a mut Association,
        context: PresentationContextNegotiated,
        message_id: u16,
        expected: CommandField,
    ) -> Self {
        ResponseIter {
            association,
            context,
            message_id,
            expected,
            finished: false,
        }
    }

    /// The message identifier of the request being answered.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Request cancellation of the pending operation.
    ///
    /// The provider acknowledges with a final cancel status,
    /// which is still yielded by the iterator.
    pub fn cancel(&mut self) -> Result<()> {
        self.association.send_message(
            self.context.id,
            CommandSet::c_cancel_rq(self.message_id),
            None,
        )
    }
}

impl Iterator for ResponseIter<'_> {
    type Item = Result<(u16, Option<InMemDicomObject>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let message = match self.association.receive_message() {
                Ok(message) => message,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            let command_field = match message.command.command_field() {
                Ok(command_field) => command_field,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            };

            // a C-GET may interleave C-STORE sub-operations
            // with its responses
            if command_field == CommandField::CStoreRq {
                if let Err(e) = self.association.dispatch_store(message) {
                    self.finished = true;
                    return Some(Err(e));
                }
                continue;
            }

            if command_field != self.expected {
                self.finished = true;
                return Some(Err(Error::UnexpectedMessage { command_field }));
            }

            let item: Result<(u16, Option<InMemDicomObject>)> = (|| {
                let responded_to = message.command.message_id_being_responded_to()?;
                snafu::ensure!(
                    responded_to == self.message_id,
                    MismatchedResponseSnafu {
                        expected: self.message_id,
                        got: responded_to,
                    }
                );
                let status = message.command.status()?;
                let identifier = message.dataset(&self.context.transfer_syntax)?;
                Ok((status, identifier))
            })();

            match item {
                Ok((status, identifier)) => {
                    if !is_pending(status) {
                        self.finished = true;
                    }
                    if self.association.options.log_response_identifiers {
                        if let Some(identifier) = &identifier {
                            tracing::info!("response identifier: {:?}", identifier);
                        }
                    }
                    return Some(Ok((status, identifier)));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn expect_response(
    message: &DimseMessage,
    expected: CommandField,
    message_id: u16,
) -> Result<()> {
    let command_field = message.command.command_field()?;
    snafu::ensure!(
        command_field == expected,
        UnexpectedMessageSnafu { command_field }
    );
    let responded_to = message.command.message_id_being_responded_to()?;
    snafu::ensure!(
        responded_to == message_id,
        MismatchedResponseSnafu {
            expected: message_id,
            got: responded_to,
        }
    );
    Ok(())
}

fn text_attribute(
    dataset: &InMemDicomObject,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<String> {
    let element = dataset.get(tag).context(MissingAttributeSnafu { name })?;
    let value = element
        .to_str()
        .map_err(|_| Error::MissingAttribute { name })?;
    Ok(value
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}
