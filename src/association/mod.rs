//! DICOM association module
//!
//! This module contains the abstractions for establishing and driving
//! associations between DICOM application entities over TCP/IP.
//!
//! - [`client`] negotiates outbound associations
//!   ([`ClientAssociationOptions`](client::ClientAssociationOptions)).
//! - [`server`] accepts inbound association requests
//!   ([`ServerAssociationOptions`](server::ServerAssociationOptions)).
//! - Both produce an [`Association`],
//!   the object which exclusively owns the connection,
//!   drives the upper layer state machine over it,
//!   and offers the DIMSE services
//!   (see the [`dimse`](crate::dimse) module).
//!
//! An association spawns one dedicated thread that reads and decodes
//! PDUs from the socket and feeds them into an event queue.
//! All state transitions happen on the thread that owns the
//! [`Association`] value, so PDUs are handled in wire order.

use bytes::BytesMut;
use snafu::{ResultExt, Snafu};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::config::NetworkOptions;
use crate::dimse::service::ServiceHandlers;
use crate::machine::{Action, Event, Role, State, StateMachine};
use crate::primitive::{AAbort, APAbort, ARelease, Indication, Mode, PDataPrimitive};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu,
    PresentationContextNegotiated, UserVariableItem, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

pub mod client;
pub mod pdata;
pub mod server;

pub use pdata::PDataWriter;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax,

    /// could not connect to peer node
    Connect { source: std::io::Error },

    /// could not configure the socket
    ConfigureSocket { source: std::io::Error },

    /// failed to encode PDU message
    SendPdu {
        #[snafu(source(from(crate::pdu::writer::Error, Box::new)))]
        source: Box<crate::pdu::writer::Error>,
    },

    /// failed to send PDU message on the wire
    WireSend { source: std::io::Error },

    /// failed to receive PDU message from the wire
    WireReceive { source: std::io::Error },

    /// failed to decode an incoming PDU message
    Receive {
        #[snafu(source(from(crate::pdu::reader::Error, Box::new)))]
        source: Box<crate::pdu::reader::Error>,
    },

    #[snafu(display(
        "PDU is too large to be sent to the peer: {} bytes, maximum is {}",
        length,
        maximum
    ))]
    SendTooLongPdu { length: usize, maximum: u32 },

    #[snafu(display(
        "incoming PDU is too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    ReceivedPduTooLarge { pdu_length: u32, max_pdu_length: u32 },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the other node
        pdu: Box<Pdu>,
    },

    #[snafu(display("unknown PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnknownPdu {
        /// the PDU obtained from the other node, of variant Unknown
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch { expected: u16, got: u16 },

    /// the association request was rejected by the peer
    #[snafu(display("association rejected ({:?}, {:?})", association_rj.result, association_rj.source))]
    Rejected { association_rj: AssociationRJ },

    /// the association was aborted
    #[snafu(display("association aborted ({:?})", origin))]
    Aborted { origin: AbortRQSource },

    /// the peer released the association
    Released,

    /// the transport connection was closed by the peer
    ConnectionClosed,

    /// the operation did not complete within the configured time
    Timeout,

    /// the association machinery is no longer running
    Disconnected,

    /// a service primitive was issued in the wrong association state
    #[snafu(display("operation not allowed in the current association state"))]
    StateViolation {
        #[snafu(source(from(crate::machine::Error, Box::new)))]
        source: Box<crate::machine::Error>,
    },

    /// no presentation contexts were accepted by the peer
    NoAcceptedPresentationContexts,

    /// the given application entity title is not valid
    #[snafu(display("invalid application entity title `{}`", ae_title))]
    InvalidAeTitle { ae_title: String },

    /// the given UID does not conform to the rules of the standard
    #[snafu(display("invalid UID `{}`", uid))]
    InvalidUid { uid: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Timeout configuration for the underlying TCP socket
/// and the protocol timers running over it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// timeout for individual socket read operations
    pub read_timeout: Option<Duration>,
    /// timeout for individual socket write operations
    pub write_timeout: Option<Duration>,
    /// timeout for establishing the TCP connection
    pub connection_timeout: Option<Duration>,
}

/// Read one PDU from the wire through the given reusable buffer.
///
/// The PDU length field is checked before the body is read,
/// so that an absurd length declaration
/// cannot cause an unbounded allocation.
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Option<Pdu>>
where
    R: Read,
{
    buffer.clear();

    let mut head = [0u8; PDU_HEADER_SIZE as usize];
    if let Err(e) = reader.read_exact(&mut head) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(WireReceiveSnafu);
    }

    let pdu_length = u32::from_be_bytes([head[2], head[3], head[4], head[5]]);
    let limit = if strict {
        max_pdu_length
    } else {
        MAXIMUM_PDU_SIZE
    };
    snafu::ensure!(
        pdu_length <= limit,
        ReceivedPduTooLargeSnafu {
            pdu_length,
            max_pdu_length: limit,
        }
    );

    buffer.resize(pdu_length as usize, 0);
    reader.read_exact(&mut buffer[..]).context(WireReceiveSnafu)?;

    read_pdu(&mut (&head[..]).chain(&buffer[..]), max_pdu_length, strict).context(ReceiveSnafu)
}

/// What the socket reader thread observed.
#[derive(Debug)]
pub(crate) enum ReaderEvent {
    /// a complete PDU arrived
    Pdu(Pdu),
    /// the wire or the decoder failed; the stream is unusable
    Failed(Error),
    /// the peer closed the transport connection
    Closed,
}

fn spawn_reader(
    mut stream: TcpStream,
    sender: Sender<ReaderEvent>,
    max_pdu_length: u32,
    strict: bool,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buffer = BytesMut::with_capacity(
            (max_pdu_length.min(crate::pdu::DEFAULT_MAX_PDU * 4) + PDU_HEADER_SIZE) as usize,
        );
        loop {
            match read_pdu_from_wire(&mut stream, &mut buffer, max_pdu_length, strict) {
                Ok(Some(pdu)) => {
                    if sender.send(ReaderEvent::Pdu(pdu)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = sender.send(ReaderEvent::Closed);
                    break;
                }
                Err(e) => {
                    let _ = sender.send(ReaderEvent::Failed(e));
                    break;
                }
            }
        }
    })
}

/// Everything the negotiation phase hands over to the runtime.
pub(crate) struct AssociationSetup {
    pub socket: TcpStream,
    pub role: Role,
    pub local_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub peer_max_pdu_length: u32,
    pub max_pdu_length: u32,
    pub peer_ae_title: String,
    pub peer_user_variables: Vec<UserVariableItem>,
    pub acse_timeout: Duration,
    pub dimse_timeout: Option<Duration>,
    pub network_timeout: Option<Duration>,
    pub strict: bool,
    pub options: NetworkOptions,
}

/// An established DICOM upper layer association.
///
/// The value exclusively owns the transport connection:
/// dropping it shuts the connection down,
/// after attempting an orderly release for association requestors.
///
/// DIMSE operations (`send_c_echo`, `send_c_store`, `send_c_find`, …)
/// are provided by the [`dimse::service`](crate::dimse::service) module.
#[derive(Debug)]
pub struct Association {
    machine: StateMachine,
    /// write half; the reader thread owns a clone for reading
    socket: TcpStream,
    events: Receiver<ReaderEvent>,
    reader: Option<std::thread::JoinHandle<()>>,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length the peer accepts (our send limit)
    peer_max_pdu_length: u32,
    /// the maximum PDU length this node accepts (our receive limit)
    max_pdu_length: u32,
    local_ae_title: String,
    application_context_name: String,
    peer_ae_title: String,
    peer_user_variables: Vec<UserVariableItem>,
    acse_timeout: Duration,
    dimse_timeout: Option<Duration>,
    network_timeout: Option<Duration>,
    /// reusable buffer for sending PDUs, prevents reallocation per send
    write_buffer: Vec<u8>,
    /// set once the association ended, by release or abort
    closed: bool,
    /// next DIMSE message identifier
    pub(crate) message_id: u16,
    pub(crate) handlers: ServiceHandlers,
    pub(crate) options: NetworkOptions,
}

impl Association {
    pub(crate) fn start(setup: AssociationSetup) -> Result<Self> {
        let AssociationSetup {
            socket,
            role,
            local_ae_title,
            application_context_name,
            presentation_contexts,
            peer_max_pdu_length,
            max_pdu_length,
            peer_ae_title,
            peer_user_variables,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            strict,
            options,
        } = setup;

        // the reader thread must not inherit the negotiation read timeout
        socket.set_read_timeout(None).context(ConfigureSocketSnafu)?;
        let read_stream = socket.try_clone().context(ConfigureSocketSnafu)?;
        let (sender, events) = std::sync::mpsc::channel();
        let reader = spawn_reader(read_stream, sender, max_pdu_length, strict);

        let mut machine = StateMachine::new(role);
        // replay the establishment path taken by the negotiation phase
        match role {
            Role::Requestor => {
                machine.apply(Event::AAssociateRq).context(StateViolationSnafu)?;
                machine
                    .apply(Event::TransportConnConfirm)
                    .context(StateViolationSnafu)?;
                machine
                    .apply(Event::AAssociateAcPdu)
                    .context(StateViolationSnafu)?;
            }
            Role::Acceptor => {
                machine
                    .apply(Event::TransportConnIndication)
                    .context(StateViolationSnafu)?;
                machine
                    .apply(Event::AAssociateRqPdu)
                    .context(StateViolationSnafu)?;
                machine
                    .apply(Event::AAssociateResponseAccept)
                    .context(StateViolationSnafu)?;
            }
        }
        debug_assert!(machine.is_established());

        Ok(Association {
            machine,
            socket,
            events,
            reader: Some(reader),
            presentation_contexts,
            peer_max_pdu_length,
            max_pdu_length,
            local_ae_title,
            application_context_name,
            peer_ae_title,
            peer_user_variables,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            write_buffer: Vec::with_capacity(crate::pdu::DEFAULT_MAX_PDU as usize),
            closed: false,
            message_id: 1,
            handlers: ServiceHandlers::default(),
            options,
        })
    }

    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// Obtain this node's application entity title.
    pub fn local_ae_title(&self) -> &str {
        &self.local_ae_title
    }

    /// The application context name agreed upon for this association.
    pub fn application_context_name(&self) -> &str {
        &self.application_context_name
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// The user information sub-items received from the peer.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// The maximum PDU length admitted by the peer,
    /// which bounds every PDU sent on this association.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// The maximum PDU length this application entity
    /// is expecting to receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// The current state of the upper layer state machine.
    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// Whether the association is established and ready for data transfer.
    pub fn is_established(&self) -> bool {
        self.machine.is_established()
    }

    /// The DIMSE timeout:
    /// the admissible inter-PDU silence while a response is awaited.
    pub fn dimse_timeout(&self) -> Option<Duration> {
        self.dimse_timeout
    }

    /// Install the service class handlers used to dispatch
    /// inbound DIMSE requests on this association.
    pub fn set_handlers(&mut self, handlers: ServiceHandlers) {
        self.handlers = handlers;
    }

    /// Allocate the next DIMSE message identifier.
    pub(crate) fn next_message_id(&mut self) -> u16 {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1).max(1);
        id
    }

    /// Encode and transmit a PDU without driving the state machine.
    pub(crate) fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        if let Pdu::PData { .. } = pdu {
            let maximum = self.peer_max_pdu_length + PDU_HEADER_SIZE;
            snafu::ensure!(
                self.write_buffer.len() <= maximum as usize,
                SendTooLongPduSnafu {
                    length: self.write_buffer.len(),
                    maximum,
                }
            );
        }
        self.socket
            .write_all(&self.write_buffer)
            .context(WireSendSnafu)
    }

    /// Send a PDU message to the peer,
    /// driving the state machine with the matching service primitive.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let event = match pdu {
            Pdu::PData { .. } => Some(Event::PDataRq),
            Pdu::ReleaseRQ => Some(Event::AReleaseRq),
            Pdu::ReleaseRP => Some(Event::AReleaseRsp),
            Pdu::AbortRQ { .. } => Some(Event::AAbortRq),
            _ => None,
        };
        if let Some(event) = event {
            let action = self.machine.apply(event).context(StateViolationSnafu)?;
            if action == Action::Aa2 {
                // abort before the connection opened: nothing to send
                self.shutdown();
                return Ok(());
            }
        }
        self.send_pdu(pdu)
    }

    /// Obtain a writer to send data set bytes on the given
    /// presentation context,
    /// fragmenting them over as many PDUs as necessary.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut TcpStream> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            crate::pdu::PDataValueType::Data,
            self.peer_max_pdu_length,
        )
    }

    fn next_reader_event(&mut self, timeout: Option<Duration>) -> Result<ReaderEvent> {
        match timeout {
            Some(timeout) => self.events.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::Disconnected,
            }),
            None => self.events.recv().map_err(|_| Error::Disconnected),
        }
    }

    /// Check for an already received PDU without blocking.
    pub(crate) fn try_receive(&mut self) -> Result<Option<Pdu>> {
        match self.events.try_recv() {
            Ok(event) => self.process_reader_event(event),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Read the next PDU from the peer.
    ///
    /// Blocks until a PDU arrives or the network timeout expires.
    pub fn receive(&mut self) -> Result<Pdu> {
        self.receive_timeout_opt(self.network_timeout)
    }

    /// Read the next PDU from the peer,
    /// waiting no longer than the given timeout.
    ///
    /// Timer expiry is treated as a provider abort:
    /// an A-ABORT PDU is sent and the connection is shut down.
    pub(crate) fn receive_timeout_opt(&mut self, timeout: Option<Duration>) -> Result<Pdu> {
        loop {
            match self.next_reader_event(timeout) {
                Ok(event) => match self.process_reader_event(event)? {
                    Some(pdu) => return Ok(pdu),
                    None => continue,
                },
                Err(Error::Timeout) => {
                    tracing::warn!("no PDU received in time, aborting association");
                    self.abort_provider(AbortRQServiceProviderReason::ReasonNotSpecified);
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive the state machine with one observation
    /// from the reader thread.
    ///
    /// Returns `Ok(None)` when the observation was consumed
    /// without surfacing a PDU (AA-6, AA-7).
    fn process_reader_event(&mut self, event: ReaderEvent) -> Result<Option<Pdu>> {
        match event {
            ReaderEvent::Pdu(pdu) => {
                let machine_event = match &pdu {
                    Pdu::AssociationAC { .. } => Event::AAssociateAcPdu,
                    Pdu::AssociationRJ { .. } => Event::AAssociateRjPdu,
                    Pdu::AssociationRQ { .. } => Event::AAssociateRqPdu,
                    Pdu::PData { .. } => Event::PDataTfPdu,
                    Pdu::ReleaseRQ => Event::AReleaseRqPdu,
                    Pdu::ReleaseRP => Event::AReleaseRpPdu,
                    Pdu::AbortRQ { .. } => Event::AAbortPdu,
                    Pdu::Unknown { .. } => Event::InvalidPdu,
                };
                // every received-PDU event has a transition in every state
                let action = self
                    .machine
                    .apply(machine_event)
                    .context(StateViolationSnafu)?;
                match action {
                    Action::Dt2 | Action::Ar6 => {
                        if self.handlers.on_indication.is_some() {
                            if let Pdu::PData { data } = &pdu {
                                self.notify_indication(&Indication::Data(PDataPrimitive {
                                    values: data.clone(),
                                }));
                            }
                        }
                        Ok(Some(pdu))
                    }
                    Action::Ar2 => {
                        self.notify_indication(&Indication::Release(ARelease {
                            mode: Mode::Indication,
                        }));
                        Ok(Some(pdu))
                    }
                    Action::Ar3 | Action::Ar8 | Action::Ar10 => Ok(Some(pdu)),
                    Action::Aa3 => {
                        // peer abort indication
                        self.shutdown();
                        let origin = match pdu {
                            Pdu::AbortRQ { source } => source,
                            _ => AbortRQSource::ServiceUser,
                        };
                        tracing::debug!("association aborted by peer: {:?}", origin);
                        self.notify_indication(&Indication::Abort(AAbort {
                            source: origin.clone(),
                        }));
                        Err(Error::Aborted { origin })
                    }
                    Action::Aa6 => {
                        // late PDU while awaiting transport closure
                        tracing::trace!("ignoring {} PDU", pdu.short_description());
                        Ok(None)
                    }
                    Action::Aa7 => {
                        self.send_abort_pdu(AbortRQServiceProviderReason::UnexpectedPdu);
                        Ok(None)
                    }
                    Action::Aa1 | Action::Aa8 => {
                        // protocol violation by the peer
                        let reason = match &pdu {
                            Pdu::Unknown { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
                            _ => AbortRQServiceProviderReason::UnexpectedPdu,
                        };
                        self.abort_provider(reason);
                        match pdu {
                            pdu @ Pdu::Unknown { .. } => Err(Error::UnknownPdu { pdu: Box::new(pdu) }),
                            pdu => Err(Error::UnexpectedPdu { pdu: Box::new(pdu) }),
                        }
                    }
                    action => {
                        // establishment actions cannot occur after start
                        tracing::error!("unexpected machine action {:?}", action);
                        Err(Error::UnexpectedPdu { pdu: Box::new(pdu) })
                    }
                }
            }
            ReaderEvent::Failed(e) => {
                // the PDU could not be decoded: invalid PDU event
                if let Ok(Action::Aa8 | Action::Aa1) = self.machine.apply(Event::InvalidPdu) {
                    self.abort_provider(AbortRQServiceProviderReason::InvalidPduParameter);
                }
                Err(e)
            }
            ReaderEvent::Closed => {
                let _ = self.machine.apply(Event::TransportClosed);
                self.shutdown();
                tracing::debug!("transport connection closed by peer");
                self.notify_indication(&Indication::ProviderAbort(APAbort {
                    reason: AbortRQServiceProviderReason::ReasonNotSpecified,
                }));
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Deliver an upper layer indication to the installed tap.
    fn notify_indication(&mut self, indication: &Indication) {
        if let Some(mut tap) = self.handlers.on_indication.take() {
            tap(indication);
            self.handlers.on_indication = Some(tap);
        }
    }

    /// Send a provider initiated A-ABORT and shut the connection down,
    /// honoring AA-8.
    pub(crate) fn abort_provider(&mut self, reason: AbortRQServiceProviderReason) {
        self.send_abort_pdu(reason);
        self.shutdown();
        let _ = self.machine.apply(Event::TransportClosed);
    }

    fn send_abort_pdu(&mut self, reason: AbortRQServiceProviderReason) {
        let _ = self.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        });
    }

    /// Gracefully release the association.
    ///
    /// Returns once the peer confirms the release,
    /// resolving a release collision if both sides requested it.
    /// Releasing an association that already ended has no effect.
    pub fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.machine.apply(Event::AReleaseRq).is_err() {
            // not in data transfer state anymore
            self.closed = true;
            return Ok(());
        }
        let outcome = self.release_inner();
        self.closed = true;
        self.shutdown();
        let _ = self.machine.apply(Event::TransportClosed);
        if let Err(e) = &outcome {
            tracing::debug!("association release failed: {}", e);
        } else {
            tracing::debug!("association released");
        }
        outcome
    }

    fn release_inner(&mut self) -> Result<()> {
        self.send_pdu(&Pdu::ReleaseRQ)?;
        loop {
            let pdu = self.receive_timeout_opt(Some(self.acse_timeout))?;
            match pdu {
                Pdu::ReleaseRP => match self.machine.state() {
                    // release confirmed (AR-3 was applied on receive)
                    State::Sta1 => return Ok(()),
                    // collision, acceptor side: confirm and answer
                    State::Sta12 => {
                        self.machine
                            .apply(Event::AReleaseRsp)
                            .context(StateViolationSnafu)?;
                        self.send_pdu(&Pdu::ReleaseRP)?;
                        return Ok(());
                    }
                    state => {
                        tracing::warn!("unexpected state {:?} after A-RELEASE-RP", state);
                        return Ok(());
                    }
                },
                Pdu::ReleaseRQ => {
                    // release collision (PS3.8 §9.2.2.4):
                    // the requestor side answers immediately
                    // and keeps waiting for the peer's confirmation
                    if self.machine.state() == State::Sta9 {
                        self.machine
                            .apply(Event::AReleaseRsp)
                            .context(StateViolationSnafu)?;
                        self.send_pdu(&Pdu::ReleaseRP)?;
                    }
                }
                Pdu::PData { .. } => {
                    // data arriving after the release request is discarded
                    tracing::debug!("discarding P-DATA-TF received during release");
                }
                pdu => {
                    return Err(Error::UnexpectedPdu { pdu: Box::new(pdu) });
                }
            }
        }
    }

    /// Abort the association immediately,
    /// notifying the peer with an A-ABORT PDU
    /// before shutting the connection down.
    pub fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let outcome = match self.machine.apply(Event::AAbortRq) {
            Ok(Action::Aa1) => self.send_pdu(&Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            }),
            // AA-2 or a state with nothing left to notify
            _ => Ok(()),
        };
        self.closed = true;
        self.shutdown();
        let _ = self.machine.apply(Event::TransportClosed);
        tracing::debug!("association aborted");
        outcome
    }

    fn shutdown(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Shut the transport connection down
    /// and bring the state machine back to idle.
    pub(crate) fn close_transport(&mut self) {
        self.shutdown();
        let _ = self.machine.apply(Event::TransportClosed);
    }

    /// Whether the association has ended, by release or abort.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if !self.closed && self.machine.role() == Role::Requestor {
            let _ = self.release();
        }
        self.shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}
