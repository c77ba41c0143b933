//! Association requestor module
//!
//! The module provides an abstraction for establishing an association
//! with another DICOM node as the requesting application entity,
//! usually to take the role of a service class user (SCU).
//! See [`ClientAssociationOptions`] for details.

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use std::borrow::Cow;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::{is_conformant_uid, is_valid_ae_title, NetworkOptions};
use crate::machine::Role;
use crate::negotiation::effective_max_pdu;
use crate::pdu::{
    AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, RoleSelection, SopClassCommonExtendedNegotiation,
    UserIdentity, UserVariableItem, DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::{
    read_pdu_from_wire, Association, AssociationSetup, ConfigureSocketSnafu, ConnectSnafu, Error,
    Result, SendPduSnafu, WireSendSnafu,
};

/// The default timeout for association negotiation and release.
pub const DEFAULT_ACSE_TIMEOUT: Duration = Duration::from_secs(30);

/// The default timeout guarding half-open transport connections.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// A DICOM association builder for a requesting node.
/// The outcome of a successful negotiation is an [`Association`].
///
/// # Example
///
/// ```no_run
/// # use dicom_net::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("127.0.0.1:11112")?;
/// let status = association.send_c_echo()?;
/// assert_eq!(status, 0x0000);
/// association.release()?;
/// # Ok(())
/// # }
/// ```
///
/// When no transfer syntax is specified,
/// each proposed presentation context admits
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the fully specified presentation contexts to propose
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    /// abstract syntaxes to propose with the common transfer syntax list
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the common list of transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// SCP/SCU role selections to propose
    role_selections: Vec<RoleSelection>,
    /// SOP class extended negotiation items to propose
    extended_negotiations: Vec<(Cow<'static, str>, Vec<u8>)>,
    /// SOP class common extended negotiation items to propose
    common_extended_negotiations: Vec<SopClassCommonExtendedNegotiation>,
    /// the asynchronous operations window to propose
    async_operations_window: Option<(u16, u16)>,
    /// the user identity to assert
    user_identity: Option<UserIdentity>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// bounds association negotiation and release
    acse_timeout: Duration,
    /// bounds inter-PDU silence during a DIMSE exchange
    dimse_timeout: Option<Duration>,
    /// bounds transport connection establishment and half-open states
    network_timeout: Option<Duration>,
    /// process-wide service options snapshot
    network_options: NetworkOptions,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_selections: Vec::new(),
            extended_negotiations: Vec::new(),
            common_extended_negotiations: Vec::new(),
            async_operations_window: None,
            user_identity: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            acse_timeout: DEFAULT_ACSE_TIMEOUT,
            dimse_timeout: None,
            network_timeout: Some(DEFAULT_NETWORK_TIMEOUT),
            network_options: NetworkOptions::default(),
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context
    /// with its own list of transfer syntaxes,
    /// in order of preference.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax_uid.into(),
            transfer_syntax_uids.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Include this abstract syntax
    /// in the list of proposed presentation contexts,
    /// admitting the transfer syntaxes given via
    /// [`with_transfer_syntax`](Self::with_transfer_syntax).
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids.push(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax in each proposed presentation context
    /// registered via [`with_abstract_syntax`](Self::with_abstract_syntax).
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids.push(transfer_syntax_uid.into());
        self
    }

    /// Propose an SCP/SCU role selection for one SOP class.
    pub fn with_role_selection(
        mut self,
        sop_class_uid: impl Into<String>,
        scu_role: bool,
        scp_role: bool,
    ) -> Self {
        self.role_selections.push(RoleSelection {
            sop_class_uid: sop_class_uid.into(),
            scu_role,
            scp_role,
        });
        self
    }

    /// Attach SOP class extended negotiation data for one SOP class.
    /// The payload is opaque to the upper layer.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, data: Vec<u8>) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.extended_negotiations.push((sop_class_uid.into(), data));
        self
    }

    /// Attach an SOP class common extended negotiation item.
    pub fn with_common_extended_negotiation(
        mut self,
        negotiation: SopClassCommonExtendedNegotiation,
    ) -> Self {
        self.common_extended_negotiations.push(negotiation);
        self
    }

    /// Propose an asynchronous operations window.
    ///
    /// Without this item, operations on the association
    /// are serialized one at a time.
    pub fn async_operations_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_operations_window = Some((invoked, performed));
        self
    }

    /// Assert a user identity on association negotiation.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override the ACSE timeout,
    /// which bounds association negotiation and release.
    ///
    /// The default is 30 seconds.
    pub fn acse_timeout(mut self, timeout: Duration) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Set the DIMSE timeout,
    /// the admissible inter-PDU silence while a response is awaited.
    ///
    /// The default is to wait indefinitely.
    pub fn dimse_timeout(mut self, timeout: Duration) -> Self {
        self.dimse_timeout = Some(timeout);
        self
    }

    /// Override the network timeout,
    /// which bounds transport connection establishment
    /// and guards half-open connections.
    ///
    /// The default is 30 seconds.
    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    /// Replace the process-wide service options snapshot
    /// taken by the association.
    pub fn network_options(mut self, options: NetworkOptions) -> Self {
        self.network_options = options;
        self
    }

    /// Collect the full list of presentation contexts to propose.
    fn proposed_contexts(&self) -> Result<Vec<PresentationContextProposed>> {
        let mut default_transfer_syntaxes: Vec<String> = self
            .transfer_syntax_uids
            .iter()
            .map(|uid| uid.trim().to_string())
            .collect();
        if default_transfer_syntaxes.is_empty() {
            // Explicit VR Little Endian
            default_transfer_syntaxes.push("1.2.840.10008.1.2.1".to_string());
            // Implicit VR Little Endian
            default_transfer_syntaxes.push("1.2.840.10008.1.2".to_string());
        }

        let mut contexts: Vec<PresentationContextProposed> = self
            .presentation_contexts
            .iter()
            .map(|(abstract_syntax, transfer_syntaxes)| PresentationContextProposed {
                id: 0,
                abstract_syntax: abstract_syntax.trim().to_string(),
                transfer_syntaxes: transfer_syntaxes
                    .iter()
                    .map(|uid| uid.trim().to_string())
                    .collect(),
            })
            .collect();
        contexts.extend(self.abstract_syntax_uids.iter().map(|abstract_syntax| {
            PresentationContextProposed {
                id: 0,
                abstract_syntax: abstract_syntax.trim().to_string(),
                transfer_syntaxes: default_transfer_syntaxes.clone(),
            }
        }));

        // presentation context identifiers are odd integers,
        // assigned in proposal order
        for (i, context) in contexts.iter_mut().enumerate() {
            context.id = (i as u8) * 2 + 1;
        }

        // intent must be declared: an association without
        // presentation contexts cannot be used for anything
        ensure!(!contexts.is_empty(), super::MissingAbstractSyntaxSnafu);

        if self.network_options.enforce_uid_conformance {
            for context in &contexts {
                ensure!(
                    is_conformant_uid(&context.abstract_syntax),
                    super::InvalidUidSnafu {
                        uid: context.abstract_syntax.clone(),
                    }
                );
                for ts in &context.transfer_syntaxes {
                    ensure!(
                        is_conformant_uid(ts),
                        super::InvalidUidSnafu { uid: ts.clone() }
                    );
                }
            }
        }

        Ok(contexts)
    }

    fn user_variables(&self) -> Vec<UserVariableItem> {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some((invoked, performed)) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }
        for role_selection in &self.role_selections {
            user_variables.push(UserVariableItem::RoleSelection(role_selection.clone()));
        }
        for (sop_class_uid, data) in &self.extended_negotiations {
            user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                sop_class_uid.trim().to_string(),
                data.clone(),
            ));
        }
        for negotiation in &self.common_extended_negotiations {
            user_variables.push(UserVariableItem::SopClassCommonExtendedNegotiation(
                negotiation.clone(),
            ));
        }
        if let Some(user_identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(user_identity.clone()));
        }
        user_variables
    }

    /// Initiate the TCP connection and negotiate the association.
    ///
    /// Blocks until the association is established,
    /// rejected or failed.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        ensure!(
            is_valid_ae_title(&self.calling_ae_title),
            super::InvalidAeTitleSnafu {
                ae_title: self.calling_ae_title.to_string(),
            }
        );
        ensure!(
            is_valid_ae_title(&self.called_ae_title),
            super::InvalidAeTitleSnafu {
                ae_title: self.called_ae_title.to_string(),
            }
        );

        let presentation_contexts = self.proposed_contexts()?;

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: self.user_variables(),
        });

        let mut socket = connect(address, self.network_timeout)?;
        // association negotiation is bounded by the ACSE timeout
        socket
            .set_read_timeout(Some(self.acse_timeout))
            .context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(self.network_timeout)
            .context(ConfigureSocketSnafu)?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
        crate::pdu::write_pdu(&mut write_buffer, &msg).context(SendPduSnafu)?;
        socket.write_all(&write_buffer).context(WireSendSnafu)?;

        let mut read_buffer = BytesMut::with_capacity(
            (self.max_pdu_length + PDU_HEADER_SIZE) as usize,
        );
        let msg = read_pdu_from_wire(&mut socket, &mut read_buffer, self.max_pdu_length, self.strict)?
            .ok_or(Error::ConnectionClosed)?;

        match msg {
            Pdu::AssociationAC(ac) => {
                ensure!(
                    ac.protocol_version == self.protocol_version,
                    super::ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: ac.protocol_version,
                    }
                );

                let peer_max_pdu_length = ac
                    .user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .map(effective_max_pdu)
                    .unwrap_or(DEFAULT_MAX_PDU);

                // combine the acceptor's verdict with the proposals
                let mut negotiated: Vec<PresentationContextNegotiated> = ac
                    .presentation_contexts
                    .iter()
                    .filter_map(|result| {
                        presentation_contexts
                            .iter()
                            .find(|proposed| proposed.id == result.id)
                            .map(|proposed| PresentationContextNegotiated {
                                id: result.id,
                                reason: result.reason.clone(),
                                abstract_syntax: proposed.abstract_syntax.clone(),
                                transfer_syntax: result.transfer_syntax.clone(),
                                scu_role: true,
                                scp_role: false,
                            })
                    })
                    .collect();
                let accepted_roles: Vec<RoleSelection> = ac
                    .user_variables
                    .iter()
                    .filter_map(|item| match item {
                        UserVariableItem::RoleSelection(rs) => Some(rs.clone()),
                        _ => None,
                    })
                    .collect();
                crate::negotiation::apply_role_selections(&mut negotiated, &accepted_roles);

                ensure!(
                    negotiated
                        .iter()
                        .any(|pc| pc.reason == PresentationContextResultReason::Acceptance),
                    super::NoAcceptedPresentationContextsSnafu
                );

                tracing::debug!(
                    "association with {} established ({} presentation context(s) accepted)",
                    ac.called_ae_title.trim(),
                    negotiated
                        .iter()
                        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                        .count()
                );

                Association::start(AssociationSetup {
                    socket,
                    role: Role::Requestor,
                    local_ae_title: self.calling_ae_title.to_string(),
                    application_context_name: self.application_context_name.to_string(),
                    presentation_contexts: negotiated,
                    peer_max_pdu_length,
                    max_pdu_length: self.max_pdu_length,
                    peer_ae_title: ac.called_ae_title,
                    peer_user_variables: ac.user_variables,
                    acse_timeout: self.acse_timeout,
                    dimse_timeout: self.dimse_timeout,
                    network_timeout: self.network_timeout,
                    strict: self.strict,
                    options: self.network_options,
                })
            }
            Pdu::AssociationRJ(association_rj) => {
                tracing::debug!(
                    "association rejected: {:?}, {:?}",
                    association_rj.result,
                    association_rj.source
                );
                super::RejectedSnafu { association_rj }.fail()
            }
            Pdu::AbortRQ { source } => super::AbortedSnafu { origin: source }.fail(),
            pdu @ Pdu::Unknown { .. } => super::UnknownPduSnafu { pdu: Box::new(pdu) }.fail(),
            pdu => super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }

    /// Negotiate an association with the node
    /// at the given `AETITLE@host:port` address,
    /// taking the called AE title from the address.
    pub fn establish_with(self, ae_address: &str) -> Result<Association> {
        match ae_address.parse::<crate::address::AeAddr>() {
            Ok(ae_address) => {
                let options = match ae_address.ae_title() {
                    Some(ae_title) => self.called_ae_title(ae_title.to_string()),
                    None => self,
                };
                options.establish(ae_address.socket_addr())
            }
            Err(_) => self.establish(ae_address),
        }
    }
}

fn connect<A: ToSocketAddrs>(address: A, timeout: Option<Duration>) -> Result<TcpStream> {
    match timeout {
        Some(timeout) => {
            let mut last_err = None;
            let addrs = address.to_socket_addrs().context(ConnectSnafu)?;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no addresses to connect to")
            }))
            .context(ConnectSnafu)
        }
        None => TcpStream::connect(address).context(ConnectSnafu),
    }
}
