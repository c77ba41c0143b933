//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association
//! requests, usually taking the role of a service class provider (SCP).
//! See [`ServerAssociationOptions`] for details.

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use std::borrow::Cow;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use crate::config::{is_valid_ae_title, NetworkOptions};
use crate::machine::Role;
use crate::negotiation::{apply_role_selections, effective_max_pdu, AcceptorPolicy};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderAcseReason, AssociationRJServiceUserReason, AssociationRJSource,
    Pdu, PresentationContextNegotiated, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::client::{DEFAULT_ACSE_TIMEOUT, DEFAULT_NETWORK_TIMEOUT};
use super::{
    read_pdu_from_wire, Association, AssociationSetup, ConfigureSocketSnafu, Error, Result,
    SendPduSnafu, SocketOptions, WireSendSnafu,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and
/// [`AcceptCalledAeTitle`], but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association
    /// request based on the recorded application entity titles
    /// and/or user identity.
    ///
    /// Returns `Ok(())` if the requesting node should be given clearance.
    /// Otherwise, a concrete association rejection reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an accepting node.
///
/// Unlike the [`ClientAssociationOptions`][1],
/// a value of this type can be reused for multiple connections.
///
/// [1]: crate::association::client::ClientAssociationOptions
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_net::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("0.0.0.0:11112")?;
/// let scp_options = ServerAssociationOptions::new()
///     .ae_title("ECHO-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1");
///
/// let (stream, _address) = listener.accept()?;
/// let association = scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of admitted transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the SCU/SCP role combinations this node is willing to accept
    role_selections: Vec<RoleSelection>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// bounds association negotiation and release
    acse_timeout: Duration,
    /// bounds inter-PDU silence during a DIMSE exchange
    dimse_timeout: Option<Duration>,
    /// guards half-open transport connections
    network_timeout: Option<Duration>,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
    /// process-wide service options snapshot
    network_options: NetworkOptions,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_selections: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            acse_timeout: DEFAULT_ACSE_TIMEOUT,
            dimse_timeout: None,
            network_timeout: Some(DEFAULT_NETWORK_TIMEOUT),
            socket_options: SocketOptions::default(),
            network_options: NetworkOptions::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            socket_options,
            network_options,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            socket_options,
            network_options,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of supported presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let uid = abstract_syntax_uid.into();
        self.abstract_syntax_uids
            .push(uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0').to_string().into());
        self
    }

    /// Admit this transfer syntax in presentation context negotiation.
    ///
    /// When no transfer syntax is specified,
    /// any transfer syntax supported by the registry is admitted.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let uid = transfer_syntax_uid.into();
        self.transfer_syntax_uids
            .push(uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0').to_string().into());
        self
    }

    /// Accept the given SCU/SCP role combination for one SOP class
    /// when proposed by the requestor.
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Override the ACSE timeout,
    /// which bounds association negotiation and release.
    pub fn acse_timeout(mut self, timeout: Duration) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Set the DIMSE timeout,
    /// the admissible inter-PDU silence during a DIMSE exchange.
    pub fn dimse_timeout(mut self, timeout: Duration) -> Self {
        self.dimse_timeout = Some(timeout);
        self
    }

    /// Override the network timeout,
    /// which guards half-open transport connections.
    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                read_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                write_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Replace the process-wide service options snapshot
    /// taken by the association.
    pub fn network_options(mut self, options: NetworkOptions) -> Self {
        self.network_options = options;
        self
    }

    /// Process an association request PDU.
    ///
    /// In the success case, returns the A-ASSOCIATE-AC PDU
    /// to write back to the requestor
    /// plus the negotiated association parameters.
    /// In the error case, returns the PDU to write back
    /// (a rejection or an abort) and the error to report.
    #[allow(clippy::result_large_err)]
    fn process_association_rq(
        &self,
        msg: Pdu,
    ) -> std::result::Result<(Pdu, NegotiatedOptions), (Option<Pdu>, Error)> {
        let rq = match msg {
            Pdu::AssociationRQ(rq) => rq,
            pdu @ Pdu::Unknown { .. } => {
                return Err((
                    Some(Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnrecognizedPdu,
                        ),
                    }),
                    Error::UnknownPdu { pdu: Box::new(pdu) },
                ));
            }
            pdu => {
                return Err((
                    Some(Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    }),
                    Error::UnexpectedPdu { pdu: Box::new(pdu) },
                ));
            }
        };

        let reject = |result: AssociationRJResult, source: AssociationRJSource| {
            let association_rj = AssociationRJ { result, source };
            (
                Some(Pdu::AssociationRJ(association_rj.clone())),
                Error::Rejected { association_rj },
            )
        };

        if rq.protocol_version & self.protocol_version == 0 {
            return Err(reject(
                AssociationRJResult::Permanent,
                AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                ),
            ));
        }

        if rq.application_context_name != self.application_context_name {
            return Err(reject(
                AssociationRJResult::Permanent,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            ));
        }

        let user_identity = rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        });

        if let Err(reason) = self.ae_access_control.check_access(
            &self.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
            user_identity,
        ) {
            return Err(reject(
                AssociationRJResult::Permanent,
                AssociationRJSource::ServiceUser(reason),
            ));
        }

        let peer_max_pdu_length = rq
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .map(effective_max_pdu)
            .unwrap_or(DEFAULT_MAX_PDU);

        let policy = AcceptorPolicy {
            abstract_syntax_uids: self
                .abstract_syntax_uids
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            transfer_syntax_uids: self
                .transfer_syntax_uids
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            promiscuous: self.promiscuous || self.network_options.unrestricted_storage_service,
            role_selections: self.role_selections.clone(),
        };

        let mut negotiated = policy.negotiate(rq.presentation_contexts);

        // nothing acceptable at all: turn the association down
        if !negotiated
            .iter()
            .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        {
            return Err(reject(
                AssociationRJResult::Permanent,
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
            ));
        }

        let proposed_roles: Vec<RoleSelection> = rq
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(rs) => Some(rs.clone()),
                _ => None,
            })
            .collect();
        let accepted_roles = policy.negotiate_roles(&proposed_roles);
        apply_role_selections(&mut negotiated, &accepted_roles);

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(
            accepted_roles
                .into_iter()
                .map(UserVariableItem::RoleSelection),
        );
        if user_identity.is_some_and(|identity| identity.positive_response_requested()) {
            user_variables.push(UserVariableItem::UserIdentityResponse(Vec::new()));
        }

        let pdu = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            application_context_name: rq.application_context_name,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title,
            presentation_contexts: negotiated
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason.clone(),
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            user_variables: user_variables.clone(),
        });

        Ok((
            pdu,
            NegotiatedOptions {
                peer_max_pdu_length,
                peer_ae_title: rq.calling_ae_title,
                peer_user_variables: rq.user_variables,
                presentation_contexts: negotiated,
            },
        ))
    }

    /// Negotiate an association over the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<Association> {
        ensure!(
            !self.abstract_syntax_uids.is_empty()
                || self.promiscuous
                || self.network_options.unrestricted_storage_service,
            super::MissingAbstractSyntaxSnafu
        );
        ensure!(
            is_valid_ae_title(&self.ae_title),
            super::InvalidAeTitleSnafu {
                ae_title: self.ae_title.to_string(),
            }
        );

        // the association request must arrive within the ACSE timeout
        socket
            .set_read_timeout(self.socket_options.read_timeout.or(Some(self.acse_timeout)))
            .context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout.or(self.network_timeout))
            .context(ConfigureSocketSnafu)?;

        let mut read_buffer =
            BytesMut::with_capacity((self.max_pdu_length + PDU_HEADER_SIZE) as usize);
        let msg =
            read_pdu_from_wire(&mut socket, &mut read_buffer, self.max_pdu_length, self.strict)?
                .ok_or(Error::ConnectionClosed)?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
        match self.process_association_rq(msg) {
            Ok((
                pdu,
                NegotiatedOptions {
                    peer_max_pdu_length,
                    peer_ae_title,
                    peer_user_variables,
                    presentation_contexts,
                },
            )) => {
                crate::pdu::write_pdu(&mut write_buffer, &pdu)
                    .context(SendPduSnafu)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;

                tracing::debug!(
                    "association with {} established ({} presentation context(s) accepted)",
                    peer_ae_title.trim(),
                    presentation_contexts
                        .iter()
                        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                        .count()
                );

                Association::start(AssociationSetup {
                    socket,
                    role: Role::Acceptor,
                    local_ae_title: self.ae_title.to_string(),
                    application_context_name: self.application_context_name.to_string(),
                    presentation_contexts,
                    peer_max_pdu_length,
                    max_pdu_length: self.max_pdu_length,
                    peer_ae_title,
                    peer_user_variables,
                    acse_timeout: self.acse_timeout,
                    dimse_timeout: self.dimse_timeout,
                    network_timeout: self.network_timeout,
                    strict: self.strict,
                    options: self.network_options.clone(),
                })
            }
            Err((pdu, err)) => {
                // send the rejection or abort PDU before dropping the stream
                if let Some(pdu) = pdu {
                    crate::pdu::write_pdu(&mut write_buffer, &pdu)
                        .context(SendPduSnafu)?;
                    socket.write_all(&write_buffer).context(WireSendSnafu)?;
                }
                tracing::debug!("association request turned down: {}", err);
                Err(err)
            }
        }
    }
}

/// The parameters extracted from a successful negotiation.
struct NegotiatedOptions {
    peer_max_pdu_length: u32,
    peer_ae_title: String,
    peer_user_variables: Vec<UserVariableItem>,
    presentation_contexts: Vec<PresentationContextNegotiated>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;

    const VERIFICATION: &str = "1.2.840.10008.1.1";

    fn base_rq() -> crate::pdu::AssociationRQ {
        crate::pdu::AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "TEST-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        }
    }

    #[test]
    fn accepts_verification_request() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, negotiated) = options
            .process_association_rq(Pdu::AssociationRQ(base_rq()))
            .ok()
            .expect("association should be accepted");
        match pdu {
            Pdu::AssociationAC(ac) => {
                assert_eq!(ac.presentation_contexts.len(), 1);
                assert_eq!(
                    ac.presentation_contexts[0].reason,
                    PresentationContextResultReason::Acceptance
                );
            }
            other => panic!("expected A-ASSOCIATE-AC, got {:?}", other),
        }
        assert_eq!(negotiated.peer_ae_title, "TEST-SCU");
        assert_eq!(negotiated.peer_max_pdu_length, 16384);
    }

    #[test]
    fn rejects_when_nothing_is_acceptable() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let mut rq = base_rq();
        rq.presentation_contexts[0].abstract_syntax = "1.2.840.10008.1.99".to_string();
        let (pdu, err) = options
            .process_association_rq(Pdu::AssociationRQ(rq))
            .err()
            .expect("association should be rejected");
        match pdu {
            Some(Pdu::AssociationRJ(rj)) => {
                assert_eq!(rj.result, AssociationRJResult::Permanent);
                assert_eq!(
                    rj.source,
                    AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::NoReasonGiven
                    )
                );
            }
            other => panic!("expected A-ASSOCIATE-RJ, got {:?}", other),
        }
        assert!(matches!(err, Error::Rejected { .. }));
    }

    #[test]
    fn rejects_unknown_application_context() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let mut rq = base_rq();
        rq.application_context_name = "1.2.3.4".to_string();
        let (pdu, _err) = options
            .process_association_rq(Pdu::AssociationRQ(rq))
            .err()
            .expect("association should be rejected");
        assert!(matches!(
            pdu,
            Some(Pdu::AssociationRJ(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                ),
                ..
            }))
        ));
    }

    #[test]
    fn called_ae_title_check_applies() {
        let options = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title("SOME-OTHER-SCP")
            .with_abstract_syntax(VERIFICATION);
        let (pdu, _err) = options
            .process_association_rq(Pdu::AssociationRQ(base_rq()))
            .err()
            .expect("association should be rejected");
        assert!(matches!(
            pdu,
            Some(Pdu::AssociationRJ(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                ),
                ..
            }))
        ));
    }

    #[test]
    fn aborts_on_non_associate_pdu() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, err) = options
            .process_association_rq(Pdu::ReleaseRQ)
            .err()
            .expect("non-associate PDU should fail");
        assert!(matches!(pdu, Some(Pdu::AbortRQ { .. })));
        assert!(matches!(err, Error::UnexpectedPdu { .. }));
    }
}
