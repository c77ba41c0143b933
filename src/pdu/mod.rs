//! Protocol data unit module
//!
//! This module comprises the data structures for the seven protocol data
//! units of the DICOM upper layer protocol (PS3.8 §9.3),
//! including the variable items and user information sub-items
//! found in association negotiation PDUs,
//! plus the routines for encoding and decoding them ([`write_pdu`], [`read_pdu`]).

pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The absolute maximum PDU size accepted by this implementation,
/// a safety ceiling applied when the peer declares no maximum (0).
pub const MAXIMUM_PDU_SIZE: u32 = 128 * 1024 * 1024;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The overhead of a single presentation data value item in bytes:
/// item length (4 bytes), presentation context ID (1 byte)
/// and message control header (1 byte).
pub const PDV_HEADER_SIZE: u32 = 6;

/// A presentation context proposed by the association requestor:
/// one abstract syntax paired with
/// the transfer syntaxes admitted for it,
/// in order of preference.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of a single presentation context negotiation
/// as encoded in an A-ASSOCIATE-AC PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextResult {
    /// the presentation context identifier echoed from the proposal
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax selected by the acceptor
    /// (only significant on acceptance)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context as retained by an association:
/// the result plus the abstract syntax it refers to
/// and the agreed SCU/SCP roles.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID of the proposal
    pub abstract_syntax: String,
    /// the transfer syntax agreed upon
    pub transfer_syntax: String,
    /// whether this application entity may act as SCU on this context
    pub scu_role: bool,
    /// whether this application entity may act as SCP on this context
    pub scp_role: bool,
}

/// The reason code of a presentation context negotiation outcome
/// (PS3.8 §9.3.3.2).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PresentationContextResultReason {
    /// 0 - acceptance
    Acceptance,
    /// 1 - user rejection
    UserRejection,
    /// 2 - no reason (provider rejection)
    NoReason,
    /// 3 - abstract syntax not supported (provider rejection)
    AbstractSyntaxNotSupported,
    /// 4 - transfer syntaxes not supported (provider rejection)
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            PresentationContextResultReason::Acceptance => 0,
            PresentationContextResultReason::UserRejection => 1,
            PresentationContextResultReason::NoReason => 2,
            PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
            PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociationRJResult {
    /// 1 - rejected-permanent
    Permanent,
    /// 2 - rejected-transient
    Transient,
}

impl AssociationRJResult {
    pub fn from(result: u8) -> Option<Self> {
        match result {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source and reason fields of an A-ASSOCIATE-RJ PDU,
/// combined because the valid reasons depend on the source.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociationRJSource {
    /// 1 - DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// 2 - DICOM UL service-provider (ACSE related function)
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    /// 3 - DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }

    pub fn codes(&self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let reason = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(x) => *x,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAcse(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(x) => *x,
                };
                (3, reason)
            }
        }
    }
}

/// Rejection reasons attributed to the UL service-user.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociationRJServiceUserReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - application-context-name-not-supported
    ApplicationContextNameNotSupported,
    /// 3 - calling-AE-title-not-recognized
    CallingAETitleNotRecognized,
    /// 7 - called-AE-title-not-recognized
    CalledAETitleNotRecognized,
    /// 4-6, 8-10 - reserved
    Reserved(u8),
}

/// Rejection reasons attributed to the UL service-provider
/// (ACSE related function).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociationRJServiceProviderAcseReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - protocol-version-not-supported
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the UL service-provider
/// (presentation related function).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// 1 - temporary-congestion
    TemporaryCongestion,
    /// 2 - local-limit-exceeded
    LocalLimitExceeded,
    /// 0, 3-7 - reserved
    Reserved(u8),
}

/// A single presentation data value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PDataValue {
    /// the identifier of the presentation context this value belongs to
    pub presentation_context_id: u8,
    /// whether the fragment carries command set or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its command or data set stream
    pub is_last: bool,
    /// the message fragment
    pub data: Vec<u8>,
}

/// The kind of content carried by a presentation data value,
/// as declared by bit 0 of the message control header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PDataValueType {
    /// message command information
    Command,
    /// message data set information
    Data,
}

/// The source field of an A-ABORT PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AbortRQSource {
    /// 0 - DICOM UL service-user (initiated abort)
    ServiceUser,
    /// 1 - reserved
    Reserved,
    /// 2 - DICOM UL service-provider (initiated abort)
    ServiceProvider(AbortRQServiceProviderReason),
}

impl AbortRQSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    pub fn codes(&self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let reason = match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

/// The reason/diag field of a provider initiated A-ABORT.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AbortRQServiceProviderReason {
    /// 0 - reason-not-specified
    ReasonNotSpecified,
    /// 1 - unrecognized-PDU
    UnrecognizedPdu,
    /// 2 - unexpected-PDU
    UnexpectedPdu,
    /// 3 - reserved
    Reserved,
    /// 4 - unrecognized-PDU-parameter
    UnrecognizedPduParameter,
    /// 5 - unexpected-PDU-parameter
    UnexpectedPduParameter,
    /// 6 - invalid-PDU-parameter-value
    InvalidPduParameter,
}

/// The kind of identity asserted in a user identity negotiation sub-item
/// (PS3.7 Annex D.3.3.7).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UserIdentityType {
    /// 1 - username as UTF-8 string
    Username,
    /// 2 - username and passcode
    UsernamePassword,
    /// 3 - Kerberos service ticket
    KerberosServiceTicket,
    /// 4 - SAML assertion
    SamlAssertion,
    /// 5 - JSON web token
    Jwt,
}

impl UserIdentityType {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernamePassword => 2,
            UserIdentityType::KerberosServiceTicket => 3,
            UserIdentityType::SamlAssertion => 4,
            UserIdentityType::Jwt => 5,
        }
    }
}

/// A user identity negotiation sub-item as proposed by the requestor.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Whether the requestor asked for a positive server response.
    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    /// The type of identity being asserted.
    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// The primary identity field (such as the username).
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary identity field
    /// (only significant for username and passcode identities).
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// An SCP/SCU role selection sub-item,
/// by which the requestor proposes and the acceptor confirms
/// the roles to be played for one SOP class.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RoleSelection {
    /// the SOP class (or meta SOP class) UID the roles apply to
    pub sop_class_uid: String,
    /// whether the proposing application entity acts as an SCU
    pub scu_role: bool,
    /// whether the proposing application entity acts as an SCP
    pub scp_role: bool,
}

/// An SOP class common extended negotiation sub-item (item type 57H).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SopClassCommonExtendedNegotiation {
    /// the SOP class UID this negotiation applies to
    pub sop_class_uid: String,
    /// the UID of the service class group
    pub service_class_uid: String,
    /// related general SOP class UIDs
    pub related_general_sop_classes: Vec<String>,
}

/// A user information sub-item.
///
/// Sub-items which this implementation does not interpret
/// are preserved as [`Unknown`](UserVariableItem::Unknown)
/// so that decoding and re-encoding a PDU is lossless.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum UserVariableItem {
    /// 51H - maximum length receivable by the emitter of this item
    MaxLength(u32),
    /// 52H - implementation class UID
    ImplementationClassUID(String),
    /// 55H - implementation version name
    ImplementationVersionName(String),
    /// 53H - asynchronous operations window
    /// (maximum operations invoked, maximum operations performed)
    AsyncOperationsWindow(u16, u16),
    /// 54H - SCP/SCU role selection
    RoleSelection(RoleSelection),
    /// 56H - SOP class extended negotiation:
    /// SOP class UID plus opaque service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// 57H - SOP class common extended negotiation
    SopClassCommonExtendedNegotiation(SopClassCommonExtendedNegotiation),
    /// 58H - user identity negotiation (request)
    UserIdentityItem(UserIdentity),
    /// 59H - user identity negotiation (server response)
    UserIdentityResponse(Vec<u8>),
    /// any other sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// A variable item of an association negotiation PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// The contents of an A-ASSOCIATE-RQ PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AssociationRQ {
    /// the protocol version bit field (bit 0 = version 1)
    pub protocol_version: u16,
    /// the application entity title of the requesting node
    pub calling_ae_title: String,
    /// the application entity title of the destination node
    pub called_ae_title: String,
    /// the application context name proposed for the association
    pub application_context_name: String,
    /// the proposed presentation contexts
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

/// The contents of an A-ASSOCIATE-AC PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AssociationAC {
    /// the protocol version bit field (bit 0 = version 1)
    pub protocol_version: u16,
    /// echo of the called AE title field from the request
    pub called_ae_title: String,
    /// echo of the calling AE title field from the request
    pub calling_ae_title: String,
    /// the application context name agreed upon
    pub application_context_name: String,
    /// the presentation context negotiation results
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

/// The contents of an A-ASSOCIATE-RJ PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AssociationRJ {
    /// whether the rejection is permanent or transient
    pub result: AssociationRJResult,
    /// who rejected the association, and why
    pub source: AssociationRJSource,
}

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Pdu {
    /// 01H A-ASSOCIATE-RQ
    AssociationRQ(AssociationRQ),
    /// 02H A-ASSOCIATE-AC
    AssociationAC(AssociationAC),
    /// 03H A-ASSOCIATE-RJ
    AssociationRJ(AssociationRJ),
    /// 04H P-DATA-TF
    PData { data: Vec<PDataValue> },
    /// 05H A-RELEASE-RQ
    ReleaseRQ,
    /// 06H A-RELEASE-RP
    ReleaseRP,
    /// 07H A-ABORT
    AbortRQ { source: AbortRQSource },
    /// a PDU of unrecognized type, kept as raw bytes
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short name for the PDU variant, for logging.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "Unknown",
        }
    }
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}
