//! Presentation context negotiation
//!
//! The matching rules applied by an association acceptor
//! to the presentation contexts, role selections
//! and maximum length advertisement of an association request
//! (PS3.8 §7.1.1.13, PS3.7 Annex D.3.3).

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::pdu::{
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResultReason,
    RoleSelection, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};

/// Implicit VR Little Endian, the default transfer syntax.
///
/// It is also the transfer syntax echoed in rejected presentation
/// context results, where the field is not significant.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The acceptor's view of what it is willing to negotiate.
#[derive(Debug, Clone, Default)]
pub struct AcceptorPolicy {
    /// the abstract syntaxes offered by this application entity
    pub abstract_syntax_uids: Vec<String>,
    /// the transfer syntaxes admitted for any context;
    /// when empty, any transfer syntax in the registry is admitted
    pub transfer_syntax_uids: Vec<String>,
    /// whether to accept abstract syntaxes outside the offered list
    pub promiscuous: bool,
    /// the SCU/SCP role combinations this application entity
    /// is willing to accept, per SOP class
    pub role_selections: Vec<RoleSelection>,
}

impl AcceptorPolicy {
    /// Decide the outcome of every proposed presentation context.
    ///
    /// For each proposal with a known abstract syntax,
    /// the first proposed transfer syntax which is both admitted by
    /// this policy and supported by the transfer syntax registry
    /// is chosen. The outcomes retain the proposal order.
    pub fn negotiate(
        &self,
        proposed: Vec<PresentationContextProposed>,
    ) -> Vec<PresentationContextNegotiated> {
        proposed
            .into_iter()
            .map(|pc| {
                let abstract_syntax = pc.abstract_syntax.trim().to_string();
                if !self
                    .abstract_syntax_uids
                    .iter()
                    .any(|uid| uid == &abstract_syntax)
                    && !self.promiscuous
                {
                    return PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        transfer_syntax: IMPLICIT_VR_LE.to_string(),
                        abstract_syntax,
                        scu_role: true,
                        scp_role: false,
                    };
                }

                let (transfer_syntax, reason) = self
                    .choose_ts(pc.transfer_syntaxes)
                    .map(|ts| (ts, PresentationContextResultReason::Acceptance))
                    .unwrap_or_else(|| {
                        (
                            IMPLICIT_VR_LE.to_string(),
                            PresentationContextResultReason::TransferSyntaxesNotSupported,
                        )
                    });

                let (scu_role, scp_role) = self.roles_for(&abstract_syntax);

                PresentationContextNegotiated {
                    id: pc.id,
                    reason,
                    transfer_syntax,
                    abstract_syntax,
                    scu_role,
                    scp_role,
                }
            })
            .collect()
    }

    /// From a sequence of transfer syntaxes,
    /// choose the first which is admitted by this policy
    /// and supported by the main transfer syntax registry.
    ///
    /// If the policy does not restrict transfer syntaxes,
    /// the first registry-supported one is chosen.
    fn choose_ts<I, T>(&self, it: I) -> Option<String>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        if self.transfer_syntax_uids.is_empty() {
            return choose_supported(it).map(|ts| ts.as_ref().to_string());
        }

        it.into_iter()
            .find(|ts| {
                let ts = ts.as_ref().trim();
                self.transfer_syntax_uids.iter().any(|uid| uid == ts) && is_supported(ts)
            })
            .map(|ts| ts.as_ref().trim().to_string())
    }

    /// The roles granted for the given abstract syntax
    /// when no role selection sub-item was proposed:
    /// the requestor acts as SCU only.
    fn roles_for(&self, _abstract_syntax: &str) -> (bool, bool) {
        (true, false)
    }

    /// Answer the proposed SCP/SCU role selections.
    ///
    /// Every accepted role must have been proposed;
    /// roles this policy has no record of are downgraded
    /// to the SCU-only default.
    pub fn negotiate_roles(&self, proposed: &[RoleSelection]) -> Vec<RoleSelection> {
        proposed
            .iter()
            .map(|proposal| {
                let supported = self
                    .role_selections
                    .iter()
                    .find(|rs| rs.sop_class_uid == proposal.sop_class_uid);
                match supported {
                    Some(supported) => RoleSelection {
                        sop_class_uid: proposal.sop_class_uid.clone(),
                        scu_role: proposal.scu_role && supported.scu_role,
                        scp_role: proposal.scp_role && supported.scp_role,
                    },
                    None => RoleSelection {
                        sop_class_uid: proposal.sop_class_uid.clone(),
                        scu_role: proposal.scu_role,
                        scp_role: false,
                    },
                }
            })
            .collect()
    }
}

/// Apply accepted role selections to the negotiated contexts.
pub fn apply_role_selections(
    contexts: &mut [PresentationContextNegotiated],
    accepted: &[RoleSelection],
) {
    for context in contexts.iter_mut() {
        if let Some(rs) = accepted
            .iter()
            .find(|rs| rs.sop_class_uid == context.abstract_syntax)
        {
            context.scu_role = rs.scu_role;
            context.scp_role = rs.scp_role;
        }
    }
}

/// The effective limit for PDUs sent to a peer
/// which advertised the given maximum length.
///
/// An advertisement of 0 means that no maximum is specified
/// and is clamped to the implementation's safety ceiling;
/// anything below the minimum PDU size required by the standard
/// is raised to that minimum.
pub fn effective_max_pdu(advertised: u32) -> u32 {
    if advertised == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        advertised.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE)
    }
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo.get(ts_uid).filter(|ts| !ts.is_unsupported()).is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
///
/// ```
/// # use dicom_net::negotiation::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the main registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn policy() -> AcceptorPolicy {
        AcceptorPolicy {
            abstract_syntax_uids: vec![VERIFICATION.to_string()],
            transfer_syntax_uids: vec![],
            promiscuous: false,
            role_selections: vec![],
        }
    }

    #[test]
    fn accepts_known_abstract_syntax_with_first_supported_ts() {
        let outcomes = policy().negotiate(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION.to_string(),
            transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
        }]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(outcomes[0].transfer_syntax, EXPLICIT_VR_LE);
        // the chosen transfer syntax is one of the proposed ones
        assert!([EXPLICIT_VR_LE, IMPLICIT_VR_LE].contains(&outcomes[0].transfer_syntax.as_str()));
    }

    #[test]
    fn rejects_unknown_abstract_syntax() {
        let outcomes = policy().negotiate(vec![PresentationContextProposed {
            id: 3,
            abstract_syntax: MR_STORAGE.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        }]);
        assert_eq!(
            outcomes[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(outcomes[0].id, 3);
    }

    #[test]
    fn promiscuous_mode_accepts_anything() {
        let outcomes = AcceptorPolicy {
            promiscuous: true,
            ..policy()
        }
        .negotiate(vec![PresentationContextProposed {
            id: 5,
            abstract_syntax: MR_STORAGE.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        }]);
        assert_eq!(outcomes[0].reason, PresentationContextResultReason::Acceptance);
    }

    #[test]
    fn rejects_unsupported_transfer_syntaxes() {
        let outcomes = policy().negotiate(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION.to_string(),
            transfer_syntaxes: vec!["1.2.999.88.7".to_string()],
        }]);
        assert_eq!(
            outcomes[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn restricted_transfer_syntax_list_is_honored() {
        let restricted = AcceptorPolicy {
            transfer_syntax_uids: vec![IMPLICIT_VR_LE.to_string()],
            ..policy()
        };
        let outcomes = restricted.negotiate(vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION.to_string(),
            transfer_syntaxes: vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()],
        }]);
        assert_eq!(outcomes[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(outcomes[0].transfer_syntax, IMPLICIT_VR_LE);
    }

    #[test]
    fn accepted_roles_are_a_subset_of_proposed() {
        let acceptor = AcceptorPolicy {
            role_selections: vec![RoleSelection {
                sop_class_uid: MR_STORAGE.to_string(),
                scu_role: true,
                scp_role: true,
            }],
            ..policy()
        };
        let accepted = acceptor.negotiate_roles(&[RoleSelection {
            sop_class_uid: MR_STORAGE.to_string(),
            scu_role: true,
            scp_role: false,
        }]);
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].scu_role);
        // SCP was not proposed, so it cannot be accepted
        assert!(!accepted[0].scp_role);
    }

    #[test]
    fn unknown_role_selection_downgrades_to_scu_only() {
        let accepted = policy().negotiate_roles(&[RoleSelection {
            sop_class_uid: MR_STORAGE.to_string(),
            scu_role: true,
            scp_role: true,
        }]);
        assert!(accepted[0].scu_role);
        assert!(!accepted[0].scp_role);
    }

    #[test]
    fn unlimited_max_pdu_is_clamped() {
        assert_eq!(effective_max_pdu(0), MAXIMUM_PDU_SIZE);
        assert_eq!(effective_max_pdu(16384), 16384);
        assert_eq!(effective_max_pdu(10), MINIMUM_PDU_SIZE);
    }
}
