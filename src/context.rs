//! Per-association bookkeeping of negotiated presentation contexts.

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection,
};

/// The service class role(s) this application entity may take
/// on a presentation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Scu,
    Scp,
    Both,
}

impl Role {
    pub fn supports_scu(self) -> bool {
        matches!(self, Role::Scu | Role::Both)
    }

    pub fn supports_scp(self) -> bool {
        matches!(self, Role::Scp | Role::Both)
    }

    fn from_flags(scu: bool, scp: bool) -> Option<Self> {
        match (scu, scp) {
            (true, true) => Some(Role::Both),
            (true, false) => Some(Role::Scu),
            (false, true) => Some(Role::Scp),
            (false, false) => None,
        }
    }
}

/// One negotiated presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    /// the selected transfer syntax;
    /// only significant when the context was accepted
    pub transfer_syntax: String,
    /// the role(s) this side of the association may take
    pub role: Role,
    pub result: PresentationContextResultReason,
}

impl PresentationContext {
    /// Whether the context may carry messages.
    pub fn is_usable(&self) -> bool {
        self.result == PresentationContextResultReason::Acceptance
    }
}

/// The ordered set of presentation contexts of one association.
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    contexts: Vec<PresentationContext>,
}

impl ContextManager {
    pub fn contexts(&self) -> &[PresentationContext] {
        &self.contexts
    }

    /// Whether at least one context was accepted.
    pub fn has_usable(&self) -> bool {
        self.contexts.iter().any(PresentationContext::is_usable)
    }

    /// Find a context by its identifier.
    pub fn lookup_by_id(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.iter().find(|pc| pc.id == id)
    }

    /// Find the first accepted context with the given abstract syntax.
    pub fn lookup_by_abstract_syntax(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.contexts
            .iter()
            .find(|pc| pc.is_usable() && pc.abstract_syntax == abstract_syntax)
    }

    /// Find the first accepted context with the given abstract syntax
    /// on which this side may issue requests.
    pub fn lookup_for_scu(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.contexts.iter().find(|pc| {
            pc.is_usable() && pc.abstract_syntax == abstract_syntax && pc.role.supports_scu()
        })
    }

    /// Find the first accepted context with the given abstract syntax
    /// on which this side may perform requests issued by the peer.
    pub fn lookup_for_scp(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.contexts.iter().find(|pc| {
            pc.is_usable() && pc.abstract_syntax == abstract_syntax && pc.role.supports_scp()
        })
    }

    /// Build the requester-side context set from the proposed contexts
    /// and the results returned in the A-ASSOCIATE-AC.
    ///
    /// Accepted contexts take the role(s) granted by the acceptor's
    /// role selection items, or `default_role` when the SOP class
    /// was not subject to role negotiation.
    pub fn from_acceptance(
        proposed: &[PresentationContextProposed],
        results: &[PresentationContextResult],
        granted_roles: &[RoleSelection],
        default_role: Role,
    ) -> Self {
        let contexts = results
            .iter()
            .filter_map(|result| {
                let proposal = proposed.iter().find(|pc| pc.id == result.id)?;
                let role = granted_roles
                    .iter()
                    .find(|rs| rs.sop_class_uid == proposal.abstract_syntax)
                    .and_then(|rs| Role::from_flags(rs.scu_role, rs.scp_role))
                    .unwrap_or(default_role);
                Some(PresentationContext {
                    id: result.id,
                    abstract_syntax: proposal.abstract_syntax.clone(),
                    transfer_syntax: result.transfer_syntax.clone(),
                    role,
                    result: result.reason,
                })
            })
            .collect();
        ContextManager { contexts }
    }

    /// Negotiate the proposed contexts on the acceptor side.
    ///
    /// For each proposal, the first proposed transfer syntax among
    /// `transfer_syntaxes` is selected; proposals with an unsupported
    /// abstract syntax or no usable transfer syntax are rejected with
    /// the appropriate reason, and duplicated context identifiers are
    /// rejected outright.
    ///
    /// Returns the local context set, the results to send back,
    /// and the granted role selection items to echo.
    pub fn negotiate(
        proposed: &[PresentationContextProposed],
        abstract_syntaxes: &[String],
        transfer_syntaxes: &[String],
        requested_roles: &[RoleSelection],
    ) -> (Self, Vec<PresentationContextResult>, Vec<RoleSelection>) {
        // rejected proposals carry a placeholder transfer syntax,
        // which the requester must not interpret
        const FALLBACK_TS: &str = "1.2.840.10008.1.2";

        let mut contexts = Vec::with_capacity(proposed.len());
        let mut results = Vec::with_capacity(proposed.len());
        let mut granted = Vec::new();
        let mut seen_ids: Vec<u8> = Vec::with_capacity(proposed.len());

        for pc in proposed {
            let (reason, transfer_syntax) = if seen_ids.contains(&pc.id) {
                (PresentationContextResultReason::NoReason, None)
            } else if !abstract_syntaxes.iter().any(|a| *a == pc.abstract_syntax) {
                (
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    None,
                )
            } else {
                match pc
                    .transfer_syntaxes
                    .iter()
                    .find(|ts| transfer_syntaxes.iter().any(|s| s == *ts))
                {
                    Some(ts) => (
                        PresentationContextResultReason::Acceptance,
                        Some(ts.clone()),
                    ),
                    None => (
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                        None,
                    ),
                }
            };
            seen_ids.push(pc.id);

            // the requester's roles determine the complementary local ones
            let role = if reason == PresentationContextResultReason::Acceptance {
                let requested = requested_roles
                    .iter()
                    .find(|rs| rs.sop_class_uid == pc.abstract_syntax);
                if let Some(rs) = requested {
                    granted.push(rs.clone());
                }
                requested
                    .and_then(|rs| Role::from_flags(rs.scp_role, rs.scu_role))
                    .unwrap_or(Role::Scp)
            } else {
                Role::Scp
            };

            let transfer_syntax = transfer_syntax.unwrap_or_else(|| FALLBACK_TS.to_string());
            contexts.push(PresentationContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: transfer_syntax.clone(),
                role,
                result: reason,
            });
            results.push(PresentationContextResult {
                id: pc.id,
                reason,
                transfer_syntax,
            });
        }

        granted.dedup_by(|a, b| a.sop_class_uid == b.sop_class_uid);
        (ContextManager { contexts }, results, granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";

    fn proposal(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn negotiation_accepts_first_supported_transfer_syntax() {
        let proposed = vec![proposal(1, VERIFICATION, &[EXPLICIT_LE, IMPLICIT_LE])];
        let (manager, results, _) = ContextManager::negotiate(
            &proposed,
            &[VERIFICATION.to_string()],
            &[IMPLICIT_LE.to_string()],
            &[],
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[0].transfer_syntax, IMPLICIT_LE);
        assert!(manager.has_usable());
        assert_eq!(
            manager.lookup_by_id(1).unwrap().transfer_syntax,
            IMPLICIT_LE
        );
    }

    #[test]
    fn negotiation_rejects_unsupported_syntaxes() {
        let proposed = vec![
            proposal(1, CT_STORAGE, &[IMPLICIT_LE]),
            proposal(3, VERIFICATION, &["1.2.840.10008.1.2.4.50"]),
        ];
        let (manager, results, _) = ContextManager::negotiate(
            &proposed,
            &[VERIFICATION.to_string()],
            &[IMPLICIT_LE.to_string(), EXPLICIT_LE.to_string()],
            &[],
        );

        assert_eq!(
            results[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(
            results[1].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
        assert!(!manager.has_usable());
    }

    #[test]
    fn negotiation_rejects_duplicate_ids() {
        let proposed = vec![
            proposal(1, VERIFICATION, &[IMPLICIT_LE]),
            proposal(1, CT_STORAGE, &[IMPLICIT_LE]),
        ];
        let (_, results, _) = ContextManager::negotiate(
            &proposed,
            &[VERIFICATION.to_string(), CT_STORAGE.to_string()],
            &[IMPLICIT_LE.to_string()],
            &[],
        );

        assert_eq!(results[0].reason, PresentationContextResultReason::Acceptance);
        assert_eq!(results[1].reason, PresentationContextResultReason::NoReason);
    }

    #[test]
    fn acceptance_records_rejected_contexts() {
        let proposed = vec![
            proposal(1, VERIFICATION, &[IMPLICIT_LE]),
            proposal(3, CT_STORAGE, &[IMPLICIT_LE]),
        ];
        let results = vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_LE.to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: IMPLICIT_LE.to_string(),
            },
        ];

        let manager = ContextManager::from_acceptance(&proposed, &results, &[], Role::Scu);
        assert!(manager.lookup_by_abstract_syntax(VERIFICATION).is_some());
        assert!(manager.lookup_by_abstract_syntax(CT_STORAGE).is_none());
        // the rejected context is still visible by identifier
        assert!(!manager.lookup_by_id(3).unwrap().is_usable());
    }

    #[test]
    fn granted_roles_are_applied() {
        let proposed = vec![proposal(1, CT_STORAGE, &[IMPLICIT_LE])];
        let results = vec![PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: IMPLICIT_LE.to_string(),
        }];
        let granted = vec![RoleSelection {
            sop_class_uid: CT_STORAGE.to_string(),
            scu_role: false,
            scp_role: true,
        }];

        let manager = ContextManager::from_acceptance(&proposed, &results, &granted, Role::Scu);
        let pc = manager.lookup_by_id(1).unwrap();
        assert_eq!(pc.role, Role::Scp);
        assert!(manager.lookup_for_scu(CT_STORAGE).is_none());
        assert!(manager.lookup_for_scp(CT_STORAGE).is_some());
    }

    #[test]
    fn acceptor_takes_complementary_roles() {
        // a C-GET requester proposes to act as the storage SCP,
        // leaving the SCU side of the class to the acceptor
        let proposed = vec![proposal(1, CT_STORAGE, &[IMPLICIT_LE])];
        let requested = vec![RoleSelection {
            sop_class_uid: CT_STORAGE.to_string(),
            scu_role: false,
            scp_role: true,
        }];

        let (manager, _, granted) = ContextManager::negotiate(
            &proposed,
            &[CT_STORAGE.to_string()],
            &[IMPLICIT_LE.to_string()],
            &requested,
        );

        assert_eq!(manager.lookup_by_id(1).unwrap().role, Role::Scu);
        assert_eq!(granted, requested);
    }
}
