//! Association negotiation module
//!
//! This module provides the acceptor-side negotiation logic:
//! given an association request and a configured [`AcceptorPolicy`],
//! it produces either an association acknowledgement
//! with a presentation context result per proposed context,
//! or an association rejection.
//!
//! An [`AcceptorPolicy`] is an ordered list of rules.
//! Each rule pairs an [`AeSelector`],
//! which matches on the called and calling application entity titles,
//! with an [`AePolicy`] describing what that application entity accepts:
//! application context name, abstract syntaxes
//! with transfer syntaxes in preference order,
//! role selections, extended negotiation,
//! maximum PDU length, asynchronous operations
//! and user identity validation.
use std::borrow::Cow;

use tracing::warn;

use crate::association::uid::trim_uid;
use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, AsyncOperationsWindow, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// The transfer syntax given in rejected presentation context results,
/// where the transfer syntax field has no meaning.
const FALLBACK_TS: &str = "1.2.840.10008.1.2";

/// A selector over the application entity titles
/// recorded in an association request.
///
/// Titles are compared after trailing spaces are removed.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum AeSelector {
    /// matches any association request
    Any,
    /// matches when the called AE title is the given one
    Called(String),
    /// matches when both the called and the calling AE titles
    /// are the given ones
    CalledAndCalling(String, String),
}

impl AeSelector {
    /// Whether this selector matches the given AE title pair.
    pub fn matches(&self, called_ae_title: &str, calling_ae_title: &str) -> bool {
        let called = called_ae_title.trim_end_matches(' ');
        let calling = calling_ae_title.trim_end_matches(' ');
        match self {
            AeSelector::Any => true,
            AeSelector::Called(c) => c == called,
            AeSelector::CalledAndCalling(c, g) => c == called && g == calling,
        }
    }
}

/// The outcome of validating a user identity negotiation sub-item.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UserIdentityOutcome {
    /// the identity is accepted;
    /// the server response is included in the acknowledgement
    /// when the requestor asked for a positive response
    Accepted {
        /// server response bytes for the user identity AC sub-item
        server_response: Option<Vec<u8>>,
    },
    /// the identity is not accepted,
    /// the association request is rejected
    Rejected,
}

/// Common interface for user identity validation policies.
pub trait UserIdentityValidator: std::fmt::Debug + Send + Sync {
    /// Decide whether the given user identity gives clearance
    /// to establish the association.
    fn validate(&self, identity: &UserIdentity) -> UserIdentityOutcome;
}

/// Common interface for answering
/// SOP class extended negotiation sub-items.
pub trait ExtendedNegotiationHandler: std::fmt::Debug + Send + Sync {
    /// Produce the service class application information
    /// to return for the given SOP class,
    /// or `None` to leave the sub-item unanswered.
    fn respond(&self, sop_class_uid: &str, application_info: &[u8]) -> Option<Vec<u8>>;
}

/// The negotiation policy of one application entity:
/// everything the acceptor is willing to agree to.
///
/// Transfer syntaxes are kept in preference order,
/// the first one also present in a proposal wins.
#[derive(Debug)]
pub struct AePolicy {
    /// the accepted application context name
    application_context_name: Cow<'static, str>,
    /// the supported abstract syntaxes,
    /// each with its transfer syntaxes in preference order
    abstract_syntaxes: Vec<(String, Vec<String>)>,
    /// the roles this node supports per SOP class
    role_selections: Vec<RoleSelection>,
    /// handler for SOP class extended negotiation sub-items
    extended_negotiation: Option<Box<dyn ExtendedNegotiationHandler>>,
    /// the maximum PDU length announced in the acknowledgement
    max_pdu_length: u32,
    /// the asynchronous operations window announced in the acknowledgement
    async_operations_window: Option<AsyncOperationsWindow>,
    /// validator for user identity negotiation sub-items
    user_identity_validator: Option<Box<dyn UserIdentityValidator>>,
    /// the expected protocol version
    protocol_version: u16,
}

impl Default for AePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AePolicy {
    /// Create a new policy with no abstract syntaxes.
    pub fn new() -> Self {
        AePolicy {
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntaxes: Vec::new(),
            role_selections: Vec::new(),
            extended_negotiation: None,
            max_pdu_length: DEFAULT_MAX_PDU,
            async_operations_window: None,
            user_identity_validator: None,
            protocol_version: 1,
        }
    }

    /// Override the accepted application context name.
    pub fn application_context_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.application_context_name = name.into();
        self
    }

    /// Register an abstract syntax
    /// together with its transfer syntaxes in preference order.
    ///
    /// Registering the same abstract syntax again
    /// replaces its transfer syntax list.
    pub fn with_abstract_syntax<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: impl IntoIterator<Item = T>,
    ) -> Self
    where
        T: Into<String>,
    {
        let uid = trim_uid(Cow::Owned(abstract_syntax_uid.into())).to_string();
        let ts: Vec<String> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(Cow::Owned(t.into())).to_string())
            .collect();
        self.abstract_syntaxes.retain(|(a, _)| *a != uid);
        self.abstract_syntaxes.push((uid, ts));
        self
    }

    /// Register the roles this node can take for a SOP class.
    pub fn with_role_selection(mut self, role: RoleSelection) -> Self {
        let uid = role.sop_class_uid.clone();
        self.role_selections
            .retain(|r| r.sop_class_uid != uid);
        self.role_selections.push(role);
        self
    }

    /// Set the handler for SOP class extended negotiation sub-items.
    pub fn with_extended_negotiation(
        mut self,
        handler: impl ExtendedNegotiationHandler + 'static,
    ) -> Self {
        self.extended_negotiation = Some(Box::new(handler));
        self
    }

    /// Override the maximum PDU length announced to the requestor.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Announce an asynchronous operations window in the acknowledgement.
    pub fn with_async_operations_window(mut self, window: AsyncOperationsWindow) -> Self {
        self.async_operations_window = Some(window);
        self
    }

    /// Set the user identity validation policy.
    ///
    /// When a validator is set,
    /// requests without a user identity sub-item are rejected.
    pub fn with_user_identity_validator(
        mut self,
        validator: impl UserIdentityValidator + 'static,
    ) -> Self {
        self.user_identity_validator = Some(Box::new(validator));
        self
    }

    /// Retrieve the maximum PDU length of this policy.
    pub fn accepted_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> Option<&[String]> {
        self.abstract_syntaxes
            .iter()
            .find(|(a, _)| a == abstract_syntax)
            .map(|(_, ts)| ts.as_slice())
    }
}

/// An ordered list of negotiation rules.
///
/// The first rule whose selector matches
/// the called and calling AE titles of the request
/// supplies the policy for the whole negotiation.
/// A request matching no rule is rejected
/// with _called AE title not recognized_.
#[derive(Debug, Default)]
pub struct AcceptorPolicy {
    rules: Vec<(AeSelector, AePolicy)>,
}

impl AcceptorPolicy {
    /// Create a policy with no rules,
    /// which rejects every association request.
    pub fn new() -> Self {
        AcceptorPolicy { rules: Vec::new() }
    }

    /// Append a rule to the list.
    pub fn with_rule(mut self, selector: AeSelector, policy: AePolicy) -> Self {
        self.rules.push((selector, policy));
        self
    }

    /// Find the policy of the first rule
    /// matching the given AE title pair.
    pub fn select(&self, called_ae_title: &str, calling_ae_title: &str) -> Option<&AePolicy> {
        self.rules
            .iter()
            .find(|(sel, _)| sel.matches(called_ae_title, calling_ae_title))
            .map(|(_, policy)| policy)
    }
}

/// The parameters agreed on through a successful negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedAssociation {
    /// the accepted presentation contexts
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// the maximum PDU length that the requestor accepts
    pub peer_max_pdu_length: u32,
    /// the maximum PDU length that this node announced
    pub max_pdu_length: u32,
    /// the calling AE title of the requestor, trimmed
    pub peer_ae_title: String,
    /// the user variables received from the requestor
    pub peer_user_variables: Vec<UserVariableItem>,
}

/// The outcome of a negotiation:
/// either an acknowledgement or a rejection,
/// both of which still have to be sent to the requestor.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    /// the association request is accepted
    Accepted {
        /// the acknowledgement PDU to send back
        ac: AssociationAC,
        /// the agreed association parameters
        negotiated: NegotiatedAssociation,
    },
    /// the association request is rejected
    Rejected(AssociationRJ),
}

fn reject(reason: AssociationRJServiceUserReason) -> NegotiationOutcome {
    NegotiationOutcome::Rejected(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(reason),
    })
}

/// Negotiate an association request against an acceptor policy.
///
/// The same request and policy always yield the same outcome,
/// with sub-items in the acknowledgement in a fixed order.
pub fn negotiate(rq: &AssociationRQ, policy: &AcceptorPolicy) -> NegotiationOutcome {
    let ae_policy = match policy.select(&rq.called_ae_title, &rq.calling_ae_title) {
        Some(p) => p,
        None => {
            return reject(AssociationRJServiceUserReason::CalledAETitleNotRecognized);
        }
    };

    if rq.protocol_version != ae_policy.protocol_version {
        return NegotiationOutcome::Rejected(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceProviderASCE(
                crate::pdu::AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
        });
    }

    // user identity is validated before anything else is answered
    let user_identity = rq.user_variables.iter().find_map(|v| match v {
        UserVariableItem::UserIdentityItem(identity) => Some(identity),
        _ => None,
    });
    let identity_response = match (&ae_policy.user_identity_validator, user_identity) {
        (Some(validator), Some(identity)) => match validator.validate(identity) {
            UserIdentityOutcome::Accepted { server_response } => {
                if identity.positive_response_requested() {
                    Some(server_response.unwrap_or_default())
                } else {
                    None
                }
            }
            UserIdentityOutcome::Rejected => {
                return reject(AssociationRJServiceUserReason::NoReasonGiven);
            }
        },
        (Some(_), None) => {
            // a validator is configured but no identity was provided
            return reject(AssociationRJServiceUserReason::NoReasonGiven);
        }
        (None, _) => None,
    };

    if rq.application_context_name != ae_policy.application_context_name {
        return reject(AssociationRJServiceUserReason::ApplicationContextNameNotSupported);
    }

    let presentation_contexts: Vec<PresentationContextResult> = rq
        .presentation_contexts
        .iter()
        .map(|pc| {
            // even identifiers violate the odd-id rule,
            // answered with a provider rejection instead of being dropped
            if pc.id % 2 == 0 {
                warn!("proposed presentation context with even id {}", pc.id);
                return PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::NoReason,
                    transfer_syntax: FALLBACK_TS.to_string(),
                };
            }
            let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str()));
            let known_ts = match ae_policy.transfer_syntaxes_for(&abstract_syntax) {
                Some(ts) => ts,
                None => {
                    return PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        transfer_syntax: FALLBACK_TS.to_string(),
                    };
                }
            };
            // first transfer syntax in policy preference order
            // that the requestor also proposed
            let chosen = known_ts.iter().find(|ts| {
                pc.transfer_syntaxes
                    .iter()
                    .any(|proposed| trim_uid(Cow::from(proposed.as_str())) == **ts)
            });
            match chosen {
                Some(ts) => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: ts.clone(),
                },
                None => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: FALLBACK_TS.to_string(),
                },
            }
        })
        .collect();

    let mut user_variables = vec![
        UserVariableItem::MaxLength(ae_policy.max_pdu_length),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];

    if let Some(window) = ae_policy.async_operations_window {
        user_variables.push(UserVariableItem::AsyncOperationsWindow(window));
    }

    // role selections are answered only for SOP classes
    // present in the policy's role table,
    // each agreed role being the intersection of both sides
    for v in &rq.user_variables {
        match v {
            UserVariableItem::RoleSelection(proposed) => {
                match ae_policy
                    .role_selections
                    .iter()
                    .find(|r| r.sop_class_uid == proposed.sop_class_uid)
                {
                    Some(supported) => {
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid: proposed.sop_class_uid.clone(),
                            scu_role: proposed.scu_role && supported.scu_role,
                            scp_role: proposed.scp_role && supported.scp_role,
                        }));
                    }
                    None => {
                        warn!(
                            "dropping role selection for unrecognized SOP class {}",
                            proposed.sop_class_uid
                        );
                    }
                }
            }
            UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info) => {
                let response = ae_policy
                    .extended_negotiation
                    .as_ref()
                    .and_then(|h| h.respond(uid, info));
                match response {
                    Some(data) => {
                        user_variables.push(
                            UserVariableItem::SopClassExtendedNegotiationSubItem(
                                uid.clone(),
                                data,
                            ),
                        );
                    }
                    None => {
                        warn!(
                            "dropping extended negotiation for unrecognized SOP class {}",
                            uid
                        );
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(response) = identity_response {
        user_variables.push(UserVariableItem::UserIdentityResponseItem(response));
    }

    let peer_max_pdu_length = rq
        .user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);
    // zero means no limit stated
    let peer_max_pdu_length = if peer_max_pdu_length == 0 {
        u32::MAX
    } else {
        peer_max_pdu_length
    };

    let ac = AssociationAC {
        protocol_version: ae_policy.protocol_version,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: rq.application_context_name.clone(),
        presentation_contexts: presentation_contexts.clone(),
        user_variables,
    };

    let negotiated = NegotiatedAssociation {
        presentation_contexts: presentation_contexts
            .into_iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .collect(),
        peer_max_pdu_length,
        max_pdu_length: ae_policy.max_pdu_length,
        peer_ae_title: rq.calling_ae_title.trim_end_matches(' ').to_string(),
        peer_user_variables: rq.user_variables.clone(),
    };

    NegotiationOutcome::Accepted { ac, negotiated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;
    use matches::assert_matches;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn base_rq() -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "ECHOSCU".to_string(),
            called_ae_title: "MAIN-STORAGE".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec![
                    IMPLICIT_VR_LE.to_string(),
                    EXPLICIT_VR_LE.to_string(),
                ],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16_384)],
        }
    }

    fn base_policy() -> AcceptorPolicy {
        AcceptorPolicy::new().with_rule(
            AeSelector::Any,
            AePolicy::new().with_abstract_syntax(
                VERIFICATION,
                vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE],
            ),
        )
    }

    #[test]
    fn accepts_verification_with_preferred_transfer_syntax() {
        let outcome = negotiate(&base_rq(), &base_policy());
        match outcome {
            NegotiationOutcome::Accepted { ac, negotiated } => {
                assert_eq!(ac.presentation_contexts.len(), 1);
                let pc = &ac.presentation_contexts[0];
                assert_eq!(pc.id, 1);
                assert_eq!(pc.reason, PresentationContextResultReason::Acceptance);
                // policy preference order wins over proposal order
                assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);
                assert_eq!(negotiated.presentation_contexts.len(), 1);
                assert_eq!(negotiated.peer_max_pdu_length, 16_384);
                assert_eq!(negotiated.peer_ae_title, "ECHOSCU");
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn rejects_when_no_rule_matches() {
        let policy = AcceptorPolicy::new().with_rule(
            AeSelector::Called("OTHER-SCP".to_string()),
            AePolicy::new()
                .with_abstract_syntax(VERIFICATION, vec![IMPLICIT_VR_LE]),
        );
        let outcome = negotiate(&base_rq(), &policy);
        assert_matches!(
            outcome,
            NegotiationOutcome::Rejected(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                ),
            })
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = AcceptorPolicy::new()
            .with_rule(
                AeSelector::Called("MAIN-STORAGE".to_string()),
                AePolicy::new()
                    .with_abstract_syntax(VERIFICATION, vec![IMPLICIT_VR_LE]),
            )
            .with_rule(
                AeSelector::Any,
                AePolicy::new()
                    .with_abstract_syntax(VERIFICATION, vec![EXPLICIT_VR_LE]),
            );
        let outcome = negotiate(&base_rq(), &policy);
        match outcome {
            NegotiationOutcome::Accepted { ac, .. } => {
                assert_eq!(ac.presentation_contexts[0].transfer_syntax, IMPLICIT_VR_LE);
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn rejects_unknown_application_context() {
        let mut rq = base_rq();
        rq.application_context_name = "1.2.3.999".to_string();
        let outcome = negotiate(&rq, &base_policy());
        assert_matches!(
            outcome,
            NegotiationOutcome::Rejected(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                ),
                ..
            })
        );
    }

    #[test]
    fn unsupported_abstract_syntax_is_refused_per_context() {
        let mut rq = base_rq();
        rq.presentation_contexts.push(PresentationContextProposed {
            id: 3,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        });
        let outcome = negotiate(&rq, &base_policy());
        match outcome {
            NegotiationOutcome::Accepted { ac, negotiated } => {
                assert_eq!(ac.presentation_contexts.len(), 2);
                assert_eq!(
                    ac.presentation_contexts[1].reason,
                    PresentationContextResultReason::AbstractSyntaxNotSupported
                );
                // only the accepted context makes it into the agreed set
                assert_eq!(negotiated.presentation_contexts.len(), 1);
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn no_common_transfer_syntax_is_refused_per_context() {
        let mut rq = base_rq();
        rq.presentation_contexts[0].transfer_syntaxes =
            vec!["1.2.840.10008.1.2.4.50".to_string()];
        let outcome = negotiate(&rq, &base_policy());
        match outcome {
            NegotiationOutcome::Accepted { ac, negotiated } => {
                assert_eq!(
                    ac.presentation_contexts[0].reason,
                    PresentationContextResultReason::TransferSyntaxesNotSupported
                );
                assert!(negotiated.presentation_contexts.is_empty());
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn even_context_id_is_answered_with_provider_rejection() {
        let mut rq = base_rq();
        rq.presentation_contexts[0].id = 2;
        let outcome = negotiate(&rq, &base_policy());
        match outcome {
            NegotiationOutcome::Accepted { ac, .. } => {
                assert_eq!(ac.presentation_contexts[0].id, 2);
                assert_eq!(
                    ac.presentation_contexts[0].reason,
                    PresentationContextResultReason::NoReason
                );
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[derive(Debug)]
    struct AcceptBob;

    impl UserIdentityValidator for AcceptBob {
        fn validate(&self, identity: &UserIdentity) -> UserIdentityOutcome {
            if identity.primary_field() == b"bob" {
                UserIdentityOutcome::Accepted {
                    server_response: Some(b"ok".to_vec()),
                }
            } else {
                UserIdentityOutcome::Rejected
            }
        }
    }

    #[test]
    fn user_identity_is_validated_first() {
        let policy = AcceptorPolicy::new().with_rule(
            AeSelector::Any,
            AePolicy::new()
                .with_abstract_syntax(VERIFICATION, vec![IMPLICIT_VR_LE])
                .with_user_identity_validator(AcceptBob),
        );

        // no identity at all is a rejection
        let outcome = negotiate(&base_rq(), &policy);
        assert_matches!(
            outcome,
            NegotiationOutcome::Rejected(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven
                ),
                ..
            })
        );

        // wrong identity is a rejection,
        // even when the application context is also wrong
        let mut rq = base_rq();
        rq.application_context_name = "1.2.3.999".to_string();
        rq.user_variables
            .push(UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                crate::pdu::UserIdentityType::Username,
                b"eve".to_vec(),
                vec![],
            )));
        let outcome = negotiate(&rq, &policy);
        assert_matches!(
            outcome,
            NegotiationOutcome::Rejected(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven
                ),
                ..
            })
        );

        // a good identity with a positive response requested
        // produces a response sub-item
        let mut rq = base_rq();
        rq.user_variables
            .push(UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                crate::pdu::UserIdentityType::Username,
                b"bob".to_vec(),
                vec![],
            )));
        match negotiate(&rq, &policy) {
            NegotiationOutcome::Accepted { ac, .. } => {
                assert!(ac.user_variables.iter().any(|v| matches!(
                    v,
                    UserVariableItem::UserIdentityResponseItem(data) if data == b"ok"
                )));
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn role_selection_is_intersected() {
        let policy = AcceptorPolicy::new().with_rule(
            AeSelector::Any,
            AePolicy::new()
                .with_abstract_syntax(VERIFICATION, vec![IMPLICIT_VR_LE])
                .with_role_selection(RoleSelection {
                    sop_class_uid: VERIFICATION.to_string(),
                    scu_role: true,
                    scp_role: false,
                }),
        );
        let mut rq = base_rq();
        rq.put_role_selection(RoleSelection {
            sop_class_uid: VERIFICATION.to_string(),
            scu_role: true,
            scp_role: true,
        });
        // role selection for a SOP class the policy ignores is dropped
        rq.put_role_selection(RoleSelection {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            scu_role: true,
            scp_role: true,
        });
        match negotiate(&rq, &policy) {
            NegotiationOutcome::Accepted { ac, .. } => {
                let roles: Vec<_> = ac
                    .user_variables
                    .iter()
                    .filter_map(|v| match v {
                        UserVariableItem::RoleSelection(r) => Some(r),
                        _ => None,
                    })
                    .collect();
                assert_eq!(roles.len(), 1);
                assert_eq!(roles[0].sop_class_uid, VERIFICATION);
                assert!(roles[0].scu_role);
                assert!(!roles[0].scp_role);
            }
            NegotiationOutcome::Rejected(rj) => panic!("unexpected rejection: {:?}", rj),
        }
    }

    #[test]
    fn negotiation_is_deterministic() {
        let rq = base_rq();
        let policy = base_policy();
        let a = negotiate(&rq, &policy);
        let b = negotiate(&rq, &policy);
        assert_eq!(a, b);
    }
}
