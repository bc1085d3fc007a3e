use crate::{
    gating::{self, DmPolicy, GroupPolicy},
    security::{GroupSecurityDecision, PrefixNormalizer, SecurityDecision},
};

/// Determine if a direct message from `sender_id` should be processed.
///
/// `approved` is whether the pairing workflow already admitted the sender
/// (see [`crate::pairing::ChannelPairingAdapter::is_approved`]); it only matters
/// under [`DmPolicy::Pairing`].
pub fn check_dm_access(
    decision: &SecurityDecision,
    sender_id: &str,
    username: Option<&str>,
    approved: bool,
) -> Result<(), AccessDenied> {
    match decision.policy {
        DmPolicy::Open => Ok(()),
        DmPolicy::Allowlist => {
            // An explicit allowlist policy with an empty list denies
            // everyone; it never degrades to open.
            if listed(&decision.normalizer, &decision.allow_from, sender_id, username) {
                Ok(())
            } else {
                Err(AccessDenied::NotOnAllowlist)
            }
        },
        DmPolicy::Pairing => {
            if approved
                || listed(&decision.normalizer, &decision.allow_from, sender_id, username)
            {
                Ok(())
            } else {
                Err(AccessDenied::PairingRequired)
            }
        },
    }
}

/// Determine if a group message from `sender_id` should be processed.
pub fn check_group_access(
    decision: &GroupSecurityDecision,
    sender_id: &str,
    username: Option<&str>,
) -> Result<(), AccessDenied> {
    match decision.policy {
        GroupPolicy::Disabled => Err(AccessDenied::GroupsDisabled),
        GroupPolicy::Open => Ok(()),
        GroupPolicy::Allowlist => {
            if listed(&decision.normalizer, &decision.allow_from, sender_id, username) {
                Ok(())
            } else {
                Err(AccessDenied::GroupSenderNotAllowed)
            }
        },
    }
}

fn listed(
    normalizer: &PrefixNormalizer,
    allow_from: &[String],
    sender_id: &str,
    username: Option<&str>,
) -> bool {
    let entries: Vec<String> = allow_from
        .iter()
        .map(|entry| strip_at(&normalizer.normalize(entry)).to_string())
        .filter(|entry| !entry.is_empty())
        .collect();
    if entries.is_empty() {
        return false;
    }
    let sender = normalizer.normalize(sender_id);
    gating::is_allowed(&sender, &entries)
        || username
            .map(|u| strip_at(u.trim()).to_string())
            .is_some_and(|u| !u.is_empty() && gating::is_allowed(&u, &entries))
}

fn strip_at(value: &str) -> &str {
    value.trim_start_matches('@')
}

/// Reason an inbound message was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    NotOnAllowlist,
    PairingRequired,
    GroupsDisabled,
    GroupSenderNotAllowed,
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotOnAllowlist => write!(f, "sender not on allowlist"),
            Self::PairingRequired => write!(f, "sender must complete pairing"),
            Self::GroupsDisabled => write!(f, "groups are disabled"),
            Self::GroupSenderNotAllowed => write!(f, "group sender not on allowlist"),
        }
    }
}
