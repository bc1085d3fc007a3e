//! DM and group access policy derived from a resolved account.

use crate::{
    account::{DEFAULT_ACCOUNT_ID, ResolvedAccount},
    gating::{DmPolicy, GroupPolicy},
};

/// Strips a `"<channel-id>:"` prefix from allowlist entries and sender ids.
///
/// Matching is case-insensitive and the prefix is removed repeatedly, so
/// `normalize(normalize(x)) == normalize(x)` for every input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixNormalizer {
    prefix: String,
}

impl PrefixNormalizer {
    pub fn new(channel_id: &str) -> Self {
        Self {
            prefix: format!("{}:", channel_id.to_lowercase()),
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut rest = raw.trim();
        while rest.len() >= self.prefix.len()
            && rest.is_char_boundary(self.prefix.len())
            && rest[..self.prefix.len()].eq_ignore_ascii_case(&self.prefix)
        {
            rest = rest[self.prefix.len()..].trim_start();
        }
        rest.trim_end().to_string()
    }
}

/// DM access decision inputs for one account. Enforcement is the host's job;
/// see [`crate::access`] for ready-made checks.
#[derive(Debug, Clone)]
pub struct SecurityDecision {
    pub policy: DmPolicy,
    pub allow_from: Vec<String>,
    /// Config path of the policy field, for remediation messages.
    pub policy_path: String,
    /// Config path under which `allowFrom` lives for this account.
    pub allow_from_path: String,
    /// Command an operator runs to approve a pending sender.
    pub approve_hint: String,
    pub normalizer: PrefixNormalizer,
}

impl SecurityDecision {
    pub fn normalize_entry(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    /// `allow_from` with every entry normalized and blanks removed.
    pub fn normalized_allow_from(&self) -> Vec<String> {
        self.allow_from
            .iter()
            .map(|entry| self.normalize_entry(entry))
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}

/// Group access decision inputs for one account.
#[derive(Debug, Clone)]
pub struct GroupSecurityDecision {
    pub policy: GroupPolicy,
    pub allow_from: Vec<String>,
    pub policy_path: String,
    pub normalizer: PrefixNormalizer,
}

/// Security adapter a channel plugin may expose.
pub trait ChannelSecurityAdapter: Send + Sync {
    fn resolve_dm_policy(&self, account: &ResolvedAccount) -> SecurityDecision;

    fn resolve_group_policy(&self, account: &ResolvedAccount) -> GroupSecurityDecision;
}

/// Security adapter for channels using the standard account shape.
#[derive(Debug, Clone)]
pub struct StandardSecurityAdapter {
    channel_id: String,
}

impl StandardSecurityAdapter {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }

    fn account_path(&self, account_id: &str) -> String {
        if account_id == DEFAULT_ACCOUNT_ID {
            format!("channels.{}.", self.channel_id)
        } else {
            format!("channels.{}.accounts.{account_id}.", self.channel_id)
        }
    }
}

impl ChannelSecurityAdapter for StandardSecurityAdapter {
    fn resolve_dm_policy(&self, account: &ResolvedAccount) -> SecurityDecision {
        let path = self.account_path(&account.account_id);
        SecurityDecision {
            policy: account.config.dm_policy,
            allow_from: account.config.allow_from.clone(),
            policy_path: format!("{path}dmPolicy"),
            allow_from_path: path,
            approve_hint: format!(
                "Run: switchboard pairing approve {} <code>",
                self.channel_id
            ),
            normalizer: PrefixNormalizer::new(&self.channel_id),
        }
    }

    fn resolve_group_policy(&self, account: &ResolvedAccount) -> GroupSecurityDecision {
        GroupSecurityDecision {
            policy: account.config.group_policy,
            allow_from: account.config.allow_from.clone(),
            policy_path: format!("{}groupPolicy", self.account_path(&account.account_id)),
            normalizer: PrefixNormalizer::new(&self.channel_id),
        }
    }
}
