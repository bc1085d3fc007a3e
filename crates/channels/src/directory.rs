//! Read-only lookup of the bot itself, known peers, and groups.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::{
    Result,
    account::{ChannelConfigAdapter, DEFAULT_ACCOUNT_ID},
    context::ChannelContext,
    error::Error,
    security::PrefixNormalizer,
};

/// Kind of directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub kind: EntryKind,
    pub id: String,
    pub name: Option<String>,
    pub handle: Option<String>,
}

/// Filter for peer and group listings.
#[derive(Debug, Clone, Default)]
pub struct DirectoryQuery {
    pub account_id: Option<String>,
    /// Case-insensitive substring matched against id, name and handle.
    pub query: Option<String>,
    pub limit: Option<usize>,
}

impl DirectoryQuery {
    fn matches(&self, entry: &DirectoryEntry) -> bool {
        let Some(needle) = self
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
        else {
            return true;
        };
        let needle = needle.to_lowercase();
        [Some(&entry.id), entry.name.as_ref(), entry.handle.as_ref()]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&needle))
    }

    /// Apply the query filter and limit to `entries`.
    pub fn apply(&self, entries: impl IntoIterator<Item = DirectoryEntry>) -> Vec<DirectoryEntry> {
        entries
            .into_iter()
            .filter(|entry| self.matches(entry))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Directory adapter a channel plugin may expose. Every lookup defaults to
/// "nothing known".
#[async_trait]
pub trait ChannelDirectoryAdapter: Send + Sync {
    async fn self_entry(&self, _ctx: &ChannelContext, _account_id: Option<&str>) -> Result<Option<DirectoryEntry>> {
        Ok(None)
    }

    async fn list_peers(&self, _ctx: &ChannelContext, _query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>> {
        Ok(Vec::new())
    }

    async fn list_groups(&self, _ctx: &ChannelContext, _query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>> {
        Ok(Vec::new())
    }
}

/// Directory with no entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDirectory;

impl ChannelDirectoryAdapter for EmptyDirectory {}

/// Directory backed by configuration: peers are the account's `allowFrom`
/// entries, the self entry is the account's configured name.
pub struct ConfigDirectory {
    config: Arc<dyn ChannelConfigAdapter>,
    normalizer: PrefixNormalizer,
}

impl ConfigDirectory {
    pub fn new(config: Arc<dyn ChannelConfigAdapter>) -> Self {
        Self {
            normalizer: PrefixNormalizer::new(config.channel_id()),
            config,
        }
    }
}

#[async_trait]
impl ChannelDirectoryAdapter for ConfigDirectory {
    /// Fails with [`Error::UnknownAccount`] for a named account that is not
    /// configured.
    async fn self_entry(&self, ctx: &ChannelContext, account_id: Option<&str>) -> Result<Option<DirectoryEntry>> {
        let config = ctx.config();
        if let Some(id) = account_id.map(str::trim)
            && !id.is_empty()
            && id != DEFAULT_ACCOUNT_ID
            && !self.config.list_account_ids(&config).iter().any(|known| known == id)
        {
            return Err(Error::unknown_account(id));
        }
        let account = self.config.resolve_account(&config, account_id);
        Ok(account.name.map(|name| DirectoryEntry {
            kind: EntryKind::User,
            id: account.account_id,
            name: Some(name),
            handle: None,
        }))
    }

    async fn list_peers(&self, ctx: &ChannelContext, query: &DirectoryQuery) -> Result<Vec<DirectoryEntry>> {
        let allow_from = self
            .config
            .resolve_allow_from(&ctx.config(), query.account_id.as_deref());
        let mut seen = std::collections::HashSet::new();
        let entries = allow_from
            .iter()
            .map(|raw| self.normalizer.normalize(raw))
            .filter(|id| !id.is_empty() && id != "*" && seen.insert(id.clone()))
            .map(|id| {
                let handle = id.strip_prefix('@').map(str::to_string);
                DirectoryEntry {
                    kind: EntryKind::User,
                    id,
                    name: None,
                    handle,
                }
            });
        Ok(query.apply(entries))
    }
}
