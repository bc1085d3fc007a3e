use serde::Serialize;

use crate::{
    Result,
    account::ChannelConfigAdapter,
    directory::ChannelDirectoryAdapter,
    error::Error,
    event::ChatKind,
    gateway::ChannelGatewayAdapter,
    messaging::ChannelMessagingAdapter,
    outbound::ChannelOutboundAdapter,
    pairing::ChannelPairingAdapter,
    security::ChannelSecurityAdapter,
    status::ChannelStatusAdapter,
};

// ── Descriptors ─────────────────────────────────────────────────────────────

/// Static description of a channel, for pickers and docs links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMeta {
    pub id: String,
    pub label: String,
    pub selection_label: String,
    pub docs_path: String,
    pub blurb: String,
    pub aliases: Vec<String>,
}

impl ChannelMeta {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        let id = id.into();
        let label = label.into();
        Self {
            docs_path: format!("/channels/{id}"),
            selection_label: label.clone(),
            blurb: String::new(),
            aliases: Vec::new(),
            id,
            label,
        }
    }
}

/// What the platform can do. Hosts use this to decide which features to
/// offer; adapters do not enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    pub chat_types: Vec<ChatKind>,
    pub reactions: bool,
    pub threads: bool,
    pub media: bool,
    pub polls: bool,
    pub edit: bool,
    pub reply: bool,
}

impl Default for ChannelCapabilities {
    fn default() -> Self {
        Self {
            chat_types: vec![ChatKind::Direct],
            reactions: false,
            threads: false,
            media: false,
            polls: false,
            edit: false,
            reply: false,
        }
    }
}

/// Optional adapter slots of a [`ChannelPlugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Security,
    Outbound,
    Gateway,
    Status,
    Pairing,
    Messaging,
    Directory,
}

impl AdapterKind {
    pub const ALL: [Self; 7] = [
        Self::Security,
        Self::Outbound,
        Self::Gateway,
        Self::Status,
        Self::Pairing,
        Self::Messaging,
        Self::Directory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Outbound => "outbound",
            Self::Gateway => "gateway",
            Self::Status => "status",
            Self::Pairing => "pairing",
            Self::Messaging => "messaging",
            Self::Directory => "directory",
        }
    }
}

// ── Plugin trait ────────────────────────────────────────────────────────────

/// A channel plugin: identity, capabilities, and a bundle of adapters.
///
/// Only the config adapter is mandatory. Hosts must check the optional ones
/// (or use the `require_*` helpers) before calling into them.
pub trait ChannelPlugin: Send + Sync {
    /// Channel id, e.g. `"telegram"`. Also the key of its config block.
    fn id(&self) -> &str;

    fn meta(&self) -> &ChannelMeta;

    fn capabilities(&self) -> &ChannelCapabilities;

    fn config(&self) -> &dyn ChannelConfigAdapter;

    fn security(&self) -> Option<&dyn ChannelSecurityAdapter> {
        None
    }

    fn outbound(&self) -> Option<&dyn ChannelOutboundAdapter> {
        None
    }

    fn gateway(&self) -> Option<&dyn ChannelGatewayAdapter> {
        None
    }

    fn status(&self) -> Option<&dyn ChannelStatusAdapter> {
        None
    }

    fn pairing(&self) -> Option<&dyn ChannelPairingAdapter> {
        None
    }

    fn messaging(&self) -> Option<&dyn ChannelMessagingAdapter> {
        None
    }

    fn directory(&self) -> Option<&dyn ChannelDirectoryAdapter> {
        None
    }

    /// Config paths whose change requires this channel's accounts to reload.
    fn reload_prefixes(&self) -> Vec<String> {
        vec![format!("channels.{}", self.id())]
    }

    fn supports(&self, kind: AdapterKind) -> bool {
        match kind {
            AdapterKind::Security => self.security().is_some(),
            AdapterKind::Outbound => self.outbound().is_some(),
            AdapterKind::Gateway => self.gateway().is_some(),
            AdapterKind::Status => self.status().is_some(),
            AdapterKind::Pairing => self.pairing().is_some(),
            AdapterKind::Messaging => self.messaging().is_some(),
            AdapterKind::Directory => self.directory().is_some(),
        }
    }

    /// Adapters this plugin provides.
    fn adapters(&self) -> Vec<AdapterKind> {
        AdapterKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }

    fn require_security(&self) -> Result<&dyn ChannelSecurityAdapter> {
        self.security()
            .ok_or_else(|| missing(self.id(), AdapterKind::Security))
    }

    fn require_outbound(&self) -> Result<&dyn ChannelOutboundAdapter> {
        self.outbound()
            .ok_or_else(|| missing(self.id(), AdapterKind::Outbound))
    }

    fn require_gateway(&self) -> Result<&dyn ChannelGatewayAdapter> {
        self.gateway()
            .ok_or_else(|| missing(self.id(), AdapterKind::Gateway))
    }

    fn require_status(&self) -> Result<&dyn ChannelStatusAdapter> {
        self.status()
            .ok_or_else(|| missing(self.id(), AdapterKind::Status))
    }

    fn require_pairing(&self) -> Result<&dyn ChannelPairingAdapter> {
        self.pairing()
            .ok_or_else(|| missing(self.id(), AdapterKind::Pairing))
    }

    fn require_messaging(&self) -> Result<&dyn ChannelMessagingAdapter> {
        self.messaging()
            .ok_or_else(|| missing(self.id(), AdapterKind::Messaging))
    }

    fn require_directory(&self) -> Result<&dyn ChannelDirectoryAdapter> {
        self.directory()
            .ok_or_else(|| missing(self.id(), AdapterKind::Directory))
    }
}

fn missing(channel_id: &str, kind: AdapterKind) -> Error {
    Error::not_implemented(format!("{channel_id}.{}", kind.as_str()))
}
