//! Host configuration schema.
//!
//! Only the host-level shape lives here. Each `channels.<id>` block stays a
//! raw JSON value; the owning channel plugin resolves it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Channel blocks keyed by channel id (e.g. `"loopback"`).
    pub channels: BTreeMap<String, serde_json::Value>,

    /// Status probing settings.
    pub status: StatusConfig,

    /// Sender pairing settings shared by every channel.
    pub pairing: PairingConfig,
}

impl SwitchboardConfig {
    /// The raw block for `channel_id`, if configured.
    pub fn channel(&self, channel_id: &str) -> Option<&serde_json::Value> {
        self.channels.get(channel_id)
    }

    /// Mutable access to the block for `channel_id`, inserting an empty
    /// object when absent or when the existing value is not an object.
    pub fn channel_mut(&mut self, channel_id: &str) -> &mut serde_json::Map<String, serde_json::Value> {
        let slot = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if !slot.is_object() {
            *slot = serde_json::Value::Object(Default::default());
        }
        match slot {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("slot was just replaced with an object"),
        }
    }
}

/// Status probing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusConfig {
    /// Upper bound for a single connectivity probe (ms).
    pub probe_timeout_ms: u64,

    /// How long a probe result may be reused (seconds). Zero disables caching.
    pub probe_cache_ttl_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000,
            probe_cache_ttl_secs: 30,
        }
    }
}

/// Sender pairing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PairingConfig {
    /// How long an issued pairing code stays valid (seconds).
    pub code_ttl_secs: u64,

    /// Notice sent to a sender once approved. Channels use their own text
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_message: Option<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 60 * 60,
            approval_message: None,
        }
    }
}
