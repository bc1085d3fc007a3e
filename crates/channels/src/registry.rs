use std::{collections::BTreeMap, sync::Arc};

#[cfg(feature = "metrics")]
use switchboard_metrics::{channels as ch_metrics, gauge};

use {super::plugin::ChannelPlugin, tracing::info};

/// Registry of all loaded channel plugins, keyed by channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    plugins: BTreeMap<String, Arc<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin, returning the one it replaced.
    pub fn register(&mut self, plugin: Arc<dyn ChannelPlugin>) -> Option<Arc<dyn ChannelPlugin>> {
        let id = plugin.id().to_string();
        info!(channel = id, adapters = ?plugin.adapters(), "registered channel plugin");
        let previous = self.plugins.insert(id, plugin);
        #[cfg(feature = "metrics")]
        gauge!(ch_metrics::REGISTERED).set(self.plugins.len() as f64);
        previous
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn ChannelPlugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins whose reload prefixes cover the changed config `path`.
    pub fn affected_by(&self, path: &str) -> Vec<&str> {
        self.plugins
            .iter()
            .filter(|(_, plugin)| {
                plugin.reload_prefixes().iter().any(|prefix| {
                    path == prefix
                        || path
                            .strip_prefix(prefix.as_str())
                            .is_some_and(|rest| rest.starts_with('.'))
                })
            })
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
