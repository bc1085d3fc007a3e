//! CLI subcommands for inspecting and managing channel accounts.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Result, anyhow, bail},
    clap::Subcommand,
    serde::Serialize,
    switchboard_channels::{AccountSnapshot, ChannelContext, ChannelPlugin, ChannelRegistry},
    switchboard_config::ConfigSource,
};

#[derive(Subcommand)]
pub enum ChannelAction {
    /// List configured accounts.
    List {
        /// Only list accounts of this channel.
        #[arg(long)]
        channel: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Probe every account and print its status.
    Status {
        #[arg(long)]
        channel: Option<String>,
        /// Probe timeout (defaults to `status.probeTimeoutMs`).
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove an account's credentials from the config.
    Logout {
        channel: String,
        /// Account id (defaults to the channel's default account).
        #[arg(long)]
        account: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountRow {
    channel: String,
    account_id: String,
    name: Option<String>,
    enabled: bool,
    configured: bool,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChannelSnapshot {
    channel: String,
    #[serde(flatten)]
    snapshot: AccountSnapshot,
}

pub async fn handle_channels(
    action: ChannelAction,
    registry: &ChannelRegistry,
    source: Arc<dyn ConfigSource>,
) -> Result<()> {
    let ctx = ChannelContext::new(source);
    match action {
        ChannelAction::List { channel, json } => {
            let rows = list_accounts(registry, &ctx, channel.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no channel accounts configured");
            } else {
                for row in rows {
                    let state = match (row.enabled, row.reason) {
                        (false, _) => "disabled".to_string(),
                        (true, Some(reason)) => reason,
                        (true, None) => "ok".to_string(),
                    };
                    println!("{:<12} {:<16} {state}", row.channel, row.account_id);
                }
            }
            Ok(())
        },
        ChannelAction::Status {
            channel,
            timeout_ms,
            json,
        } => {
            let snapshots = probe_accounts(registry, &ctx, channel.as_deref(), timeout_ms).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
                return Ok(());
            }
            for ChannelSnapshot { channel, snapshot } in snapshots {
                let probe = match &snapshot.probe {
                    Some(probe) if probe.ok => {
                        let who = probe
                            .identity
                            .as_ref()
                            .map(|identity| identity.username.clone().unwrap_or_else(|| identity.id.clone()))
                            .unwrap_or_default();
                        format!("probe ok ({who}, {}ms)", probe.elapsed_ms)
                    },
                    Some(probe) => format!(
                        "probe failed: {}",
                        probe.error.as_deref().unwrap_or("unknown error")
                    ),
                    None => "not probed".to_string(),
                };
                println!(
                    "{channel:<12} {:<16} dm={} groups={} {probe}",
                    snapshot.account_id,
                    snapshot.dm_policy.as_str(),
                    snapshot.group_policy.as_str(),
                );
            }
            Ok(())
        },
        ChannelAction::Logout { channel, account } => {
            let plugin = registry
                .get(&channel)
                .ok_or_else(|| anyhow!("unknown channel: {channel}"))?;
            let account_id = account.unwrap_or_else(|| plugin.config().default_account_id(&ctx.config()));
            let result = plugin.require_gateway()?.logout_account(&ctx, &account_id).await?;
            if result.cleared {
                println!("{channel}/{account_id}: credentials removed");
            } else {
                println!("{channel}/{account_id}: no stored credentials");
            }
            Ok(())
        },
    }
}

/// Plugins selected by an optional `--channel` filter.
pub(crate) fn selected_plugins(
    registry: &ChannelRegistry,
    channel: Option<&str>,
) -> Result<Vec<Arc<dyn ChannelPlugin>>> {
    match channel {
        Some(id) => match registry.get(id) {
            Some(plugin) => Ok(vec![plugin]),
            None => bail!("unknown channel: {id}"),
        },
        None => Ok(registry.plugins().cloned().collect()),
    }
}

fn list_accounts(
    registry: &ChannelRegistry,
    ctx: &ChannelContext,
    channel: Option<&str>,
) -> Result<Vec<AccountRow>> {
    let config = ctx.config();
    let mut rows = Vec::new();
    for plugin in selected_plugins(registry, channel)? {
        let adapter = plugin.config();
        for account_id in adapter.list_account_ids(&config) {
            let account = adapter.resolve_account(&config, Some(&account_id));
            let configured = adapter.is_configured(&account);
            rows.push(AccountRow {
                channel: plugin.id().to_string(),
                reason: (!configured).then(|| adapter.unconfigured_reason(&account)),
                account_id: account.account_id,
                name: account.name,
                enabled: account.enabled,
                configured,
            });
        }
    }
    Ok(rows)
}

/// Probe every account of the selected channels. This process never runs
/// the accounts, so snapshots carry the never-started runtime.
async fn probe_accounts(
    registry: &ChannelRegistry,
    ctx: &ChannelContext,
    channel: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<Vec<ChannelSnapshot>> {
    let config = ctx.config();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.status.probe_timeout_ms));
    let mut snapshots = Vec::new();
    for plugin in selected_plugins(registry, channel)? {
        let Some(status) = plugin.status() else {
            continue;
        };
        let adapter = plugin.config();
        for account_id in adapter.list_account_ids(&config) {
            let account = adapter.resolve_account(&config, Some(&account_id));
            let probe = status.probe_account(&account, timeout).await;
            snapshots.push(ChannelSnapshot {
                channel: plugin.id().to_string(),
                snapshot: status.build_account_snapshot(&account, None, Some(&probe)),
            });
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        serde_json::json,
        switchboard_config::{MemoryConfig, SwitchboardConfig},
        switchboard_loopback::{LoopbackHub, LoopbackPlugin},
    };

    fn setup(block: serde_json::Value) -> (ChannelRegistry, ChannelContext, LoopbackHub) {
        let mut config = SwitchboardConfig::default();
        config.channels.insert("loopback".into(), block);
        let hub = LoopbackHub::new();
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(LoopbackPlugin::new(hub.clone())));
        let ctx = ChannelContext::new(Arc::new(MemoryConfig::new(config)));
        (registry, ctx, hub)
    }

    #[test]
    fn unknown_channel_filter_is_an_error() {
        let (registry, _, _) = setup(json!({}));
        assert!(selected_plugins(&registry, Some("nope")).is_err());
        assert_eq!(selected_plugins(&registry, None).unwrap().len(), 1);
    }

    #[test]
    fn list_reports_unconfigured_accounts() {
        let (registry, ctx, _) = setup(json!({
            "botToken": "T",
            "accounts": { "spare": { "enabled": false, "botToken": "" } }
        }));
        let rows = list_accounts(&registry, &ctx, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account_id, "default");
        assert!(rows[0].configured && rows[0].reason.is_none());
        assert!(!rows[1].enabled);
        assert_eq!(rows[1].reason.as_deref(), Some("bot token not configured"));
    }

    #[tokio::test]
    async fn status_probes_each_account() {
        let (registry, ctx, hub) = setup(json!({
            "botToken": "T",
            "accounts": { "old": { "botToken": "R" } }
        }));
        hub.revoke("R");

        let snapshots = probe_accounts(&registry, &ctx, Some("loopback"), Some(100))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].snapshot.probe.as_ref().unwrap().ok);
        assert!(!snapshots[1].snapshot.probe.as_ref().unwrap().ok);
        assert!(!snapshots[1].snapshot.running);

        let json = serde_json::to_value(&snapshots[0]).unwrap();
        assert_eq!(json["channel"], "loopback");
        assert_eq!(json["accountId"], "default");
    }
}
