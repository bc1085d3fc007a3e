//! `switchboard run`: start every enabled account, gate inbound messages,
//! and take operator commands on stdin until Ctrl-C.

use std::sync::Arc;

use {
    anyhow::{Result, anyhow, bail},
    async_trait::async_trait,
    switchboard_channels::{
        ChannelContext, ChannelEvent, ChannelEventSink, ChannelPlugin, ChannelRegistry, ChatKind,
        InboundMessage, ResolvedAccount, SendTextRequest,
        access::{AccessDenied, check_dm_access, check_group_access},
    },
    switchboard_config::ConfigSource,
    switchboard_loopback::{CHANNEL_ID as LOOPBACK, LoopbackHub},
    tokio::{sync::mpsc, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::channel_commands::selected_plugins;

const CONSOLE_HELP: &str = "\
commands:
  status                              show account runtimes
  pairing list [channel]              show pending pairing requests
  pairing approve <channel> <code>    admit the sender behind <code>
  pairing reject <channel> <code>     drop a pending request
  send <channel> <to> <text>          send from the default account
  inject <account> <sender> <text>    simulate a loopback direct message
  stop <channel> <account>            stop one account";

pub async fn run(
    registry: Arc<ChannelRegistry>,
    source: Arc<dyn ConfigSource>,
    hub: LoopbackHub,
    channel: Option<&str>,
    echo: bool,
) -> Result<()> {
    // Replies and operator commands go through a context without a sink so
    // the sink never holds a handle to itself.
    let plain = ChannelContext::new(Arc::clone(&source));
    let sink = Arc::new(HostSink {
        registry: Arc::clone(&registry),
        ctx: plain.clone(),
        echo,
    });
    let ctx = ChannelContext::new(source).with_event_sink(sink);

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let config = ctx.config();
    for plugin in selected_plugins(&registry, channel)? {
        if plugin.gateway().is_none() {
            debug!(channel = plugin.id(), "no gateway adapter, not starting");
            continue;
        }
        let adapter = plugin.config();
        for account_id in adapter.list_account_ids(&config) {
            let account = adapter.resolve_account(&config, Some(&account_id));
            if !account.enabled {
                info!(channel = plugin.id(), account_id, "account disabled, skipping");
                continue;
            }
            let (plugin, ctx, cancel) = (Arc::clone(&plugin), ctx.clone(), cancel.clone());
            tasks.spawn(async move {
                let result = match plugin.require_gateway() {
                    Ok(gateway) => gateway.start_account(&ctx, account, cancel).await,
                    Err(e) => Err(e),
                };
                (plugin.id().to_string(), account_id, result)
            });
        }
    }

    if tasks.is_empty() {
        warn!("no enabled channel accounts to start");
        return Ok(());
    }
    info!(accounts = tasks.len(), "channel accounts starting, type `help` for commands");

    let console = Console {
        registry: Arc::clone(&registry),
        ctx: plain,
        hub,
    };
    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            },
            line = lines.recv() => match line {
                Some(line) => {
                    if let Err(e) = console.handle(line.trim()).await {
                        eprintln!("error: {e:#}");
                    }
                },
                None => {
                    debug!("stdin closed, waiting for Ctrl-C");
                    tokio::signal::ctrl_c().await?;
                    break;
                },
            },
        }
    }

    info!("shutting down");
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((channel, account_id, Ok(()))) => debug!(channel, account_id, "account task finished"),
            Ok((channel, account_id, Err(e))) => {
                warn!(channel, account_id, error = %e, "account refused to start")
            },
            Err(e) => warn!(error = %e, "account task panicked"),
        }
    }
    Ok(())
}

/// Read stdin on a plain thread; a blocking read would otherwise hold up
/// runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// The host's side of the event sink: logs events and applies access
/// control to inbound messages.
struct HostSink {
    registry: Arc<ChannelRegistry>,
    ctx: ChannelContext,
    echo: bool,
}

#[async_trait]
impl ChannelEventSink for HostSink {
    async fn emit(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::AccountStarted {
                channel,
                account_id,
            } => info!(channel, account_id, "account started"),
            ChannelEvent::AccountStopped {
                channel,
                account_id,
            } => info!(channel, account_id, "account stopped"),
            ChannelEvent::AccountErrored {
                channel,
                account_id,
                error,
            } => warn!(channel, account_id, error, "account errored"),
            ChannelEvent::PairingRequested {
                channel,
                account_id,
                sender_id,
                code,
                ..
            } => info!(channel, account_id, sender_id, code, "pairing requested"),
            ChannelEvent::PairingApproved {
                channel,
                account_id,
                sender_id,
            } => info!(channel, account_id, sender_id, "pairing approved"),
        }
    }

    async fn dispatch_inbound(&self, message: InboundMessage) {
        if let Err(e) = self.handle_inbound(&message).await {
            warn!(
                channel = message.channel,
                account_id = message.account_id,
                sender_id = message.sender_id,
                error = %e,
                "failed to handle inbound message"
            );
        }
    }
}

impl HostSink {
    async fn handle_inbound(&self, message: &InboundMessage) -> Result<()> {
        let plugin = self
            .registry
            .get(&message.channel)
            .ok_or_else(|| anyhow!("no plugin for channel {}", message.channel))?;
        let config = self.ctx.config();
        let account = plugin
            .config()
            .resolve_account(&config, Some(&message.account_id));
        let username = message.username.as_deref();

        if let Some(security) = plugin.security() {
            let verdict = match message.chat_kind {
                ChatKind::Direct => {
                    let approved = plugin
                        .pairing()
                        .is_some_and(|p| p.is_approved(&account.account_id, &message.sender_id));
                    check_dm_access(
                        &security.resolve_dm_policy(&account),
                        &message.sender_id,
                        username,
                        approved,
                    )
                },
                ChatKind::Group | ChatKind::Thread => check_group_access(
                    &security.resolve_group_policy(&account),
                    &message.sender_id,
                    username,
                ),
            };
            match verdict {
                Ok(()) => {},
                Err(AccessDenied::PairingRequired) => {
                    return self.offer_pairing(plugin.as_ref(), &account, message).await;
                },
                Err(reason) => {
                    info!(
                        channel = message.channel,
                        account_id = message.account_id,
                        sender_id = message.sender_id,
                        %reason,
                        "inbound message denied"
                    );
                    return Ok(());
                },
            }
        }

        info!(
            channel = message.channel,
            account_id = message.account_id,
            chat_id = message.chat_id,
            sender_id = message.sender_id,
            text = message.text,
            "inbound message"
        );
        if self.echo {
            plugin
                .require_outbound()?
                .send_text(&self.ctx, SendTextRequest {
                    to: message.chat_id.clone(),
                    text: message.text.clone(),
                    account_id: Some(message.account_id.clone()),
                    reply_to_id: message.message_id.clone(),
                    thread_id: None,
                })
                .await?;
        }
        Ok(())
    }

    /// Issue a pairing code and tell the sender how to get approved.
    async fn offer_pairing(
        &self,
        plugin: &dyn ChannelPlugin,
        account: &ResolvedAccount,
        message: &InboundMessage,
    ) -> Result<()> {
        let pairing = plugin.require_pairing()?;
        let request = pairing
            .request_pairing(
                &self.ctx,
                &account.account_id,
                &message.sender_id,
                message.username.as_deref(),
            )
            .await?;
        info!(
            channel = plugin.id(),
            account_id = request.account_id,
            sender_id = request.sender_id,
            code = request.code,
            "pairing code issued"
        );

        let Some(outbound) = plugin.outbound() else {
            return Ok(());
        };
        let hint = plugin
            .require_security()?
            .resolve_dm_policy(account)
            .approve_hint
            .replace("<code>", &request.code);
        let text = format!(
            "This bot only answers paired senders.\nYour {}: {}\nPairing code: {}\n\nAsk the owner to approve it. {hint}",
            pairing.id_label(),
            message.sender_id,
            request.code,
        );
        outbound
            .send_text(&self.ctx, SendTextRequest {
                to: message.chat_id.clone(),
                text,
                account_id: Some(account.account_id.clone()),
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// Operator commands typed into the running host.
struct Console {
    registry: Arc<ChannelRegistry>,
    ctx: ChannelContext,
    hub: LoopbackHub,
}

impl Console {
    async fn handle(&self, line: &str) -> Result<()> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {},
            ["help"] => println!("{CONSOLE_HELP}"),
            ["status"] => {
                for plugin in self.registry.plugins() {
                    let Some(gateway) = plugin.gateway() else {
                        continue;
                    };
                    for runtime in gateway.runtimes() {
                        let error = runtime.last_error.as_deref().unwrap_or_default();
                        println!(
                            "{:<12} {:<16} {:<9} {error}",
                            plugin.id(),
                            runtime.account_id,
                            runtime.state.as_str()
                        );
                    }
                }
            },
            ["pairing", "list", rest @ ..] => {
                let channel = rest.first().copied();
                for plugin in selected_plugins(&self.registry, channel)? {
                    let Some(pairing) = plugin.pairing() else {
                        continue;
                    };
                    for request in pairing.list_pending(None) {
                        println!(
                            "{:<12} {:<16} {} {} {}",
                            plugin.id(),
                            request.account_id,
                            request.code,
                            request.sender_id,
                            request.username.as_deref().unwrap_or("-")
                        );
                    }
                }
            },
            ["pairing", "approve", channel, code] => {
                let plugin = self.plugin(channel)?;
                let request = plugin.require_pairing()?.approve(&self.ctx, code).await?;
                println!("approved {} on {}/{}", request.sender_id, channel, request.account_id);
            },
            ["pairing", "reject", channel, code] => {
                let request = self.plugin(channel)?.require_pairing()?.reject(code)?;
                println!("rejected {} on {}/{}", request.sender_id, channel, request.account_id);
            },
            ["send", channel, to, text @ ..] if !text.is_empty() => {
                let result = self
                    .plugin(channel)?
                    .require_outbound()?
                    .send_text(&self.ctx, SendTextRequest {
                        to: to.to_string(),
                        text: text.join(" "),
                        ..Default::default()
                    })
                    .await?;
                println!(
                    "sent {} chunk(s), last message id {}",
                    result.chunk_count, result.message_id
                );
            },
            ["inject", account_id, sender, text @ ..] if !text.is_empty() => {
                let message = InboundMessage {
                    channel: LOOPBACK.to_string(),
                    account_id: account_id.to_string(),
                    chat_id: sender.to_string(),
                    chat_kind: ChatKind::Direct,
                    sender_id: sender.to_string(),
                    username: None,
                    sender_name: None,
                    text: text.join(" "),
                    message_id: None,
                };
                if !self.hub.inject(account_id, message) {
                    bail!("loopback account {account_id} is not connected");
                }
            },
            ["stop", channel, account_id] => {
                self.plugin(channel)?
                    .require_gateway()?
                    .stop_account(&self.ctx, account_id)
                    .await?;
                println!("stopped {channel}/{account_id}");
            },
            _ => bail!("unrecognized command, type `help`"),
        }
        Ok(())
    }

    fn plugin(&self, channel: &str) -> Result<Arc<dyn ChannelPlugin>> {
        self.registry
            .get(channel)
            .ok_or_else(|| anyhow!("unknown channel: {channel}"))
    }
}
