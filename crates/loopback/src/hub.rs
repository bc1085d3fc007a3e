use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    serde::Serialize,
    switchboard_channels::{
        ChannelConnector, ChannelProber, ChannelSession, Error, InboundMessage, PlatformClient,
        ResolvedAccount,
        outbound::{OutboundMedia, OutboundText},
        status::ProbeIdentity,
    },
    tokio::sync::mpsc,
    tracing::{debug, info},
};

/// A message the hub accepted from an outbound adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
    pub account_id: String,
    pub to: String,
    pub text: String,
    pub reply_to_id: Option<String>,
    pub media_url: Option<String>,
}

#[derive(Default)]
struct HubInner {
    sent: Mutex<Vec<SentMessage>>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>,
    revoked: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

/// In-process stand-in for a chat platform. Cheap to clone; clones share
/// state.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reject `token` from now on: sends and probes fail, connects fail
    /// fatally.
    pub fn revoke(&self, token: &str) {
        self.inner
            .revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string());
    }

    pub fn is_connected(&self, account_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(account_id)
    }

    /// Deliver `message` to the live session of `account_id`. Returns false
    /// when the account is not connected.
    pub fn inject(&self, account_id: &str, message: InboundMessage) -> bool {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(account_id)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Close the live session of `account_id` as if the platform hung up.
    pub fn disconnect(&self, account_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(account_id)
            .is_some()
    }

    fn check_token(&self, account: &ResolvedAccount) -> anyhow::Result<()> {
        let revoked = self.inner.revoked.lock().unwrap_or_else(|e| e.into_inner());
        if revoked.contains(account.token.expose_secret()) {
            anyhow::bail!("401 unauthorized: token revoked");
        }
        Ok(())
    }

    fn record(&self, account: &ResolvedAccount, mut message: SentMessage) -> String {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        message.message_id = id.to_string();
        message.account_id = account.account_id.clone();
        debug!(account_id = account.account_id, to = message.to, message_id = id, "loopback accepted message");
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        id.to_string()
    }
}

#[async_trait]
impl PlatformClient for LoopbackHub {
    async fn send_text(&self, account: &ResolvedAccount, message: OutboundText<'_>) -> anyhow::Result<String> {
        self.check_token(account)?;
        Ok(self.record(account, SentMessage {
            message_id: String::new(),
            account_id: String::new(),
            to: message.to.to_string(),
            text: message.text.to_string(),
            reply_to_id: message.reply_to_id.map(str::to_string),
            media_url: None,
        }))
    }

    async fn send_media(&self, account: &ResolvedAccount, message: OutboundMedia<'_>) -> anyhow::Result<String> {
        self.check_token(account)?;
        Ok(self.record(account, SentMessage {
            message_id: String::new(),
            account_id: String::new(),
            to: message.to.to_string(),
            text: message.caption.unwrap_or_default().to_string(),
            reply_to_id: None,
            media_url: Some(message.media_url.to_string()),
        }))
    }
}

#[async_trait]
impl ChannelProber for LoopbackHub {
    async fn probe(&self, account: &ResolvedAccount) -> anyhow::Result<ProbeIdentity> {
        self.check_token(account)?;
        Ok(ProbeIdentity {
            id: format!("bot-{}", account.account_id),
            username: Some(
                account
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}_bot", account.account_id)),
            ),
        })
    }
}

#[async_trait]
impl ChannelConnector for LoopbackHub {
    async fn connect(&self, account: &ResolvedAccount) -> anyhow::Result<Box<dyn ChannelSession>> {
        if let Err(e) = self.check_token(account) {
            return Err(Error::fatal(e).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.account_id.clone(), tx);
        info!(account_id = account.account_id, "loopback session opened");
        Ok(Box::new(LoopbackSession {
            hub: self.clone(),
            account_id: account.account_id.clone(),
            rx,
        }))
    }
}

struct LoopbackSession {
    hub: LoopbackHub,
    account_id: String,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl ChannelSession for LoopbackSession {
    async fn next_message(&mut self) -> anyhow::Result<Option<InboundMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.hub.disconnect(&self.account_id);
        debug!(account_id = self.account_id, "loopback session closed");
        Ok(())
    }
}
