use {async_trait::async_trait, serde::Serialize};

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
    Thread,
}

/// A message received on a live connection, forwarded to the host.
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    pub channel: String,
    pub account_id: String,
    /// Conversation to reply into.
    pub chat_id: String,
    pub chat_kind: ChatKind,
    pub sender_id: String,
    pub username: Option<String>,
    pub sender_name: Option<String>,
    pub text: String,
    /// Platform message id, usable as a reply target.
    pub message_id: Option<String>,
}

/// Host-visible notifications emitted by channel components.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    AccountStarted {
        channel: String,
        account_id: String,
    },
    AccountStopped {
        channel: String,
        account_id: String,
    },
    /// The account's connection failed for good; see `RuntimeState::last_error`.
    AccountErrored {
        channel: String,
        account_id: String,
        error: String,
    },
    /// A sender asked to be admitted and was issued a pairing code.
    PairingRequested {
        channel: String,
        account_id: String,
        sender_id: String,
        username: Option<String>,
        code: String,
    },
    PairingApproved {
        channel: String,
        account_id: String,
        sender_id: String,
    },
}

/// Sink for channel events. The host provides the concrete implementation.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    /// Broadcast a lifecycle or pairing event.
    async fn emit(&self, event: ChannelEvent);

    /// Hand an inbound message to the host's message-handling entry point.
    async fn dispatch_inbound(&self, message: InboundMessage);
}
