use std::{num::NonZeroUsize, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{channels as ch_metrics, counter};

use crate::{
    Result,
    account::{ChannelConfigAdapter, ResolvedAccount},
    context::ChannelContext,
    error::Error,
};

/// Default per-message character limit.
pub const DEFAULT_TEXT_CHUNK_LIMIT: NonZeroUsize = match NonZeroUsize::new(4000) {
    Some(limit) => limit,
    None => panic!("chunk limit must be non-zero"),
};

/// How outbound messages reach the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Sent straight to the platform API.
    #[default]
    Direct,
    /// Sent through the live gateway connection.
    Gateway,
    /// Either, depending on the message.
    Hybrid,
}

/// How long text is split into platform-sized messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Fixed-width slices.
    #[default]
    Length,
    /// Prefer breaking after newlines, then after spaces.
    Newline,
}

impl ChunkMode {
    pub fn chunk(self, text: &str, limit: NonZeroUsize) -> Vec<String> {
        match self {
            Self::Length => chunk_text(text, limit),
            Self::Newline => chunk_at_boundaries(text, limit),
        }
    }
}

/// Split `text` into consecutive slices of at most `limit` characters.
///
/// Concatenating the result reproduces `text` exactly; empty text yields no
/// chunks.
pub fn chunk_text(text: &str, limit: NonZeroUsize) -> Vec<String> {
    let limit = limit.get();
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split `text` into chunks of at most `limit` characters, breaking after the
/// last newline in the window, else after the last space, else at the
/// window edge. Separators stay attached to the chunk they end, so the
/// chunks still concatenate back to `text`.
pub fn chunk_at_boundaries(text: &str, limit: NonZeroUsize) -> Vec<String> {
    let limit = limit.get();
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the `limit`-th char, or the whole remainder.
        let window_end = remaining
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        if window_end == remaining.len() {
            chunks.push(remaining.to_string());
            break;
        }

        let window = &remaining[..window_end];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|i| i + 1)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    chunks
}

/// A text send request as the host issues it.
#[derive(Debug, Clone, Default)]
pub struct SendTextRequest {
    pub to: String,
    pub text: String,
    pub account_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
}

/// A media send request as the host issues it.
#[derive(Debug, Clone, Default)]
pub struct SendMediaRequest {
    pub to: String,
    /// Optional caption.
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub account_id: Option<String>,
}

/// Outcome of a successful send, stamped with the channel id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub channel: String,
    /// Platform id of the last message sent.
    pub message_id: String,
    pub chunk_count: usize,
}

/// One text message handed to the platform client.
#[derive(Debug, Clone, Copy)]
pub struct OutboundText<'a> {
    pub to: &'a str,
    pub text: &'a str,
    pub reply_to_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
}

/// One media message handed to the platform client.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMedia<'a> {
    pub to: &'a str,
    pub caption: Option<&'a str>,
    pub media_url: &'a str,
}

/// The platform network client. Returns the platform message id.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn send_text(
        &self,
        account: &ResolvedAccount,
        message: OutboundText<'_>,
    ) -> anyhow::Result<String>;

    async fn send_media(
        &self,
        account: &ResolvedAccount,
        message: OutboundMedia<'_>,
    ) -> anyhow::Result<String>;
}

/// Outbound adapter a channel plugin may expose.
#[async_trait]
pub trait ChannelOutboundAdapter: Send + Sync {
    fn delivery_mode(&self) -> DeliveryMode;

    fn text_chunk_limit(&self) -> NonZeroUsize {
        DEFAULT_TEXT_CHUNK_LIMIT
    }

    fn chunk(&self, text: &str, limit: NonZeroUsize) -> Vec<String> {
        chunk_text(text, limit)
    }

    async fn send_text(&self, ctx: &ChannelContext, request: SendTextRequest) -> Result<DeliveryResult>;

    async fn send_media(&self, ctx: &ChannelContext, request: SendMediaRequest) -> Result<DeliveryResult>;
}

/// Standard outbound adapter: resolves the account, chunks, and drives a
/// [`PlatformClient`].
pub struct OutboundDispatcher<C> {
    config: Arc<dyn ChannelConfigAdapter>,
    client: C,
    delivery_mode: DeliveryMode,
    text_chunk_limit: NonZeroUsize,
    chunk_mode: ChunkMode,
}

impl<C: PlatformClient> OutboundDispatcher<C> {
    pub fn new(config: Arc<dyn ChannelConfigAdapter>, client: C) -> Self {
        Self {
            config,
            client,
            delivery_mode: DeliveryMode::default(),
            text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            chunk_mode: ChunkMode::default(),
        }
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_text_chunk_limit(mut self, limit: NonZeroUsize) -> Self {
        self.text_chunk_limit = limit;
        self
    }

    pub fn with_chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.chunk_mode = mode;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn channel_id(&self) -> &str {
        self.config.channel_id()
    }

    fn delivery_failed(&self, account_id: &str, to: &str, error: anyhow::Error) -> Error {
        warn!(
            channel = self.channel_id(),
            account_id,
            to,
            error = %error,
            "outbound delivery failed"
        );
        #[cfg(feature = "metrics")]
        counter!(ch_metrics::ERRORS_TOTAL, "channel" => self.channel_id().to_string(), "kind" => "delivery")
            .increment(1);
        Error::delivery(self.channel_id(), error)
    }
}

#[async_trait]
impl<C: PlatformClient> ChannelOutboundAdapter for OutboundDispatcher<C> {
    fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    fn text_chunk_limit(&self) -> NonZeroUsize {
        self.text_chunk_limit
    }

    fn chunk(&self, text: &str, limit: NonZeroUsize) -> Vec<String> {
        self.chunk_mode.chunk(text, limit)
    }

    async fn send_text(&self, ctx: &ChannelContext, request: SendTextRequest) -> Result<DeliveryResult> {
        if request.to.trim().is_empty() {
            return Err(Error::invalid_request("recipient is required"));
        }
        if request.text.trim().is_empty() {
            return Err(Error::invalid_request("text is required"));
        }

        let config = ctx.config();
        let account = self
            .config
            .resolve_account(&config, request.account_id.as_deref());
        let chunks = self.chunk(&request.text, self.text_chunk_limit);
        info!(
            channel = self.channel_id(),
            account_id = account.account_id,
            to = request.to,
            text_len = request.text.len(),
            chunk_count = chunks.len(),
            "outbound text send start"
        );

        let mut message_id = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let message = OutboundText {
                to: &request.to,
                text: chunk,
                // Only the first chunk threads under the replied-to message.
                reply_to_id: if i == 0 {
                    request.reply_to_id.as_deref()
                } else {
                    None
                },
                thread_id: request.thread_id.as_deref(),
            };
            message_id = match self.client.send_text(&account, message).await {
                Ok(id) => id,
                Err(e) if i == 0 => {
                    return Err(self.delivery_failed(&account.account_id, &request.to, e));
                },
                Err(e) => {
                    warn!(
                        channel = self.channel_id(),
                        account_id = account.account_id,
                        to = request.to,
                        delivered = i,
                        chunk_count = chunks.len(),
                        last_message_id = message_id,
                        "outbound text partially delivered"
                    );
                    let e = anyhow::anyhow!(
                        "{e:#} (after {i} of {} chunks, last message id {message_id})",
                        chunks.len()
                    );
                    return Err(self.delivery_failed(&account.account_id, &request.to, e));
                },
            };
            debug!(account_id = account.account_id, chunk = i, message_id, "chunk sent");
            #[cfg(feature = "metrics")]
            counter!(ch_metrics::MESSAGES_SENT_TOTAL, "channel" => self.channel_id().to_string())
                .increment(1);
        }

        Ok(DeliveryResult {
            channel: self.channel_id().to_string(),
            message_id,
            chunk_count: chunks.len(),
        })
    }

    async fn send_media(&self, ctx: &ChannelContext, request: SendMediaRequest) -> Result<DeliveryResult> {
        let Some(media_url) = request
            .media_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            return Err(Error::invalid_request("mediaUrl is required for media messages"));
        };
        if request.to.trim().is_empty() {
            return Err(Error::invalid_request("recipient is required"));
        }

        let config = ctx.config();
        let account = self
            .config
            .resolve_account(&config, request.account_id.as_deref());
        info!(
            channel = self.channel_id(),
            account_id = account.account_id,
            to = request.to,
            media_url,
            "outbound media send start"
        );

        let message = OutboundMedia {
            to: &request.to,
            caption: request.text.as_deref().filter(|t| !t.trim().is_empty()),
            media_url,
        };
        let message_id = self
            .client
            .send_media(&account, message)
            .await
            .map_err(|e| self.delivery_failed(&account.account_id, &request.to, e))?;
        #[cfg(feature = "metrics")]
        counter!(ch_metrics::MESSAGES_SENT_TOTAL, "channel" => self.channel_id().to_string())
            .increment(1);

        Ok(DeliveryResult {
            channel: self.channel_id().to_string(),
            message_id,
            chunk_count: 1,
        })
    }
}
