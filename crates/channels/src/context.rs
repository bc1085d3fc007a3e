use std::sync::Arc;

use {
    switchboard_config::{ConfigSource, SwitchboardConfig},
    tracing::debug,
};

use crate::{
    Result,
    error::Error,
    event::{ChannelEvent, ChannelEventSink, InboundMessage},
};

/// Everything an adapter call may touch on the host side: configuration
/// (read as snapshots, written through the source) and the event sink.
///
/// Hosts build one per channel and pass it into adapter calls; nothing in
/// this crate keeps a process-wide handle.
#[derive(Clone)]
pub struct ChannelContext {
    config: Arc<dyn ConfigSource>,
    event_sink: Option<Arc<dyn ChannelEventSink>>,
}

impl ChannelContext {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            config,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn ChannelEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<SwitchboardConfig> {
        self.config.snapshot()
    }

    /// Delegate a configuration write to the host.
    pub fn update_config(&self, edit: &mut dyn FnMut(&mut SwitchboardConfig)) -> Result<()> {
        self.config.update(edit).map_err(Error::config)
    }

    pub fn event_sink(&self) -> Option<&Arc<dyn ChannelEventSink>> {
        self.event_sink.as_ref()
    }

    pub async fn emit(&self, event: ChannelEvent) {
        match &self.event_sink {
            Some(sink) => sink.emit(event).await,
            None => debug!(?event, "no event sink, dropping channel event"),
        }
    }

    /// Forward an inbound message to the host. Returns false when no sink is
    /// attached and the message was dropped.
    pub async fn dispatch_inbound(&self, message: InboundMessage) -> bool {
        match &self.event_sink {
            Some(sink) => {
                sink.dispatch_inbound(message).await;
                true
            },
            None => {
                debug!(
                    channel = message.channel,
                    account_id = message.account_id,
                    "no event sink, dropping inbound message"
                );
                false
            },
        }
    }
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("event_sink", &self.event_sink.is_some())
            .finish_non_exhaustive()
    }
}
