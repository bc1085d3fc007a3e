use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use {
    switchboard_channels::{
        ChannelCapabilities, ChannelConfigAdapter, ChannelDirectoryAdapter, ChannelGatewayAdapter,
        ChannelMessagingAdapter, ChannelMeta, ChannelOutboundAdapter, ChannelPairingAdapter,
        ChannelPlugin, ChannelSecurityAdapter, ChannelStatusAdapter, ChatKind, GatewayLifecycle,
        OutboundDispatcher, PairingController, StandardConfigAdapter, StandardMessaging,
        StandardSecurityAdapter, StatusMonitor,
        directory::ConfigDirectory,
        gateway::BackoffPolicy,
        outbound::{ChunkMode, DEFAULT_TEXT_CHUNK_LIMIT, DeliveryMode},
    },
    switchboard_config::{PairingConfig, StatusConfig, SwitchboardConfig},
};

use crate::hub::LoopbackHub;

pub const CHANNEL_ID: &str = "loopback";

/// Tunables for [`LoopbackPlugin`].
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub text_chunk_limit: NonZeroUsize,
    pub chunk_mode: ChunkMode,
    pub backoff: BackoffPolicy,
    pub probe_cache_ttl: Duration,
    pub pairing_ttl: Duration,
    /// Overrides the default approval notice.
    pub approval_message: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            chunk_mode: ChunkMode::Length,
            backoff: BackoffPolicy::default(),
            probe_cache_ttl: Duration::from_secs(StatusConfig::default().probe_cache_ttl_secs),
            pairing_ttl: Duration::from_secs(PairingConfig::default().code_ttl_secs),
            approval_message: None,
        }
    }
}

impl LoopbackOptions {
    /// Options honoring the host's status and pairing settings.
    pub fn from_config(config: &SwitchboardConfig) -> Self {
        Self {
            probe_cache_ttl: Duration::from_secs(config.status.probe_cache_ttl_secs),
            pairing_ttl: Duration::from_secs(config.pairing.code_ttl_secs),
            approval_message: config.pairing.approval_message.clone(),
            ..Self::default()
        }
    }
}

/// Loopback plugin wiring every standard adapter to a [`LoopbackHub`].
pub struct LoopbackPlugin {
    meta: ChannelMeta,
    capabilities: ChannelCapabilities,
    hub: LoopbackHub,
    config: Arc<StandardConfigAdapter>,
    security: StandardSecurityAdapter,
    outbound: Arc<OutboundDispatcher<LoopbackHub>>,
    gateway: GatewayLifecycle<LoopbackHub>,
    status: StatusMonitor<LoopbackHub>,
    pairing: PairingController,
    messaging: StandardMessaging,
    directory: ConfigDirectory,
}

impl LoopbackPlugin {
    pub fn new(hub: LoopbackHub) -> Self {
        Self::with_options(hub, LoopbackOptions::default())
    }

    pub fn with_options(hub: LoopbackHub, options: LoopbackOptions) -> Self {
        let config = Arc::new(StandardConfigAdapter::new(CHANNEL_ID));
        let outbound = Arc::new(
            OutboundDispatcher::new(config.clone(), hub.clone())
                .with_delivery_mode(DeliveryMode::Direct)
                .with_text_chunk_limit(options.text_chunk_limit)
                .with_chunk_mode(options.chunk_mode),
        );
        let mut pairing = PairingController::new(config.clone())
            .with_outbound(outbound.clone())
            .with_id_label("loopback user id")
            .with_ttl(options.pairing_ttl);
        if let Some(message) = options.approval_message {
            pairing = pairing.with_approval_message(message);
        }

        let mut meta = ChannelMeta::new(CHANNEL_ID, "Loopback");
        meta.blurb = "In-process channel for tests and demos.".into();
        meta.aliases = vec!["echo".into()];

        Self {
            meta,
            capabilities: ChannelCapabilities {
                chat_types: vec![ChatKind::Direct, ChatKind::Group],
                media: true,
                reply: true,
                ..ChannelCapabilities::default()
            },
            security: StandardSecurityAdapter::new(CHANNEL_ID),
            gateway: GatewayLifecycle::new(CHANNEL_ID, hub.clone()).with_backoff(options.backoff),
            status: StatusMonitor::new(CHANNEL_ID, hub.clone()).with_cache_ttl(options.probe_cache_ttl),
            messaging: StandardMessaging::new(CHANNEL_ID),
            directory: ConfigDirectory::new(config.clone()),
            pairing,
            outbound,
            config,
            hub,
        }
    }

    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }
}

impl ChannelPlugin for LoopbackPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    fn capabilities(&self) -> &ChannelCapabilities {
        &self.capabilities
    }

    fn config(&self) -> &dyn ChannelConfigAdapter {
        self.config.as_ref()
    }

    fn security(&self) -> Option<&dyn ChannelSecurityAdapter> {
        Some(&self.security)
    }

    fn outbound(&self) -> Option<&dyn ChannelOutboundAdapter> {
        Some(self.outbound.as_ref())
    }

    fn gateway(&self) -> Option<&dyn ChannelGatewayAdapter> {
        Some(&self.gateway)
    }

    fn status(&self) -> Option<&dyn ChannelStatusAdapter> {
        Some(&self.status)
    }

    fn pairing(&self) -> Option<&dyn ChannelPairingAdapter> {
        Some(&self.pairing)
    }

    fn messaging(&self) -> Option<&dyn ChannelMessagingAdapter> {
        Some(&self.messaging)
    }

    fn directory(&self) -> Option<&dyn ChannelDirectoryAdapter> {
        Some(&self.directory)
    }
}
