//! Channel adapter contract.
//!
//! Each channel (Telegram, Discord, Slack, ...) is a [`ChannelPlugin`]: a
//! config adapter plus optional security, outbound, gateway, status,
//! pairing, messaging and directory adapters. The standard implementations
//! here cover the common account shape; a platform only supplies its
//! network client through [`PlatformClient`], [`ChannelConnector`] and
//! [`ChannelProber`].

pub mod access;
pub mod account;
pub mod context;
pub mod directory;
pub mod error;
pub mod event;
pub mod gateway;
pub mod gating;
pub mod messaging;
pub mod outbound;
pub mod pairing;
pub mod plugin;
pub mod registry;
pub mod security;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    account::{
        ChannelConfigAdapter, DEFAULT_ACCOUNT_ID, RawChannelConfig, ResolvedAccount,
        StandardConfigAdapter,
    },
    context::ChannelContext,
    directory::{ChannelDirectoryAdapter, DirectoryEntry, DirectoryQuery},
    error::{Error, Result},
    event::{ChannelEvent, ChannelEventSink, ChatKind, InboundMessage},
    gateway::{
        ChannelConnector, ChannelGatewayAdapter, ChannelSession, GatewayLifecycle, LifecycleState,
        RuntimeState,
    },
    gating::{DmPolicy, GroupPolicy, PairingRetention},
    messaging::{ChannelMessagingAdapter, StandardMessaging},
    outbound::{
        ChannelOutboundAdapter, DeliveryMode, DeliveryResult, OutboundDispatcher, PlatformClient,
        SendMediaRequest, SendTextRequest,
    },
    pairing::{ChannelPairingAdapter, PairingController},
    plugin::{AdapterKind, ChannelCapabilities, ChannelMeta, ChannelPlugin},
    registry::ChannelRegistry,
    security::{ChannelSecurityAdapter, SecurityDecision, StandardSecurityAdapter},
    status::{AccountSnapshot, ChannelProber, ChannelStatusAdapter, Probe, StatusMonitor},
};
