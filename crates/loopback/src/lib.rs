//! Loopback channel plugin.
//!
//! A complete [`ChannelPlugin`](switchboard_channels::ChannelPlugin) whose
//! "platform" is an in-process [`LoopbackHub`]: outbound messages are
//! recorded, inbound messages are injected by the caller. Used by the demo
//! host and as a reference for wiring real platforms.

pub mod hub;
pub mod plugin;

pub use {
    hub::{LoopbackHub, SentMessage},
    plugin::{CHANNEL_ID, LoopbackOptions, LoopbackPlugin},
};
