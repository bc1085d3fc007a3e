//! Metric names for switchboard components.
//!
//! Recording goes through the `metrics` facade; with no recorder installed
//! every macro is a no-op, so hosts opt in by installing an exporter.
//!
//! ```rust,ignore
//! use switchboard_metrics::{channels, counter};
//!
//! counter!(channels::MESSAGES_SENT_TOTAL, "channel" => "loopback").increment(1);
//! ```

pub mod channels {
    /// Outbound messages (chunks) handed to a platform client.
    pub const MESSAGES_SENT_TOTAL: &str = "switchboard_channel_messages_sent_total";
    /// Inbound messages forwarded to the host.
    pub const MESSAGES_RECEIVED_TOTAL: &str = "switchboard_channel_messages_received_total";
    /// Delivery and connectivity failures.
    pub const ERRORS_TOTAL: &str = "switchboard_channel_errors_total";
    /// Accounts with a live connection.
    pub const ACTIVE_ACCOUNTS: &str = "switchboard_channel_active_accounts";
    /// Registered channel plugins.
    pub const REGISTERED: &str = "switchboard_channels_registered";
    /// Probe latency in seconds.
    pub const PROBE_DURATION_SECONDS: &str = "switchboard_channel_probe_duration_seconds";
}

pub use metrics::{counter, gauge, histogram};
