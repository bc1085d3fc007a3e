use std::error::Error as StdError;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed channel errors shared across adapter traits.
///
/// Missing credentials have no variant; they surface through
/// `is_configured` / `unconfigured_reason` and never as an error value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request precondition does not hold (e.g. missing media URL).
    #[error("invalid channel request: {message}")]
    InvalidRequest { message: String },

    /// The platform transport rejected a send.
    #[error("delivery via {channel} failed: {source}")]
    Delivery {
        channel: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A probe or live connection failed. `fatal` failures are not retried.
    #[error("channel connectivity failed: {message}")]
    Connectivity { message: String, fatal: bool },

    /// The channel plugin does not provide this capability.
    #[error("channel capability not implemented: {capability}")]
    NotImplemented { capability: String },

    /// A requested account ID is not known to the adapter.
    #[error("unknown channel account: {account_id}")]
    UnknownAccount { account_id: String },

    /// No pending pairing request carries this code.
    #[error("no pending pairing request for code {code}")]
    PairingNotFound { code: String },

    /// The pairing request existed but its code has expired.
    #[error("pairing code {code} has expired")]
    PairingExpired { code: String },

    /// Writing to the host configuration failed.
    #[error("channel config update failed: {source}")]
    Config {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Wrapped source error from an external dependency.
    #[error("channel operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_request(message: impl std::fmt::Display) -> Self {
        Self::InvalidRequest {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn delivery(channel: impl Into<String>, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Delivery {
            channel: channel.into(),
            source: source.into(),
        }
    }

    /// A connectivity failure worth retrying (timeouts, resets, 5xx).
    #[must_use]
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Connectivity {
            message: message.to_string(),
            fatal: false,
        }
    }

    /// A connectivity failure that retrying cannot fix (revoked token,
    /// another instance holding the session).
    #[must_use]
    pub fn fatal(message: impl std::fmt::Display) -> Self {
        Self::Connectivity {
            message: message.to_string(),
            fatal: true,
        }
    }

    #[must_use]
    pub fn not_implemented(capability: impl Into<String>) -> Self {
        Self::NotImplemented {
            capability: capability.into(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn config(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Config {
            source: source.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True when the failure comes from a capability the plugin never wired
    /// up, as opposed to a runtime failure.
    #[must_use]
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }

    /// True for connectivity failures that retrying cannot fix.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connectivity { fatal: true, .. })
    }
}
