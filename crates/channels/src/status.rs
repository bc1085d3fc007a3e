//! Connectivity probes and per-account status snapshots.

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
    time::Duration,
};

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    serde::{Deserialize, Serialize},
    tokio::time::Instant,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{channels as ch_metrics, histogram};

use crate::{
    account::{ResolvedAccount, is_configured, load_token_file, unconfigured_reason},
    gateway::{LifecycleState, RuntimeState},
    gating::{DmPolicy, GroupPolicy},
};

/// Who the platform says the credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeIdentity {
    pub id: String,
    pub username: Option<String>,
}

/// Outcome of one connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub ok: bool,
    pub identity: Option<ProbeIdentity>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl Probe {
    pub fn succeeded(identity: ProbeIdentity, elapsed: Duration) -> Self {
        Self {
            ok: true,
            identity: Some(identity),
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            ok: false,
            identity: None,
            error: Some(error.into()),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Serializable status of one account, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub configured: bool,
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub state: LifecycleState,
    pub running: bool,
    pub last_start_at: Option<u64>,
    pub last_stop_at: Option<u64>,
    pub last_error: Option<String>,
    pub probe: Option<Probe>,
}

/// Identity check against the platform (e.g. a "who am I" call).
#[async_trait]
pub trait ChannelProber: Send + Sync {
    async fn probe(&self, account: &ResolvedAccount) -> anyhow::Result<ProbeIdentity>;
}

/// Runtime state of an account that was never started.
pub fn default_runtime(account_id: &str) -> RuntimeState {
    RuntimeState::stopped(account_id)
}

/// Combine an account, its runtime state and an optional probe into one
/// snapshot. A missing runtime reads as never started.
pub fn build_account_snapshot(
    account: &ResolvedAccount,
    runtime: Option<&RuntimeState>,
    probe: Option<&Probe>,
) -> AccountSnapshot {
    let runtime = runtime
        .cloned()
        .unwrap_or_else(|| default_runtime(&account.account_id));
    AccountSnapshot {
        account_id: account.account_id.clone(),
        name: account.name.clone(),
        enabled: account.enabled,
        configured: is_configured(account),
        dm_policy: account.config.dm_policy,
        group_policy: account.config.group_policy,
        state: runtime.state,
        running: runtime.running,
        last_start_at: runtime.last_start_at,
        last_stop_at: runtime.last_stop_at,
        last_error: runtime.last_error,
        probe: probe.cloned(),
    }
}

/// Status adapter a channel plugin may expose.
#[async_trait]
pub trait ChannelStatusAdapter: Send + Sync {
    fn default_runtime(&self, account_id: &str) -> RuntimeState {
        default_runtime(account_id)
    }

    /// Check connectivity within `timeout`. Never fails; problems are
    /// reported in the returned probe.
    async fn probe_account(&self, account: &ResolvedAccount, timeout: Duration) -> Probe;

    fn build_account_snapshot(
        &self,
        account: &ResolvedAccount,
        runtime: Option<&RuntimeState>,
        probe: Option<&Probe>,
    ) -> AccountSnapshot {
        build_account_snapshot(account, runtime, probe)
    }
}

struct CachedProbe {
    credential: u64,
    at: Instant,
    probe: Probe,
}

/// Standard status adapter driving a [`ChannelProber`].
///
/// Successful probes are reused for `cache_ttl` as long as the account's
/// credential is unchanged; failures are never cached.
pub struct StatusMonitor<P> {
    channel_id: String,
    prober: P,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedProbe>>,
}

impl<P: ChannelProber> StatusMonitor<P> {
    pub fn new(channel_id: impl Into<String>, prober: P) -> Self {
        Self {
            channel_id: channel_id.into(),
            prober,
            cache_ttl: Duration::from_secs(30),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Zero disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    fn cached(&self, account_id: &str, credential: u64) -> Option<Probe> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(account_id)
            .filter(|entry| entry.credential == credential && entry.at.elapsed() < self.cache_ttl)
            .map(|entry| entry.probe.clone())
    }

    fn remember(&self, account_id: &str, credential: u64, probe: &Probe) {
        if self.cache_ttl.is_zero() || !probe.ok {
            return;
        }
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string(), CachedProbe {
                credential,
                at: Instant::now(),
                probe: probe.clone(),
            });
    }

    async fn load_and_probe(&self, account: &ResolvedAccount, started: Instant) -> Probe {
        let account = match load_token_file(account).await {
            Ok(account) => account,
            Err(e) => return Probe::failed(e.to_string(), started.elapsed()),
        };
        if !is_configured(&account) {
            return Probe::failed(unconfigured_reason(&account), started.elapsed());
        }

        let account_id = account.account_id.as_str();
        let credential = fingerprint(account.token.expose_secret());
        if let Some(probe) = self.cached(account_id, credential) {
            debug!(channel = self.channel_id, account_id, "using cached probe");
            return probe;
        }

        let probe = match self.prober.probe(&account).await {
            Ok(identity) => Probe::succeeded(identity, started.elapsed()),
            Err(e) => {
                warn!(channel = self.channel_id, account_id, error = %e, "channel probe failed");
                Probe::failed(format!("probe failed: {e}"), started.elapsed())
            },
        };
        #[cfg(feature = "metrics")]
        histogram!(ch_metrics::PROBE_DURATION_SECONDS, "channel" => self.channel_id.clone())
            .record(started.elapsed().as_secs_f64());

        self.remember(account_id, credential, &probe);
        probe
    }
}

#[async_trait]
impl<P: ChannelProber> ChannelStatusAdapter for StatusMonitor<P> {
    /// Token file read, cache lookup and the platform call all count
    /// against `timeout`.
    async fn probe_account(&self, account: &ResolvedAccount, timeout: Duration) -> Probe {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.load_and_probe(account, started)).await {
            Ok(probe) => probe,
            Err(_) => {
                warn!(
                    channel = self.channel_id,
                    account_id = account.account_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "channel probe timed out"
                );
                #[cfg(feature = "metrics")]
                histogram!(ch_metrics::PROBE_DURATION_SECONDS, "channel" => self.channel_id.clone())
                    .record(started.elapsed().as_secs_f64());
                Probe::failed(
                    format!("probe timed out after {}ms", timeout.as_millis()),
                    started.elapsed(),
                )
            },
        }
    }
}

fn fingerprint(token: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    hasher.finish()
}
