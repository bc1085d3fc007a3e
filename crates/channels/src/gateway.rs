//! Per-account live connection lifecycle.
//!
//! Each account runs as one long-lived `start_account` future, normally
//! spawned by the host. The lifecycle records a [`RuntimeState`] per account
//! and hands out clones; the lock guarding the map is never held across an
//! `.await`.
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//!               \           \
//!                `-----------`--> errored --(stop)--> stopped
//! ```

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{channels as ch_metrics, counter, gauge};

use crate::{
    Result,
    account::{
        DEFAULT_ACCOUNT_ID, RawChannelConfig, ResolvedAccount, is_configured, load_token_file,
        normalize_account_id, resolve_account, unconfigured_reason,
    },
    context::ChannelContext,
    error::Error,
    event::{ChannelEvent, InboundMessage},
};

/// Config keys holding credentials; removed on logout.
const CREDENTIAL_KEYS: [&str; 3] = ["botToken", "tokenFile", "webhookSecret"];

/// Lifecycle state of one account's connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Errored => "errored",
        }
    }
}

/// Observable runtime state of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub account_id: String,
    pub state: LifecycleState,
    pub running: bool,
    /// Unix millis.
    pub last_start_at: Option<u64>,
    /// Unix millis.
    pub last_stop_at: Option<u64>,
    pub last_error: Option<String>,
}

impl RuntimeState {
    /// State of an account that has never been started.
    pub fn stopped(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: LifecycleState::Stopped,
            running: false,
            last_start_at: None,
            last_stop_at: None,
            last_error: None,
        }
    }
}

/// Reconnect schedule for transient connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// Consecutive failed attempts before the account is marked errored.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Result of [`ChannelGatewayAdapter::logout_account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResult {
    /// Whether any credential was removed from the configuration.
    pub cleared: bool,
    /// Whether the account is left without a usable credential.
    pub logged_out: bool,
}

/// Opens live connections to the platform.
///
/// Errors are retried with backoff unless they carry an
/// [`Error::Connectivity`] marked fatal (see [`Error::fatal`]).
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, account: &ResolvedAccount) -> anyhow::Result<Box<dyn ChannelSession>>;
}

/// One open platform connection.
#[async_trait]
pub trait ChannelSession: Send {
    /// Wait for the next inbound message. `Ok(None)` means the platform
    /// closed the connection normally.
    async fn next_message(&mut self) -> anyhow::Result<Option<InboundMessage>>;

    /// Release the connection. Called exactly once before the session is
    /// dropped.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Gateway adapter a channel plugin may expose.
#[async_trait]
pub trait ChannelGatewayAdapter: Send + Sync {
    /// Run the account until `cancel` fires, the connection ends, or the
    /// account errors. Errors are recorded in the runtime state rather than
    /// returned; `Err` only reports a start that was refused.
    async fn start_account(
        &self,
        ctx: &ChannelContext,
        account: ResolvedAccount,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Stop the account and wait for its start future to unwind.
    async fn stop_account(&self, ctx: &ChannelContext, account_id: &str) -> Result<()>;

    /// Remove the account's credentials from the configuration.
    async fn logout_account(&self, ctx: &ChannelContext, account_id: &str) -> Result<LogoutResult>;

    fn runtime(&self, account_id: &str) -> Option<RuntimeState>;

    fn runtimes(&self) -> Vec<RuntimeState>;
}

struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

struct AccountSlot {
    state: RuntimeState,
    active: Option<ActiveRun>,
}

enum RunEnd {
    Cancelled,
    Closed,
    Errored(String),
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(anyhow::Error),
}

/// Standard gateway adapter driving a [`ChannelConnector`].
pub struct GatewayLifecycle<C> {
    channel_id: String,
    connector: C,
    backoff: BackoffPolicy,
    accounts: RwLock<HashMap<String, AccountSlot>>,
    generation: AtomicU64,
}

impl<C: ChannelConnector> GatewayLifecycle<C> {
    pub fn new(channel_id: impl Into<String>, connector: C) -> Self {
        Self {
            channel_id: channel_id.into(),
            connector,
            backoff: BackoffPolicy::default(),
            accounts: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn update_state(&self, account_id: &str, f: impl FnOnce(&mut RuntimeState)) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = accounts.get_mut(account_id) {
            f(&mut slot.state);
        }
    }

    /// Claim the account for a new run. Refused while another run is active
    /// or the account sits in the errored state.
    fn register(&self, account_id: &str, cancel: &CancellationToken) -> Result<ActiveRunHandle> {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        let slot = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountSlot {
                state: RuntimeState::stopped(account_id),
                active: None,
            });
        if slot.active.is_some() {
            return Err(Error::invalid_request(format!(
                "account {account_id} is already running"
            )));
        }
        if slot.state.state == LifecycleState::Errored {
            return Err(Error::invalid_request(format!(
                "account {account_id} is errored; stop it before starting again"
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let run = ActiveRun {
            generation,
            cancel: cancel.child_token(),
            done: CancellationToken::new(),
        };
        let handle = ActiveRunHandle {
            generation,
            cancel: run.cancel.clone(),
            done: run.done.clone(),
        };
        slot.active = Some(run);
        slot.state.state = LifecycleState::Starting;
        slot.state.running = true;
        slot.state.last_start_at = Some(now_ms());
        slot.state.last_error = None;
        Ok(handle)
    }

    fn mark_running(&self, account_id: &str) {
        self.update_state(account_id, |state| {
            state.state = LifecycleState::Running;
            state.last_error = None;
        });
        #[cfg(feature = "metrics")]
        gauge!(ch_metrics::ACTIVE_ACCOUNTS, "channel" => self.channel_id.clone()).increment(1.0);
    }

    fn mark_errored(&self, account_id: &str, error: &str) {
        self.update_state(account_id, |state| {
            self.leave_running(state);
            state.state = LifecycleState::Errored;
            state.running = false;
            state.last_stop_at = Some(now_ms());
            state.last_error = Some(error.to_string());
        });
    }

    /// Bookkeeping for an account leaving the running state.
    fn leave_running(&self, state: &RuntimeState) {
        #[cfg(feature = "metrics")]
        if state.state == LifecycleState::Running {
            gauge!(ch_metrics::ACTIVE_ACCOUNTS, "channel" => self.channel_id.clone()).decrement(1.0);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = state;
    }

    /// Drop the run record if it still belongs to `generation`. Leaves an
    /// errored state in place; anything else becomes stopped.
    fn release(&self, account_id: &str, generation: u64) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = accounts.get_mut(account_id) else {
            return;
        };
        if slot
            .active
            .as_ref()
            .is_none_or(|run| run.generation != generation)
        {
            return;
        }
        slot.active = None;
        self.leave_running(&slot.state);
        if slot.state.state != LifecycleState::Errored {
            slot.state.state = LifecycleState::Stopped;
            slot.state.running = false;
            slot.state.last_stop_at = Some(now_ms());
        }
    }

    async fn run(&self, ctx: &ChannelContext, account: &ResolvedAccount, cancel: &CancellationToken) -> RunEnd {
        let account_id = account.account_id.as_str();
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => return RunEnd::Cancelled,
                connected = self.connector.connect(account) => connected,
            };

            let failure = match connected {
                Ok(mut session) => {
                    attempt = 0;
                    self.mark_running(account_id);
                    info!(channel = self.channel_id, account_id, "channel account connected");
                    ctx.emit(ChannelEvent::AccountStarted {
                        channel: self.channel_id.clone(),
                        account_id: account_id.to_string(),
                    })
                    .await;

                    let end = self.pump(ctx, account_id, session.as_mut(), cancel).await;
                    if let Err(e) = session.close().await {
                        warn!(channel = self.channel_id, account_id, error = %e, "failed to close channel session");
                    }
                    match end {
                        SessionEnd::Cancelled => return RunEnd::Cancelled,
                        SessionEnd::Closed => return RunEnd::Closed,
                        SessionEnd::Failed(e) => e,
                    }
                },
                Err(e) => e,
            };

            if is_fatal(&failure) {
                return RunEnd::Errored(failure.to_string());
            }
            attempt += 1;
            if attempt >= self.backoff.max_attempts {
                return RunEnd::Errored(format!("giving up after {attempt} attempts: {failure}"));
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                channel = self.channel_id,
                account_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "channel connection failed, retrying"
            );
            #[cfg(feature = "metrics")]
            counter!(ch_metrics::ERRORS_TOTAL, "channel" => self.channel_id.clone(), "kind" => "connect")
                .increment(1);
            self.update_state(account_id, |state| {
                self.leave_running(state);
                state.state = LifecycleState::Starting;
                state.last_error = Some(failure.to_string());
            });

            tokio::select! {
                biased;
                () = cancel.cancelled() => return RunEnd::Cancelled,
                () = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn pump(
        &self,
        ctx: &ChannelContext,
        account_id: &str,
        session: &mut dyn ChannelSession,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                next = session.next_message() => next,
            };
            match next {
                Ok(Some(mut message)) => {
                    message.channel = self.channel_id.clone();
                    message.account_id = account_id.to_string();
                    debug!(
                        channel = self.channel_id,
                        account_id,
                        chat_id = message.chat_id,
                        sender_id = message.sender_id,
                        "inbound message"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(ch_metrics::MESSAGES_RECEIVED_TOTAL, "channel" => self.channel_id.clone())
                        .increment(1);
                    if !ctx.dispatch_inbound(message).await {
                        warn!(channel = self.channel_id, account_id, "inbound message dropped, no event sink");
                    }
                },
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}

/// Registration of one run; releasing it on drop keeps the runtime map
/// consistent even when the start future is dropped mid-flight.
struct ActiveRunHandle {
    generation: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

struct ReleaseOnDrop<'a, C: ChannelConnector> {
    lifecycle: &'a GatewayLifecycle<C>,
    account_id: &'a str,
    handle: &'a ActiveRunHandle,
}

impl<C: ChannelConnector> Drop for ReleaseOnDrop<'_, C> {
    fn drop(&mut self) {
        self.lifecycle
            .release(self.account_id, self.handle.generation);
        self.handle.done.cancel();
    }
}

#[async_trait]
impl<C: ChannelConnector> ChannelGatewayAdapter for GatewayLifecycle<C> {
    async fn start_account(
        &self,
        ctx: &ChannelContext,
        account: ResolvedAccount,
        cancel: CancellationToken,
    ) -> Result<()> {
        let account_id = account.account_id.clone();
        let handle = self.register(&account_id, &cancel)?;
        let _release = ReleaseOnDrop {
            lifecycle: self,
            account_id: &account_id,
            handle: &handle,
        };
        info!(channel = self.channel_id, account_id, "starting channel account");

        let end = match load_token_file(&account).await {
            Ok(account) if is_configured(&account) => self.run(ctx, &account, &handle.cancel).await,
            Ok(account) => RunEnd::Errored(unconfigured_reason(&account)),
            Err(e) => RunEnd::Errored(e.to_string()),
        };

        match end {
            RunEnd::Errored(error) => {
                warn!(channel = self.channel_id, account_id, error, "channel account errored");
                self.mark_errored(&account_id, &error);
                ctx.emit(ChannelEvent::AccountErrored {
                    channel: self.channel_id.clone(),
                    account_id: account_id.clone(),
                    error,
                })
                .await;
            },
            RunEnd::Cancelled | RunEnd::Closed => {
                info!(channel = self.channel_id, account_id, "channel account stopped");
                ctx.emit(ChannelEvent::AccountStopped {
                    channel: self.channel_id.clone(),
                    account_id: account_id.clone(),
                })
                .await;
            },
        }
        Ok(())
    }

    async fn stop_account(&self, ctx: &ChannelContext, account_id: &str) -> Result<()> {
        let account_id = normalize_account_id(Some(account_id));
        let active = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            match accounts.get_mut(&account_id) {
                Some(slot) => match &slot.active {
                    Some(run) => {
                        slot.state.state = LifecycleState::Stopping;
                        Some((run.cancel.clone(), run.done.clone()))
                    },
                    None if slot.state.state == LifecycleState::Errored => {
                        slot.state.state = LifecycleState::Stopped;
                        None
                    },
                    None => return Ok(()),
                },
                None => return Ok(()),
            }
        };

        match active {
            Some((cancel, done)) => {
                debug!(channel = self.channel_id, account_id, "stopping channel account");
                cancel.cancel();
                done.cancelled().await;
            },
            None => {
                info!(channel = self.channel_id, account_id, "cleared errored channel account");
                ctx.emit(ChannelEvent::AccountStopped {
                    channel: self.channel_id.clone(),
                    account_id,
                })
                .await;
            },
        }
        Ok(())
    }

    async fn logout_account(&self, ctx: &ChannelContext, account_id: &str) -> Result<LogoutResult> {
        let account_id = normalize_account_id(Some(account_id));
        let channel_id = self.channel_id.as_str();
        let mut cleared = false;
        ctx.update_config(&mut |config| {
            cleared = clear_credentials(&mut config.channels, channel_id, &account_id);
        })?;

        let account = resolve_account(
            &RawChannelConfig::for_channel(&ctx.config(), channel_id),
            Some(&account_id),
        );
        let logged_out = !is_configured(&account) && account.token_file.is_none();
        info!(channel = channel_id, account_id, cleared, logged_out, "channel account logged out");
        Ok(LogoutResult {
            cleared,
            logged_out,
        })
    }

    fn runtime(&self, account_id: &str) -> Option<RuntimeState> {
        let account_id = normalize_account_id(Some(account_id));
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(&account_id).map(|slot| slot.state.clone())
    }

    fn runtimes(&self) -> Vec<RuntimeState> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let mut states: Vec<_> = accounts.values().map(|slot| slot.state.clone()).collect();
        states.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        states
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    error.downcast_ref::<Error>().is_some_and(Error::is_fatal)
}

/// Remove credential keys for `account_id` from the raw channel block.
/// Account entries left empty are dropped, and so is an empty `accounts` map.
fn clear_credentials(
    channels: &mut std::collections::BTreeMap<String, serde_json::Value>,
    channel_id: &str,
    account_id: &str,
) -> bool {
    let Some(block) = channels
        .get_mut(channel_id)
        .and_then(serde_json::Value::as_object_mut)
    else {
        return false;
    };

    if account_id == DEFAULT_ACCOUNT_ID {
        return remove_keys(block);
    }

    let Some(accounts) = block
        .get_mut("accounts")
        .and_then(serde_json::Value::as_object_mut)
    else {
        return false;
    };
    let Some(entry) = accounts
        .get_mut(account_id)
        .and_then(serde_json::Value::as_object_mut)
    else {
        return false;
    };
    let cleared = remove_keys(entry);
    if entry.is_empty() {
        accounts.shift_remove(account_id);
    }
    if accounts.is_empty() {
        block.shift_remove("accounts");
    }
    cleared
}

fn remove_keys(map: &mut serde_json::Map<String, serde_json::Value>) -> bool {
    CREDENTIAL_KEYS
        .iter()
        .fold(false, |cleared, key| map.shift_remove(*key).is_some() || cleared)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use {
        super::*,
        crate::{
            account::{ChannelConfigAdapter, StandardConfigAdapter},
            event::ChatKind,
            testing::RecordingSink,
        },
        secrecy::ExposeSecret,
        serde_json::json,
        switchboard_config::{ConfigSource, MemoryConfig, SwitchboardConfig},
        tokio::sync::mpsc,
    };

    enum Script {
        Fail(&'static str),
        Fatal(&'static str),
        Session(mpsc::Receiver<anyhow::Result<InboundMessage>>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<Script>>,
        attempts: Mutex<Vec<String>>,
        closed: Arc<Mutex<usize>>,
    }

    impl ScriptedConnector {
        fn push(&self, step: Script) {
            self.script.lock().unwrap().push_back(step);
        }

        fn attempts(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    struct QueueSession {
        rx: mpsc::Receiver<anyhow::Result<InboundMessage>>,
        closed: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl ChannelSession for QueueSession {
        async fn next_message(&mut self) -> anyhow::Result<Option<InboundMessage>> {
            self.rx.recv().await.transpose()
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl ChannelConnector for ScriptedConnector {
        async fn connect(&self, account: &ResolvedAccount) -> anyhow::Result<Box<dyn ChannelSession>> {
            self.attempts
                .lock()
                .unwrap()
                .push(account.token.expose_secret().clone());
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Script::Fail(msg)) => Err(anyhow::anyhow!(msg)),
                Some(Script::Fatal(msg)) => Err(Error::fatal(msg).into()),
                Some(Script::Session(rx)) => Ok(Box::new(QueueSession {
                    rx,
                    closed: Arc::clone(&self.closed),
                })),
                None => std::future::pending().await,
            }
        }
    }

    fn host(value: serde_json::Value) -> (ChannelContext, Arc<RecordingSink>, Arc<MemoryConfig>) {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert("loopback".into(), value);
        let source = Arc::new(MemoryConfig::new(cfg));
        let sink = Arc::new(RecordingSink::default());
        let ctx = ChannelContext::new(source.clone()).with_event_sink(sink.clone());
        (ctx, sink, source)
    }

    fn account(ctx: &ChannelContext, id: Option<&str>) -> ResolvedAccount {
        StandardConfigAdapter::new("loopback").resolve_account(&ctx.config(), id)
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            channel: String::new(),
            account_id: String::new(),
            chat_id: "42".into(),
            chat_kind: ChatKind::Direct,
            sender_id: "42".into(),
            username: None,
            sender_name: None,
            text: text.into(),
            message_id: None,
        }
    }

    fn lifecycle() -> Arc<GatewayLifecycle<ScriptedConnector>> {
        Arc::new(GatewayLifecycle::new("loopback", ScriptedConnector::default()))
    }

    async fn wait_for_state(
        gateway: &GatewayLifecycle<ScriptedConnector>,
        account_id: &str,
        state: LifecycleState,
    ) {
        for _ in 0..1000 {
            if gateway.runtime(account_id).map(|r| r.state) == Some(state) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("account {account_id} never reached {state:?}");
    }

    #[rstest::rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(2, Duration::from_secs(2))]
    #[case(4, Duration::from_secs(8))]
    #[case(7, Duration::from_secs(60))]
    #[case(40, Duration::from_secs(60))]
    fn backoff_doubles_up_to_cap(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(BackoffPolicy::default().delay(attempt), expected);
    }

    #[tokio::test]
    async fn stop_without_active_start_is_ok() {
        let (ctx, sink, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        gateway.stop_account(&ctx, "default").await.unwrap();
        gateway.stop_account(&ctx, "never-seen").await.unwrap();
        assert!(gateway.runtime("default").is_none());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn run_forwards_inbound_and_stops_on_cancel() {
        let (ctx, sink, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        let (tx, rx) = mpsc::channel(8);
        gateway.connector().push(Script::Session(rx));

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ctx = ctx.clone();
            let account = account(&ctx, None);
            let cancel = cancel.clone();
            async move { gateway.start_account(&ctx, account, cancel).await }
        });

        wait_for_state(&gateway, "default", LifecycleState::Running).await;
        tx.send(Ok(inbound("hello"))).await.unwrap();
        for _ in 0..100 {
            if !sink.inbound().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let received = sink.inbound();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel, "loopback");
        assert_eq!(received[0].account_id, "default");

        cancel.cancel();
        task.await.unwrap().unwrap();

        let runtime = gateway.runtime("default").unwrap();
        assert_eq!(runtime.state, LifecycleState::Stopped);
        assert!(!runtime.running);
        assert!(runtime.last_start_at.is_some());
        assert!(runtime.last_stop_at.is_some());
        assert_eq!(*gateway.connector().closed.lock().unwrap(), 1);
        assert!(matches!(sink.events().as_slice(), [
            ChannelEvent::AccountStarted { .. },
            ChannelEvent::AccountStopped { .. }
        ]));
    }

    #[tokio::test]
    async fn stop_account_waits_for_unwind() {
        let (ctx, _, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        let (_tx, rx) = mpsc::channel(1);
        gateway.connector().push(Script::Session(rx));

        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ctx = ctx.clone();
            let account = account(&ctx, None);
            async move {
                gateway
                    .start_account(&ctx, account, CancellationToken::new())
                    .await
            }
        });
        wait_for_state(&gateway, "default", LifecycleState::Running).await;

        gateway.stop_account(&ctx, "default").await.unwrap();
        assert_eq!(
            gateway.runtime("default").unwrap().state,
            LifecycleState::Stopped
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_concurrent_start_is_refused() {
        let (ctx, _, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ctx = ctx.clone();
            let account = account(&ctx, None);
            let cancel = cancel.clone();
            async move { gateway.start_account(&ctx, account, cancel).await }
        });
        wait_for_state(&gateway, "default", LifecycleState::Starting).await;

        let err = gateway
            .start_account(&ctx, account(&ctx, None), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unconfigured_account_goes_errored_until_stopped() {
        let (ctx, sink, _) = host(json!({ "accounts": { "ops": {} } }));
        let gateway = lifecycle();

        gateway
            .start_account(&ctx, account(&ctx, Some("ops")), CancellationToken::new())
            .await
            .unwrap();
        let runtime = gateway.runtime("ops").unwrap();
        assert_eq!(runtime.state, LifecycleState::Errored);
        assert_eq!(runtime.last_error.as_deref(), Some("bot token not configured"));
        assert_eq!(gateway.connector().attempts(), 0);
        assert!(matches!(sink.events().as_slice(), [ChannelEvent::AccountErrored { .. }]));

        let refused = gateway
            .start_account(&ctx, account(&ctx, Some("ops")), CancellationToken::new())
            .await;
        assert!(refused.is_err());

        gateway.stop_account(&ctx, "ops").await.unwrap();
        assert_eq!(gateway.runtime("ops").unwrap().state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn token_file_is_loaded_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "from-file\n").unwrap();
        let (ctx, _, _) = host(json!({ "tokenFile": path }));
        let gateway = lifecycle();
        gateway.connector().push(Script::Fatal("revoked"));

        gateway
            .start_account(&ctx, account(&ctx, None), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*gateway.connector().attempts.lock().unwrap(), vec!["from-file"]);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let (ctx, _, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        gateway.connector().push(Script::Fatal("token revoked"));

        gateway
            .start_account(&ctx, account(&ctx, None), CancellationToken::new())
            .await
            .unwrap();
        let runtime = gateway.runtime("default").unwrap();
        assert_eq!(runtime.state, LifecycleState::Errored);
        assert!(runtime.last_error.unwrap().contains("token revoked"));
        assert_eq!(gateway.connector().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_connect() {
        let (ctx, _, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        gateway.connector().push(Script::Fail("connection reset"));
        gateway.connector().push(Script::Fail("connection reset"));
        let (tx, rx) = mpsc::channel(1);
        gateway.connector().push(Script::Session(rx));

        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ctx = ctx.clone();
            let account = account(&ctx, None);
            async move {
                gateway
                    .start_account(&ctx, account, CancellationToken::new())
                    .await
            }
        });

        // The session ends on its own once the sender is dropped.
        drop(tx);
        task.await.unwrap().unwrap();
        assert_eq!(gateway.connector().attempts(), 3);
        let runtime = gateway.runtime("default").unwrap();
        assert_eq!(runtime.state, LifecycleState::Stopped);
        assert_eq!(runtime.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_escalate_to_errored() {
        let (ctx, sink, _) = host(json!({ "botToken": "T" }));
        let gateway = Arc::new(
            GatewayLifecycle::new("loopback", ScriptedConnector::default()).with_backoff(BackoffPolicy {
                max_attempts: 3,
                ..Default::default()
            }),
        );
        for _ in 0..3 {
            gateway.connector().push(Script::Fail("503 service unavailable"));
        }

        gateway
            .start_account(&ctx, account(&ctx, None), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gateway.connector().attempts(), 3);
        let runtime = gateway.runtime("default").unwrap();
        assert_eq!(runtime.state, LifecycleState::Errored);
        assert!(runtime.last_error.unwrap().starts_with("giving up after 3 attempts"));
        assert!(matches!(sink.events().last(), Some(ChannelEvent::AccountErrored { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_promptly() {
        let (ctx, _, _) = host(json!({ "botToken": "T" }));
        let gateway = lifecycle();
        gateway.connector().push(Script::Fail("timeout"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ctx = ctx.clone();
            let account = account(&ctx, None);
            let cancel = cancel.clone();
            async move { gateway.start_account(&ctx, account, cancel).await }
        });
        for _ in 0..100 {
            if gateway
                .runtime("default")
                .is_some_and(|r| r.last_error.is_some())
            {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(gateway.connector().attempts(), 1);
        assert_eq!(gateway.runtime("default").unwrap().state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn logout_clears_named_account_credentials() {
        let (ctx, _, source) = host(json!({
            "botToken": "base",
            "accounts": {
                "ops": { "botToken": "A", "webhookSecret": "s" },
                "dev": { "botToken": "D", "name": "Dev" }
            }
        }));
        let gateway = lifecycle();

        let result = gateway.logout_account(&ctx, "ops").await.unwrap();
        // `ops` still inherits the base token.
        assert_eq!(result, LogoutResult {
            cleared: true,
            logged_out: false,
        });
        let block = &source.snapshot().channels["loopback"];
        assert!(block["accounts"].get("ops").is_none(), "empty entry dropped");
        assert_eq!(block["accounts"]["dev"], json!({ "botToken": "D", "name": "Dev" }));
        assert_eq!(block["botToken"], "base");

        let dev = gateway.logout_account(&ctx, "dev").await.unwrap();
        assert!(dev.cleared);
        assert_eq!(
            source.snapshot().channels["loopback"]["accounts"]["dev"],
            json!({ "name": "Dev" })
        );
    }

    #[tokio::test]
    async fn logout_default_clears_base_credentials() {
        let (ctx, _, source) = host(json!({ "botToken": "T", "tokenFile": "/x", "name": "bot" }));
        let gateway = lifecycle();

        let result = gateway.logout_account(&ctx, "").await.unwrap();
        assert_eq!(result, LogoutResult {
            cleared: true,
            logged_out: true,
        });
        assert_eq!(source.snapshot().channels["loopback"], json!({ "name": "bot" }));

        let again = gateway.logout_account(&ctx, "default").await.unwrap();
        assert!(!again.cleared);
        assert!(again.logged_out);
    }

    #[tokio::test]
    async fn logout_of_missing_channel_is_a_no_op() {
        let (ctx, _, source) = host(json!({}));
        let gateway = GatewayLifecycle::new("absent", ScriptedConnector::default());
        let result = gateway.logout_account(&ctx, "default").await.unwrap();
        assert!(!result.cleared);
        assert!(!source.snapshot().channels.contains_key("absent"));
    }

    #[test]
    fn state_names_match_serialized_form() {
        for state in [
            LifecycleState::Stopped,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Errored,
        ] {
            assert_eq!(serde_json::to_value(state).unwrap(), json!(state.as_str()));
        }
    }
}
