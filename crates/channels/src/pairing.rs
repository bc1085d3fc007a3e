//! Sender pairing: unknown DM senders request a short code, an operator
//! approves it, and the sender is admitted.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    rand::Rng,
    serde::Serialize,
    serde_json::{Map, Value},
    tokio::time::Instant,
    tracing::{info, warn},
};

use crate::{
    Result,
    account::{ChannelConfigAdapter, DEFAULT_ACCOUNT_ID, normalize_account_id},
    context::ChannelContext,
    error::Error,
    event::ChannelEvent,
    gating::PairingRetention,
    outbound::{ChannelOutboundAdapter, SendTextRequest},
    security::PrefixNormalizer,
};

/// Characters used in pairing codes. Omits `0 O 1 I` to avoid misreads.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const PAIRING_CODE_LEN: usize = 8;
pub const PAIRING_TTL: Duration = Duration::from_secs(60 * 60);
pub const MAX_PENDING_PER_ACCOUNT: usize = 3;

const DEFAULT_APPROVAL_MESSAGE: &str =
    "Your pairing request was approved. You can message this bot now.";

/// Pairing adapter a channel plugin may expose.
#[async_trait]
pub trait ChannelPairingAdapter: Send + Sync {
    /// What the platform calls a sender id (e.g. "user id", "phone number").
    fn id_label(&self) -> &str;

    /// Normalize an id before it is stored in `allowFrom`. Idempotent.
    fn normalize_allow_entry(&self, entry: &str) -> String;

    /// Tell a freshly approved sender they are in. Failures are logged.
    async fn notify_approval(&self, ctx: &ChannelContext, paired_id: &str);

    /// Issue a pairing code to an unknown sender. Adapters without a
    /// request workflow leave this unimplemented.
    async fn request_pairing(
        &self,
        _ctx: &ChannelContext,
        _account_id: &str,
        _sender_id: &str,
        _username: Option<&str>,
    ) -> Result<PairingRequest> {
        Err(Error::not_implemented("pairing.request"))
    }

    async fn approve(&self, _ctx: &ChannelContext, _code: &str) -> Result<PairingRequest> {
        Err(Error::not_implemented("pairing.approve"))
    }

    fn reject(&self, _code: &str) -> Result<PairingRequest> {
        Err(Error::not_implemented("pairing.reject"))
    }

    fn is_approved(&self, _account_id: &str, _sender_id: &str) -> bool {
        false
    }

    fn list_pending(&self, _account_id: Option<&str>) -> Vec<PairingRequest> {
        Vec::new()
    }
}

/// A pending pairing request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub code: String,
    pub account_id: String,
    pub sender_id: String,
    pub username: Option<String>,
    pub created_at_ms: u64,
    #[serde(skip)]
    expires_at: Instant,
}

impl PairingRequest {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
struct PairingState {
    /// Pending requests keyed by code.
    pending: HashMap<String, PairingRequest>,
    /// Approved sender ids per account, for this process only.
    approved: HashMap<String, HashSet<String>>,
}

impl PairingState {
    fn purge_expired(&mut self) {
        self.pending.retain(|code, request| {
            let keep = !request.is_expired();
            if !keep {
                info!(code, account_id = request.account_id, "pairing request expired");
            }
            keep
        });
    }
}

/// Standard pairing adapter with the request/approve workflow.
pub struct PairingController {
    channel_id: String,
    id_label: String,
    config: Arc<dyn ChannelConfigAdapter>,
    outbound: Option<Arc<dyn ChannelOutboundAdapter>>,
    normalizer: PrefixNormalizer,
    approval_message: String,
    ttl: Duration,
    max_pending: usize,
    state: Mutex<PairingState>,
}

impl PairingController {
    pub fn new(config: Arc<dyn ChannelConfigAdapter>) -> Self {
        let channel_id = config.channel_id().to_string();
        Self {
            normalizer: PrefixNormalizer::new(&channel_id),
            channel_id,
            id_label: "user id".into(),
            config,
            outbound: None,
            approval_message: DEFAULT_APPROVAL_MESSAGE.into(),
            ttl: PAIRING_TTL,
            max_pending: MAX_PENDING_PER_ACCOUNT,
            state: Mutex::new(PairingState::default()),
        }
    }

    /// Outbound adapter used to notify approved senders.
    pub fn with_outbound(mut self, outbound: Arc<dyn ChannelOutboundAdapter>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn with_id_label(mut self, label: impl Into<String>) -> Self {
        self.id_label = label.into();
        self
    }

    pub fn with_approval_message(mut self, message: impl Into<String>) -> Self {
        self.approval_message = message.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PairingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live request by code. With `remove`, it is taken out of the
    /// pending set; expired requests are always removed.
    fn take_pending(&self, code: &str, remove: bool) -> Result<PairingRequest> {
        let code = code.trim().to_uppercase();
        let mut state = self.state();
        let request = state
            .pending
            .get(&code)
            .cloned()
            .ok_or_else(|| Error::PairingNotFound { code: code.clone() })?;
        if request.is_expired() {
            state.pending.remove(&code);
            return Err(Error::PairingExpired { code });
        }
        if remove {
            state.pending.remove(&code);
        }
        Ok(request)
    }

    async fn send_approval(&self, ctx: &ChannelContext, account_id: Option<&str>, paired_id: &str) {
        let Some(outbound) = &self.outbound else {
            warn!(channel = self.channel_id, paired_id, "no outbound adapter, skipping approval notice");
            return;
        };
        let request = SendTextRequest {
            to: paired_id.to_string(),
            text: self.approval_message.clone(),
            account_id: account_id.map(str::to_string),
            ..Default::default()
        };
        if let Err(e) = outbound.send_text(ctx, request).await {
            warn!(channel = self.channel_id, paired_id, error = %e, "failed to send pairing approval notice");
        }
    }
}

#[async_trait]
impl ChannelPairingAdapter for PairingController {
    fn id_label(&self) -> &str {
        &self.id_label
    }

    fn normalize_allow_entry(&self, entry: &str) -> String {
        self.normalizer.normalize(entry)
    }

    async fn notify_approval(&self, ctx: &ChannelContext, paired_id: &str) {
        self.send_approval(ctx, None, paired_id).await;
    }

    /// Issue (or re-issue) a pairing code for `sender_id` on `account_id`.
    ///
    /// A sender with a live request gets the same code back. At most
    /// [`MAX_PENDING_PER_ACCOUNT`] requests may be pending per account.
    async fn request_pairing(
        &self,
        ctx: &ChannelContext,
        account_id: &str,
        sender_id: &str,
        username: Option<&str>,
    ) -> Result<PairingRequest> {
        let account_id = normalize_account_id(Some(account_id));
        let sender_id = self.normalize_allow_entry(sender_id);
        if sender_id.is_empty() {
            return Err(Error::invalid_request("sender id is required"));
        }

        let request = {
            let mut state = self.state();
            state.purge_expired();

            if let Some(existing) = state
                .pending
                .values()
                .find(|r| r.account_id == account_id && r.sender_id == sender_id)
            {
                return Ok(existing.clone());
            }
            let pending = state
                .pending
                .values()
                .filter(|r| r.account_id == account_id)
                .count();
            if pending >= self.max_pending {
                warn!(
                    channel = self.channel_id,
                    account_id, sender_id, pending, "too many pending pairing requests"
                );
                return Err(Error::invalid_request(format!(
                    "too many pending pairing requests for account {account_id}"
                )));
            }

            let code = loop {
                let code = generate_code();
                if !state.pending.contains_key(&code) {
                    break code;
                }
            };
            let request = PairingRequest {
                code: code.clone(),
                account_id: account_id.clone(),
                sender_id: sender_id.clone(),
                username: username.map(str::to_string),
                created_at_ms: now_ms(),
                expires_at: Instant::now() + self.ttl,
            };
            state.pending.insert(code, request.clone());
            request
        };

        info!(
            channel = self.channel_id,
            account_id,
            sender_id,
            code = request.code,
            "pairing requested"
        );
        ctx.emit(ChannelEvent::PairingRequested {
            channel: self.channel_id.clone(),
            account_id,
            sender_id,
            username: request.username.clone(),
            code: request.code.clone(),
        })
        .await;
        Ok(request)
    }

    /// Approve a pending request, apply the account's retention mode, and
    /// notify the sender.
    async fn approve(&self, ctx: &ChannelContext, code: &str) -> Result<PairingRequest> {
        let request = self.take_pending(code, false)?;
        let account = self
            .config
            .resolve_account(&ctx.config(), Some(&request.account_id));

        if account.config.pairing_retention == PairingRetention::Persist {
            let channel_id = self.channel_id.as_str();
            // Resolve against the config being edited, not the snapshot above,
            // so approvals racing each other both land.
            let written = ctx.update_config(&mut |config| {
                let mut allow_from = self
                    .config
                    .resolve_account(config, Some(&request.account_id))
                    .config
                    .allow_from;
                append_allow_from(
                    config.channel_mut(channel_id),
                    &request.account_id,
                    &mut allow_from,
                    &request.sender_id,
                );
            });
            if let Err(e) = written {
                warn!(channel = self.channel_id, code = request.code, error = %e, "failed to persist pairing approval");
                return Err(e);
            }
        }

        {
            let mut state = self.state();
            state.pending.remove(&request.code);
            state
                .approved
                .entry(request.account_id.clone())
                .or_default()
                .insert(request.sender_id.clone());
        }

        info!(
            channel = self.channel_id,
            account_id = request.account_id,
            sender_id = request.sender_id,
            retention = ?account.config.pairing_retention,
            "pairing approved"
        );
        ctx.emit(ChannelEvent::PairingApproved {
            channel: self.channel_id.clone(),
            account_id: request.account_id.clone(),
            sender_id: request.sender_id.clone(),
        })
        .await;
        self.send_approval(ctx, Some(&request.account_id), &request.sender_id)
            .await;
        Ok(request)
    }

    /// Drop a pending request without admitting the sender.
    fn reject(&self, code: &str) -> Result<PairingRequest> {
        let request = self.take_pending(code, true)?;
        info!(
            channel = self.channel_id,
            account_id = request.account_id,
            sender_id = request.sender_id,
            "pairing rejected"
        );
        Ok(request)
    }

    /// Whether `sender_id` was approved on `account_id` during this process.
    /// Persisted approvals show up in `allowFrom` instead.
    fn is_approved(&self, account_id: &str, sender_id: &str) -> bool {
        let account_id = normalize_account_id(Some(account_id));
        let sender_id = self.normalize_allow_entry(sender_id);
        self.state()
            .approved
            .get(&account_id)
            .is_some_and(|ids| ids.contains(&sender_id))
    }

    /// Live pending requests, oldest first, optionally for one account.
    fn list_pending(&self, account_id: Option<&str>) -> Vec<PairingRequest> {
        let account_id = account_id.map(|id| normalize_account_id(Some(id)));
        let mut state = self.state();
        state.purge_expired();
        let mut pending: Vec<_> = state
            .pending
            .values()
            .filter(|r| account_id.as_ref().is_none_or(|id| &r.account_id == id))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.code.cmp(&b.code)));
        pending
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Write `entry` into the account's `allowFrom`. `effective` is the list the
/// account currently resolves to; writing it whole keeps entries inherited
/// from the base level when a named account gets its own list.
fn append_allow_from(
    block: &mut Map<String, Value>,
    account_id: &str,
    effective: &mut Vec<String>,
    entry: &str,
) {
    if !effective.iter().any(|existing| existing == entry) {
        effective.push(entry.to_string());
    }
    let list = Value::Array(effective.iter().cloned().map(Value::String).collect());

    if account_id == DEFAULT_ACCOUNT_ID {
        block.insert("allowFrom".into(), list);
        return;
    }
    let Some(accounts) = object_entry(block, "accounts") else {
        return;
    };
    if let Some(account) = object_entry(accounts, account_id) {
        account.insert("allowFrom".into(), list);
    }
}

/// The object at `key`, created (or replacing a non-object) as needed.
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    let slot = map
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
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
    use std::{num::NonZeroUsize, sync::Mutex as StdMutex};

    use {
        super::*,
        crate::{
            account::StandardConfigAdapter,
            outbound::{DeliveryMode, DeliveryResult, SendMediaRequest},
            testing::RecordingSink,
        },
        serde_json::json,
        switchboard_config::{ConfigSource, MemoryConfig, SwitchboardConfig},
    };

    #[derive(Default)]
    struct RecordingOutbound {
        sent: StdMutex<Vec<SendTextRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelOutboundAdapter for RecordingOutbound {
        fn delivery_mode(&self) -> DeliveryMode {
            DeliveryMode::Direct
        }

        fn text_chunk_limit(&self) -> NonZeroUsize {
            NonZeroUsize::new(100).unwrap()
        }

        async fn send_text(&self, _ctx: &ChannelContext, request: SendTextRequest) -> Result<DeliveryResult> {
            if self.fail {
                return Err(Error::delivery("loopback", anyhow::anyhow!("blocked by user")));
            }
            self.sent.lock().unwrap().push(request);
            Ok(DeliveryResult {
                channel: "loopback".into(),
                message_id: "1".into(),
                chunk_count: 1,
            })
        }

        async fn send_media(&self, _ctx: &ChannelContext, _request: SendMediaRequest) -> Result<DeliveryResult> {
            Err(Error::not_implemented("media"))
        }
    }

    struct Harness {
        ctx: ChannelContext,
        source: Arc<MemoryConfig>,
        sink: Arc<RecordingSink>,
        outbound: Arc<RecordingOutbound>,
        pairing: PairingController,
    }

    fn harness(value: Value, outbound: RecordingOutbound) -> Harness {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert("loopback".into(), value);
        let source = Arc::new(MemoryConfig::new(cfg));
        let sink = Arc::new(RecordingSink::default());
        let ctx = ChannelContext::new(source.clone()).with_event_sink(sink.clone());
        let outbound = Arc::new(outbound);
        let pairing = PairingController::new(Arc::new(StandardConfigAdapter::new("loopback")))
            .with_outbound(outbound.clone());
        Harness {
            ctx,
            source,
            sink,
            outbound,
            pairing,
        }
    }

    #[test]
    fn codes_use_unambiguous_alphabet() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), PAIRING_CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "{code}");
            assert!(!code.contains(['0', 'O', '1', 'I']));
        }
    }

    #[test]
    fn allow_entries_are_normalized_idempotently() {
        let h = harness(json!({}), RecordingOutbound::default());
        assert_eq!(h.pairing.normalize_allow_entry("Loopback:42"), "42");
        assert_eq!(h.pairing.normalize_allow_entry("42"), "42");
        assert_eq!(h.pairing.id_label(), "user id");
    }

    #[tokio::test]
    async fn re_request_returns_existing_code() {
        let h = harness(json!({ "botToken": "T" }), RecordingOutbound::default());
        let first = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", Some("alice"))
            .await
            .unwrap();
        let second = h
            .pairing
            .request_pairing(&h.ctx, "", "loopback:42", None)
            .await
            .unwrap();
        assert_eq!(first.code, second.code);
        assert_eq!(h.pairing.list_pending(None).len(), 1);
        assert!(matches!(
            h.sink.events().as_slice(),
            [ChannelEvent::PairingRequested { username: Some(_), .. }]
        ));
    }

    #[tokio::test]
    async fn pending_requests_are_capped_per_account() {
        let h = harness(json!({ "botToken": "T" }), RecordingOutbound::default());
        for sender in ["1", "2", "3"] {
            h.pairing
                .request_pairing(&h.ctx, "default", sender, None)
                .await
                .unwrap();
        }
        let err = h
            .pairing
            .request_pairing(&h.ctx, "default", "4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));

        // Other accounts have their own budget.
        h.pairing
            .request_pairing(&h.ctx, "ops", "4", None)
            .await
            .unwrap();
        assert_eq!(h.pairing.list_pending(Some("ops")).len(), 1);
        assert_eq!(h.pairing.list_pending(Some("default")).len(), 3);
    }

    #[tokio::test]
    async fn approve_persists_into_allow_from_and_notifies() {
        let h = harness(
            json!({ "botToken": "T", "allowFrom": ["7"] }),
            RecordingOutbound::default(),
        );
        let request = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();

        let approved = h
            .pairing
            .approve(&h.ctx, &request.code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(approved.sender_id, "42");
        assert_eq!(
            h.source.snapshot().channels["loopback"]["allowFrom"],
            json!(["7", "42"])
        );
        assert!(h.pairing.is_approved("default", "loopback:42"));
        assert!(h.pairing.list_pending(None).is_empty());

        let sent = h.outbound.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "42");
        assert_eq!(sent[0].account_id.as_deref(), Some("default"));
        assert!(matches!(
            h.sink.events().last(),
            Some(ChannelEvent::PairingApproved { sender_id, .. }) if sender_id == "42"
        ));
    }

    #[tokio::test]
    async fn approve_for_named_account_keeps_inherited_entries() {
        let h = harness(
            json!({ "allowFrom": ["7"], "accounts": { "ops": { "botToken": "A" } } }),
            RecordingOutbound::default(),
        );
        let request = h
            .pairing
            .request_pairing(&h.ctx, "ops", "42", None)
            .await
            .unwrap();
        h.pairing.approve(&h.ctx, &request.code).await.unwrap();

        let block = &h.source.snapshot().channels["loopback"];
        assert_eq!(block["accounts"]["ops"]["allowFrom"], json!(["7", "42"]));
        assert_eq!(block["accounts"]["ops"]["botToken"], "A");
        assert_eq!(block["allowFrom"], json!(["7"]));
    }

    /// Serves the config as it was at construction while writes go to the
    /// live copy, like a host whose readers lag behind its writers.
    struct LaggingConfig {
        frozen: Arc<SwitchboardConfig>,
        live: MemoryConfig,
    }

    impl ConfigSource for LaggingConfig {
        fn snapshot(&self) -> Arc<SwitchboardConfig> {
            self.frozen.clone()
        }

        fn update(&self, edit: &mut dyn FnMut(&mut SwitchboardConfig)) -> anyhow::Result<()> {
            self.live.update(edit)
        }
    }

    #[tokio::test]
    async fn approvals_from_a_stale_snapshot_do_not_drop_each_other() {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels
            .insert("loopback".into(), json!({ "botToken": "T", "allowFrom": ["7"] }));
        let source = Arc::new(LaggingConfig {
            frozen: Arc::new(cfg.clone()),
            live: MemoryConfig::new(cfg),
        });
        let ctx = ChannelContext::new(source.clone());
        let pairing = PairingController::new(Arc::new(StandardConfigAdapter::new("loopback")));

        let first = pairing
            .request_pairing(&ctx, "default", "41", None)
            .await
            .unwrap();
        let second = pairing
            .request_pairing(&ctx, "default", "42", None)
            .await
            .unwrap();
        pairing.approve(&ctx, &first.code).await.unwrap();
        pairing.approve(&ctx, &second.code).await.unwrap();

        assert_eq!(
            source.live.snapshot().channels["loopback"]["allowFrom"],
            json!(["7", "41", "42"])
        );
    }

    #[tokio::test]
    async fn session_retention_stays_in_memory() {
        let h = harness(
            json!({ "botToken": "T", "pairingRetention": "session" }),
            RecordingOutbound::default(),
        );
        let before = h.source.snapshot();
        let request = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();
        h.pairing.approve(&h.ctx, &request.code).await.unwrap();

        assert_eq!(*h.source.snapshot(), *before);
        assert!(h.pairing.is_approved("default", "42"));
        assert!(!h.pairing.is_approved("ops", "42"));
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_approval() {
        let h = harness(
            json!({ "botToken": "T" }),
            RecordingOutbound {
                fail: true,
                ..Default::default()
            },
        );
        let request = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();
        assert!(h.pairing.approve(&h.ctx, &request.code).await.is_ok());
        h.pairing.notify_approval(&h.ctx, "42").await;
    }

    #[tokio::test]
    async fn notify_approval_uses_default_account() {
        let h = harness(json!({ "botToken": "T" }), RecordingOutbound::default());
        h.pairing.notify_approval(&h.ctx, "42").await;
        let sent = h.outbound.sent.lock().unwrap();
        assert_eq!(sent[0].account_id, None);
        assert_eq!(sent[0].text, DEFAULT_APPROVAL_MESSAGE);
    }

    #[tokio::test]
    async fn unknown_and_rejected_codes() {
        let h = harness(json!({ "botToken": "T" }), RecordingOutbound::default());
        let err = h.pairing.approve(&h.ctx, "NOPE2345").await.unwrap_err();
        assert!(matches!(err, Error::PairingNotFound { .. }));

        let request = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();
        h.pairing.reject(&request.code).unwrap();
        assert!(matches!(
            h.pairing.approve(&h.ctx, &request.code).await,
            Err(Error::PairingNotFound { .. })
        ));
        assert!(!h.pairing.is_approved("default", "42"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_codes_are_refused() {
        let h = harness(json!({ "botToken": "T" }), RecordingOutbound::default());
        let request = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();
        tokio::time::advance(PAIRING_TTL + Duration::from_secs(1)).await;

        let err = h.pairing.approve(&h.ctx, &request.code).await.unwrap_err();
        assert!(matches!(err, Error::PairingExpired { .. }));
        assert!(h.pairing.list_pending(None).is_empty());

        let fresh = h
            .pairing
            .request_pairing(&h.ctx, "default", "42", None)
            .await
            .unwrap();
        assert_ne!(fresh.code, request.code);
    }
}
