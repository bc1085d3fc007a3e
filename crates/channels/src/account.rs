//! Account resolution: turns a raw `channels.<id>` block into per-account
//! views.
//!
//! A channel block carries base-level fields plus an optional `accounts` map
//! of overrides with the same shape. Every field resolves as
//! `account ?? base ?? builtin default`, and an override that omits a field
//! falls through to the base value instead of clearing it.
//!
//! Resolution is pure: nothing here reads files or fails. Reading a
//! `tokenFile` happens in [`load_token_file`], which the gateway calls right
//! before connecting.

use std::path::PathBuf;

use {
    indexmap::IndexMap,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Deserializer},
    switchboard_config::SwitchboardConfig,
    tracing::warn,
};

use crate::{
    Result,
    error::Error,
    gating::{DmPolicy, GroupPolicy, PairingRetention},
};

/// Reserved account id denoting the unqualified (base-level) configuration.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Normalize an optional account id: trimmed, blank or absent means
/// [`DEFAULT_ACCOUNT_ID`].
pub fn normalize_account_id(account_id: Option<&str>) -> String {
    match account_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_ACCOUNT_ID.to_string(),
    }
}

/// One layer of channel configuration. Used both for the base level and for
/// each entry of `accounts`; every field is optional.
#[derive(Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountOverride {
    pub enabled: Option<bool>,
    pub bot_token: Option<Secret<String>>,
    pub token_file: Option<PathBuf>,
    pub name: Option<String>,
    pub dm_policy: Option<DmPolicy>,
    pub group_policy: Option<GroupPolicy>,
    #[serde(deserialize_with = "deserialize_id_list")]
    pub allow_from: Option<Vec<String>>,
    pub proxy: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<Secret<String>>,
    pub pairing_retention: Option<PairingRetention>,
}

impl std::fmt::Debug for AccountOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountOverride")
            .field("enabled", &self.enabled)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_file", &self.token_file)
            .field("name", &self.name)
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .field("allow_from", &self.allow_from)
            .finish_non_exhaustive()
    }
}

impl AccountOverride {
    fn has_credential(&self) -> bool {
        self.bot_token.is_some() || self.token_file.is_some()
    }
}

/// The as-authored configuration of one channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawChannelConfig {
    #[serde(flatten)]
    pub base: AccountOverride,
    /// Per-account overrides, kept in the order they were written.
    pub accounts: Option<IndexMap<String, AccountOverride>>,
}

impl RawChannelConfig {
    /// Parse a raw channel block. A block of the wrong shape is logged and
    /// treated as empty so resolution still yields defaults.
    pub fn from_value(channel_id: &str, value: &serde_json::Value) -> Self {
        match Self::deserialize(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(channel = channel_id, error = %e, "invalid channel config, using defaults");
                Self::default()
            },
        }
    }

    /// The block for `channel_id` in the host config, or an empty one.
    pub fn for_channel(config: &SwitchboardConfig, channel_id: &str) -> Self {
        config
            .channel(channel_id)
            .map(|value| Self::from_value(channel_id, value))
            .unwrap_or_default()
    }

    fn account(&self, account_id: &str) -> Option<&AccountOverride> {
        if account_id == DEFAULT_ACCOUNT_ID {
            return None;
        }
        self.accounts.as_ref()?.get(account_id)
    }
}

/// Access policy block of a resolved account.
#[derive(Clone)]
pub struct AccountPolicy {
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub allow_from: Vec<String>,
    pub proxy: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<Secret<String>>,
    pub pairing_retention: PairingRetention,
}

impl std::fmt::Debug for AccountPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPolicy")
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .field("allow_from", &self.allow_from)
            .field("proxy", &self.proxy)
            .field("webhook_url", &self.webhook_url)
            .field("pairing_retention", &self.pairing_retention)
            .finish_non_exhaustive()
    }
}

/// Fully merged view of one account. Built fresh on every resolution call.
#[derive(Clone)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub token: Secret<String>,
    pub token_file: Option<PathBuf>,
    pub config: AccountPolicy,
}

impl std::fmt::Debug for ResolvedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAccount")
            .field("account_id", &self.account_id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("token", &"[REDACTED]")
            .field("token_file", &self.token_file)
            .field("config", &self.config)
            .finish()
    }
}

/// Ids of all configured accounts.
///
/// The default id comes first iff the base level carries a credential
/// (`botToken` or `tokenFile`); then every key of `accounts` except the
/// default id, in the order they appear in the config.
pub fn list_account_ids(raw: &RawChannelConfig) -> Vec<String> {
    let mut ids = Vec::new();
    if raw.base.has_credential() {
        ids.push(DEFAULT_ACCOUNT_ID.to_string());
    }
    if let Some(accounts) = &raw.accounts {
        ids.extend(
            accounts
                .keys()
                .filter(|id| id.as_str() != DEFAULT_ACCOUNT_ID)
                .cloned(),
        );
    }
    ids
}

/// Merge base and per-account configuration for `account_id`.
pub fn resolve_account(raw: &RawChannelConfig, account_id: Option<&str>) -> ResolvedAccount {
    let id = normalize_account_id(account_id);
    let base = &raw.base;
    let account = raw.account(&id);

    macro_rules! pick {
        ($field:ident) => {
            account
                .and_then(|a| a.$field.clone())
                .or_else(|| base.$field.clone())
        };
    }

    ResolvedAccount {
        name: pick!(name),
        enabled: pick!(enabled).unwrap_or(true),
        token: pick!(bot_token).unwrap_or_else(|| Secret::new(String::new())),
        token_file: pick!(token_file),
        config: AccountPolicy {
            dm_policy: pick!(dm_policy).unwrap_or_default(),
            group_policy: pick!(group_policy).unwrap_or_default(),
            allow_from: pick!(allow_from).unwrap_or_default(),
            proxy: pick!(proxy),
            webhook_url: pick!(webhook_url),
            webhook_secret: pick!(webhook_secret),
            pairing_retention: pick!(pairing_retention).unwrap_or_default(),
        },
        account_id: id,
    }
}

/// The account a host should use when none is specified.
pub fn default_account_id(raw: &RawChannelConfig) -> String {
    let ids = list_account_ids(raw);
    if ids.iter().any(|id| id == DEFAULT_ACCOUNT_ID) {
        return DEFAULT_ACCOUNT_ID.to_string();
    }
    ids.into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
}

/// True iff the account carries a non-blank token.
pub fn is_configured(account: &ResolvedAccount) -> bool {
    !account.token.expose_secret().trim().is_empty()
}

/// Human-readable reason an account cannot be used.
pub fn unconfigured_reason(account: &ResolvedAccount) -> String {
    if is_configured(account) {
        return "not configured".to_string();
    }
    match &account.token_file {
        Some(path) => format!("bot token file not loaded: {}", path.display()),
        None => "bot token not configured".to_string(),
    }
}

/// The resolved allowlist of `account_id`.
pub fn resolve_allow_from(raw: &RawChannelConfig, account_id: Option<&str>) -> Vec<String> {
    resolve_account(raw, account_id).config.allow_from
}

/// Return a copy of `account` whose token is read from its `tokenFile` when
/// the inline token is blank. Accounts with an inline token, or without a
/// token file, come back unchanged.
pub async fn load_token_file(account: &ResolvedAccount) -> Result<ResolvedAccount> {
    let mut loaded = account.clone();
    if is_configured(account) {
        return Ok(loaded);
    }
    let Some(path) = &account.token_file else {
        return Ok(loaded);
    };
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::external(format!("read token file {}", path.display()), e)
    })?;
    loaded.token = Secret::new(raw.trim().to_string());
    Ok(loaded)
}

/// Config adapter every channel plugin exposes.
///
/// The provided methods implement the standard account shape; plugins with
/// a different layout override them.
pub trait ChannelConfigAdapter: Send + Sync {
    /// Channel whose `channels.<id>` block this adapter reads.
    fn channel_id(&self) -> &str;

    fn raw(&self, config: &SwitchboardConfig) -> RawChannelConfig {
        RawChannelConfig::for_channel(config, self.channel_id())
    }

    fn list_account_ids(&self, config: &SwitchboardConfig) -> Vec<String> {
        list_account_ids(&self.raw(config))
    }

    fn resolve_account(&self, config: &SwitchboardConfig, account_id: Option<&str>) -> ResolvedAccount {
        resolve_account(&self.raw(config), account_id)
    }

    fn default_account_id(&self, config: &SwitchboardConfig) -> String {
        default_account_id(&self.raw(config))
    }

    fn is_configured(&self, account: &ResolvedAccount) -> bool {
        is_configured(account)
    }

    fn unconfigured_reason(&self, account: &ResolvedAccount) -> String {
        unconfigured_reason(account)
    }

    fn resolve_allow_from(&self, config: &SwitchboardConfig, account_id: Option<&str>) -> Vec<String> {
        resolve_allow_from(&self.raw(config), account_id)
    }
}

/// Config adapter for channels using the standard account shape.
#[derive(Debug, Clone)]
pub struct StandardConfigAdapter {
    channel_id: String,
}

impl StandardConfigAdapter {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }
}

impl ChannelConfigAdapter for StandardConfigAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

/// `allowFrom` accepts strings and integers (platform user ids are often
/// numeric); everything is kept as a string.
fn deserialize_id_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    let ids = Option::<Vec<Id>>::deserialize(deserializer)?;
    Ok(ids.map(|ids| {
        ids.into_iter()
            .map(|id| match id {
                Id::Text(s) => s,
                Id::Signed(n) => n.to_string(),
                Id::Unsigned(n) => n.to_string(),
            })
            .collect()
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn raw(value: serde_json::Value) -> RawChannelConfig {
        RawChannelConfig::from_value("loopback", &value)
    }

    #[test]
    fn base_only_config_resolves_default_account() {
        let cfg = raw(json!({ "botToken": "T", "dmPolicy": "allowlist", "allowFrom": ["7"] }));
        assert_eq!(list_account_ids(&cfg), vec!["default"]);

        let account = resolve_account(&cfg, Some("default"));
        assert_eq!(account.account_id, "default");
        assert_eq!(account.token.expose_secret(), "T");
        assert_eq!(account.config.dm_policy, DmPolicy::Allowlist);
        assert_eq!(account.config.allow_from, vec!["7"]);
    }

    #[test]
    fn accounts_without_base_token_exclude_default() {
        let cfg = raw(json!({ "accounts": { "alice": { "botToken": "A" } } }));
        assert_eq!(list_account_ids(&cfg), vec!["alice"]);
        assert_eq!(resolve_account(&cfg, Some("alice")).token.expose_secret(), "A");
        assert_eq!(default_account_id(&cfg), "alice");
    }

    #[test]
    fn token_file_counts_as_base_credential() {
        let cfg = raw(json!({ "tokenFile": "/run/secrets/bot", "accounts": { "ops": {} } }));
        assert_eq!(list_account_ids(&cfg), vec!["default", "ops"]);
    }

    #[test]
    fn accounts_keep_the_order_written_in_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(
            &path,
            "[channels.loopback.accounts.zeta]\nbotToken = \"Z\"\n\n\
             [channels.loopback.accounts.alpha]\nbotToken = \"A\"\n",
        )
        .unwrap();
        let config = switchboard_config::load_config(&path).unwrap();

        let cfg = RawChannelConfig::for_channel(&config, "loopback");
        assert_eq!(list_account_ids(&cfg), vec!["zeta", "alpha"]);
        assert_eq!(default_account_id(&cfg), "zeta");
    }

    #[test]
    fn default_key_in_accounts_is_not_duplicated() {
        let cfg = raw(json!({
            "botToken": "T",
            "accounts": { "default": { "name": "shadow" }, "bob": {}, "alice": {} }
        }));
        assert_eq!(list_account_ids(&cfg), vec!["default", "bob", "alice"]);
        // The default account never reads the `accounts.default` override.
        assert_eq!(resolve_account(&cfg, None).name, None);
    }

    #[test]
    fn account_fields_override_base_and_absent_fields_fall_through() {
        let cfg = raw(json!({
            "botToken": "base",
            "name": "Base Bot",
            "dmPolicy": "open",
            "groupPolicy": "disabled",
            "allowFrom": ["1"],
            "proxy": "http://proxy:3128",
            "accounts": {
                "ops": { "botToken": "ops", "dmPolicy": "allowlist", "enabled": false }
            }
        }));
        let ops = resolve_account(&cfg, Some("ops"));
        assert_eq!(ops.token.expose_secret(), "ops");
        assert_eq!(ops.config.dm_policy, DmPolicy::Allowlist);
        assert!(!ops.enabled);
        // Not overridden: inherited from base.
        assert_eq!(ops.name.as_deref(), Some("Base Bot"));
        assert_eq!(ops.config.group_policy, GroupPolicy::Disabled);
        assert_eq!(ops.config.allow_from, vec!["1"]);
        assert_eq!(ops.config.proxy.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn empty_config_resolves_to_builtin_defaults() {
        let cfg = RawChannelConfig::default();
        assert!(list_account_ids(&cfg).is_empty());
        assert_eq!(default_account_id(&cfg), DEFAULT_ACCOUNT_ID);

        let account = resolve_account(&cfg, None);
        assert_eq!(account.account_id, DEFAULT_ACCOUNT_ID);
        assert!(account.enabled);
        assert_eq!(account.config.dm_policy, DmPolicy::Pairing);
        assert_eq!(account.config.group_policy, GroupPolicy::Open);
        assert!(account.config.allow_from.is_empty());
        assert_eq!(account.config.pairing_retention, PairingRetention::Persist);
        assert!(!is_configured(&account));
    }

    #[test]
    fn unknown_account_resolves_from_base() {
        let cfg = raw(json!({ "botToken": "T", "dmPolicy": "open" }));
        let ghost = resolve_account(&cfg, Some("ghost"));
        assert_eq!(ghost.account_id, "ghost");
        assert_eq!(ghost.token.expose_secret(), "T");
        assert_eq!(ghost.config.dm_policy, DmPolicy::Open);
    }

    #[test]
    fn malformed_block_falls_back_to_defaults() {
        let cfg = raw(json!({ "dmPolicy": "everyone", "botToken": 12 }));
        assert!(list_account_ids(&cfg).is_empty());
        assert_eq!(resolve_account(&cfg, None).config.dm_policy, DmPolicy::Pairing);

        let not_an_object = raw(json!("loopback"));
        assert!(list_account_ids(&not_an_object).is_empty());
    }

    #[test]
    fn numeric_allow_from_entries_are_stringified() {
        let cfg = raw(json!({ "allowFrom": [377114917, "@alice", -1001] }));
        assert_eq!(
            resolve_allow_from(&cfg, None),
            vec!["377114917", "@alice", "-1001"]
        );
    }

    #[rstest]
    #[case(None, "default")]
    #[case(Some(""), "default")]
    #[case(Some("   "), "default")]
    #[case(Some(" ops "), "ops")]
    fn account_ids_are_normalized(#[case] input: Option<&str>, #[case] expected: &str) {
        assert_eq!(normalize_account_id(input), expected);
    }

    #[rstest]
    #[case("", None, false, "bot token not configured")]
    #[case("   ", None, false, "bot token not configured")]
    #[case("", Some("/tmp/tok"), false, "bot token file not loaded: /tmp/tok")]
    #[case("123:abc", None, true, "not configured")]
    fn configured_iff_trimmed_token_non_empty(
        #[case] token: &str,
        #[case] token_file: Option<&str>,
        #[case] configured: bool,
        #[case] reason: &str,
    ) {
        let mut account = resolve_account(&RawChannelConfig::default(), None);
        account.token = Secret::new(token.to_string());
        account.token_file = token_file.map(PathBuf::from);
        assert_eq!(is_configured(&account), configured);
        assert_eq!(unconfigured_reason(&account), reason);
    }

    #[test]
    fn resolution_returns_independent_values() {
        let cfg = raw(json!({ "botToken": "T", "allowFrom": ["1"] }));
        let mut first = resolve_account(&cfg, None);
        first.config.allow_from.push("2".into());
        assert_eq!(resolve_account(&cfg, None).config.allow_from, vec!["1"]);
    }

    #[tokio::test]
    async fn token_file_is_loaded_when_inline_token_is_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  123:file\n").unwrap();
        let cfg = raw(json!({ "tokenFile": path }));

        let account = resolve_account(&cfg, None);
        assert!(!is_configured(&account));
        let loaded = load_token_file(&account).await.unwrap();
        assert_eq!(loaded.token.expose_secret(), "123:file");
        assert!(!is_configured(&account), "original view is untouched");
    }

    #[tokio::test]
    async fn inline_token_wins_over_token_file() {
        let cfg = raw(json!({ "botToken": "inline", "tokenFile": "/does/not/exist" }));
        let loaded = load_token_file(&resolve_account(&cfg, None)).await.unwrap();
        assert_eq!(loaded.token.expose_secret(), "inline");
    }

    #[tokio::test]
    async fn missing_token_file_is_an_error() {
        let cfg = raw(json!({ "tokenFile": "/does/not/exist/token" }));
        assert!(load_token_file(&resolve_account(&cfg, None)).await.is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = raw(json!({ "botToken": "super-secret", "webhookSecret": "hook-secret" }));
        let rendered = format!("{:?}", resolve_account(&cfg, None));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("hook-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn standard_adapter_reads_its_own_block() {
        let mut host = SwitchboardConfig::default();
        host.channels
            .insert("loopback".into(), json!({ "botToken": "T" }));
        host.channels
            .insert("other".into(), json!({ "accounts": { "x": { "botToken": "X" } } }));

        let adapter = StandardConfigAdapter::new("loopback");
        assert_eq!(adapter.list_account_ids(&host), vec!["default"]);
        assert_eq!(adapter.default_account_id(&host), "default");
        assert!(adapter.is_configured(&adapter.resolve_account(&host, None)));
        assert!(StandardConfigAdapter::new("missing")
            .list_account_ids(&host)
            .is_empty());
    }
}
