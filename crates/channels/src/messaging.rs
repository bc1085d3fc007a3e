//! Helpers for addressing outbound messages.

use crate::security::PrefixNormalizer;

/// Messaging adapter a channel plugin may expose.
pub trait ChannelMessagingAdapter: Send + Sync {
    /// Canonical form of a user-typed target, or `None` when nothing usable
    /// remains.
    fn normalize_target(&self, raw: &str) -> Option<String>;

    /// Whether `raw` already looks like a platform id rather than a name.
    fn looks_like_id(&self, raw: &str) -> bool;

    /// Short description of accepted targets, shown in prompts and errors.
    fn target_hint(&self) -> &str;
}

/// Messaging helpers for platforms that address chats by numeric id.
#[derive(Debug, Clone)]
pub struct StandardMessaging {
    normalizer: PrefixNormalizer,
    hint: String,
}

impl StandardMessaging {
    pub fn new(channel_id: &str) -> Self {
        Self {
            normalizer: PrefixNormalizer::new(channel_id),
            hint: format!("<chat id> or {channel_id}:<chat id>"),
        }
    }

    pub fn with_target_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }
}

impl ChannelMessagingAdapter for StandardMessaging {
    fn normalize_target(&self, raw: &str) -> Option<String> {
        let target = self.normalizer.normalize(raw);
        (!target.is_empty()).then_some(target)
    }

    fn looks_like_id(&self, raw: &str) -> bool {
        looks_like_numeric_id(raw.trim())
    }

    fn target_hint(&self) -> &str {
        &self.hint
    }
}

/// True for an optionally negative run of ASCII digits (`^-?\d+$`).
pub fn looks_like_numeric_id(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
