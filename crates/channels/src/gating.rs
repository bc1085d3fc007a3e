use serde::{Deserialize, Serialize};

/// Check if a peer matches an allowlist.
///
/// Entries are matched case-insensitively against the peer ID and support
/// glob-style `*` wildcards (a lone `*` admits everyone). An empty list
/// matches nobody; callers decide what an empty list means for their policy.
pub fn is_allowed(peer_id: &str, allowlist: &[String]) -> bool {
    let peer_lower = peer_id.to_lowercase();
    allowlist.iter().any(|pattern| {
        let pat = pattern.to_lowercase();
        if pat.contains('*') {
            glob_match(&pat, &peer_lower)
        } else {
            pat == peer_lower
        }
    })
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if !parts.last().unwrap_or(&"").is_empty() {
        text.ends_with(parts.last().unwrap_or(&""))
    } else {
        true
    }
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the account.
    Open,
    /// Unknown senders must complete pairing before they are admitted.
    #[default]
    Pairing,
    /// Only senders on the allowlist.
    Allowlist,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pairing => "pairing",
            Self::Allowlist => "allowlist",
        }
    }
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Any group member may address the account.
    #[default]
    Open,
    /// Only allowlisted senders inside groups.
    Allowlist,
    /// All group traffic is rejected.
    Disabled,
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Allowlist => "allowlist",
            Self::Disabled => "disabled",
        }
    }
}

/// What happens to a sender once a pairing request is approved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairingRetention {
    /// Approval lives in memory and is lost on restart.
    Session,
    /// Approval is written into the account's `allowFrom`.
    #[default]
    Persist,
}
