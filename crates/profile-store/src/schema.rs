//! On-disk schema for the auth profile store
//!
//! A single JSON document (camelCase field names, `version == 1`) maps
//! profile identifiers to credentials and carries rotation order, last-good
//! routing hints, and per-profile usage statistics. Every timestamp and
//! counter in the stats is optional; absence and zero are the same thing,
//! and both mean "no constraint". Fields this version does not know about
//! round-trip verbatim so newer writers are not clobbered.

use std::collections::HashMap;
use std::fmt;

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};

/// Current store document version.
pub const STORE_VERSION: u32 = 1;

/// The single persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfileStore {
    pub version: u32,

    /// Profile identifier -> credential.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileCredential>,

    /// Agent identifier -> ordered rotation override.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub order: HashMap<String, Vec<String>>,

    /// Routing key (provider or agent) -> profile that most recently
    /// succeeded for it.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub last_good: HashMap<String, String>,

    /// Profile identifier -> usage statistics. A malformed value here is
    /// treated as empty rather than failing the whole document.
    #[serde(
        default,
        skip_serializing_if = "HashMap::is_empty",
        deserialize_with = "de_usage_stats"
    )]
    pub usage_stats: HashMap<String, ProfileUsageStats>,
}

impl Default for AuthProfileStore {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            profiles: HashMap::new(),
            order: HashMap::new(),
            last_good: HashMap::new(),
            usage_stats: HashMap::new(),
        }
    }
}

impl AuthProfileStore {
    /// Usage stats for a profile, if any have been recorded.
    pub fn stats(&self, profile_id: &str) -> Option<&ProfileUsageStats> {
        self.usage_stats.get(profile_id)
    }

    /// Provider of a profile's credential. Unknown credential variants
    /// have no routable provider.
    pub fn provider_of(&self, profile_id: &str) -> Option<&str> {
        self.profiles.get(profile_id).and_then(ProfileCredential::provider)
    }

    /// Rotation override for an agent. Stale references to profiles that
    /// no longer exist are skipped, never an error.
    pub fn rotation_for(&self, agent_id: &str) -> Option<Vec<&str>> {
        self.order.get(agent_id).map(|ids| {
            ids.iter()
                .filter(|id| self.profiles.contains_key(id.as_str()))
                .map(String::as_str)
                .collect()
        })
    }

    /// Most recently successful profile for a routing key, if it still
    /// exists in `profiles`.
    pub fn last_good_for(&self, routing_key: &str) -> Option<&str> {
        self.last_good
            .get(routing_key)
            .filter(|id| self.profiles.contains_key(id.as_str()))
            .map(String::as_str)
    }
}

/// A stored credential. Unknown `type` tags are preserved verbatim and
/// skipped for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileCredential {
    Known(CredentialKind),
    Unknown(serde_json::Value),
}

impl ProfileCredential {
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Known(kind) => Some(kind.provider()),
            Self::Unknown(_) => None,
        }
    }
}

/// The three credential shapes, discriminated by `type` on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey {
        provider: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Secret<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Static bearer token; not refreshable by this system.
    Token {
        provider: String,
        token: Secret<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "de_timestamp_ms"
        )]
        expires: Option<u64>,
    },
    /// OAuth credential; refresh is handled outside this system.
    #[serde(rename_all = "camelCase")]
    Oauth {
        provider: String,
        oauth: OAuthTokens,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

impl CredentialKind {
    pub fn provider(&self) -> &str {
        match self {
            Self::ApiKey { provider, .. }
            | Self::Token { provider, .. }
            | Self::Oauth { provider, .. } => provider,
        }
    }
}

/// OAuth token payload stored alongside an `oauth` credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
    /// Expiration as unix timestamp in milliseconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub expires: Option<u64>,
}

/// Why a call against a profile failed. Closed set; serialized snake_case
/// both as values and as `failureCounts` map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Auth,
    Format,
    RateLimit,
    Billing,
    Timeout,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Format => "format",
            Self::RateLimit => "rate_limit",
            Self::Billing => "billing",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Only rate limits and timeouts are worth waiting out on the same
    /// profile; everything else is structural.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-profile usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUsageStats {
    /// Last successful use, ms since epoch.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub last_used: Option<u64>,

    /// Temporarily unusable until this time (rate limit / timeout).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub cooldown_until: Option<u64>,

    /// Disabled for a structural reason (billing) until this time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub disabled_until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<FailureReason>,

    /// Consecutive profile-wide errors inside the current failure window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,

    /// Structural failure counts by reason.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failure_counts: HashMap<FailureReason, u32>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub last_failure_at: Option<u64>,

    /// Model identifier -> per-model statistics.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_stats: HashMap<String, ModelUsageStats>,

    /// Fields this version does not know about, preserved on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Per-(profile, model) usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsageStats {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub last_used: Option<u64>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub cooldown_until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_timestamp_ms"
    )]
    pub last_failure_at: Option<u64>,

    /// Fields this version does not know about, preserved on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Keep only timestamps that actually constrain anything: present, finite,
/// strictly positive.
pub fn positive_ms(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

/// Timestamps deserialize through a filter: zero, negative, and non-finite
/// numbers mean absent, not epoch.
fn de_timestamp_ms<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v as u64))
}

/// A `usageStats` value that does not parse is treated as empty; losing
/// stats is recoverable, refusing to load the store is not.
fn de_usage_stats<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, ProfileUsageStats>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}
