//! Cooldown configuration
//!
//! The `[auth.cooldowns]` table controls billing backoff and the failure
//! window. Values are hours; invalid (non-positive or non-finite) values
//! fall through to defaults rather than failing the load. The
//! per-provider override table is keyed by canonical provider names.

use std::collections::HashMap;
use std::path::Path;

use profile_store::normalize;
use serde::Deserialize;

use crate::backoff::HOUR_MS;

pub const DEFAULT_BILLING_BACKOFF_HOURS: f64 = 5.0;
pub const DEFAULT_BILLING_MAX_HOURS: f64 = 24.0;
pub const DEFAULT_FAILURE_WINDOW_HOURS: f64 = 24.0;

/// Errors from loading the cooldown configuration table. Invalid values
/// inside a well-formed table are not errors; they fall back to defaults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading cooldown config: {0}")]
    Read(#[from] std::io::Error),

    #[error("parsing cooldown config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Raw `[auth.cooldowns]` table as written in configuration. camelCase
/// spellings are accepted for parity with the store's JSON conventions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CooldownSettings {
    #[serde(alias = "billingBackoffHours")]
    pub billing_backoff_hours: Option<f64>,

    #[serde(alias = "billingMaxHours")]
    pub billing_max_hours: Option<f64>,

    #[serde(alias = "failureWindowHours")]
    pub failure_window_hours: Option<f64>,

    #[serde(alias = "billingBackoffHoursByProvider")]
    pub billing_backoff_hours_by_provider: HashMap<String, f64>,
}

impl CooldownSettings {
    /// Load the `[auth.cooldowns]` table from a TOML config file. A
    /// missing table yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let doc: ConfigDoc = toml::from_str(&contents)?;
        Ok(doc.auth.cooldowns)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDoc {
    auth: AuthSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthSection {
    cooldowns: CooldownSettings,
}

/// Validated cooldown policy in milliseconds.
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub billing_base_ms: u64,
    pub billing_max_ms: u64,
    pub failure_window_ms: u64,
    by_provider_ms: HashMap<String, u64>,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self::from_settings(&CooldownSettings::default())
    }
}

impl CooldownConfig {
    /// Validate raw settings; anything invalid falls back to the default.
    pub fn from_settings(settings: &CooldownSettings) -> Self {
        let by_provider_ms = settings
            .billing_backoff_hours_by_provider
            .iter()
            .filter_map(|(provider, hours)| {
                valid_hours(Some(*hours)).map(|h| (normalize(provider), hours_to_ms(h)))
            })
            .collect();

        Self {
            billing_base_ms: hours_to_ms(
                valid_hours(settings.billing_backoff_hours)
                    .unwrap_or(DEFAULT_BILLING_BACKOFF_HOURS),
            ),
            billing_max_ms: hours_to_ms(
                valid_hours(settings.billing_max_hours).unwrap_or(DEFAULT_BILLING_MAX_HOURS),
            ),
            failure_window_ms: hours_to_ms(
                valid_hours(settings.failure_window_hours)
                    .unwrap_or(DEFAULT_FAILURE_WINDOW_HOURS),
            ),
            by_provider_ms,
        }
    }

    /// Policy resolved for one credential's provider, honoring the
    /// per-provider billing override.
    pub fn resolve_for(&self, provider: Option<&str>) -> ResolvedCooldown {
        let billing_base_ms = provider
            .and_then(|p| self.by_provider_ms.get(&normalize(p)))
            .copied()
            .unwrap_or(self.billing_base_ms);
        ResolvedCooldown {
            billing_base_ms,
            billing_max_ms: self.billing_max_ms,
            failure_window_ms: self.failure_window_ms,
        }
    }
}

/// Cooldown policy resolved for a single profile.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedCooldown {
    pub billing_base_ms: u64,
    pub billing_max_ms: u64,
    pub failure_window_ms: u64,
}

impl Default for ResolvedCooldown {
    fn default() -> Self {
        CooldownConfig::default().resolve_for(None)
    }
}

fn valid_hours(hours: Option<f64>) -> Option<f64> {
    hours.filter(|h| h.is_finite() && *h > 0.0)
}

fn hours_to_ms(hours: f64) -> u64 {
    (hours * HOUR_MS as f64) as u64
}
