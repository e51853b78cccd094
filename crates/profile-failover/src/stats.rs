//! Usage-stat transitions
//!
//! Pure functions mapping the current stats, a clock reading, and the
//! failure classification to the next stats. Billing failures disable the
//! whole profile with a doubling backoff; a rate limit or timeout scoped
//! to a model cools down only that model; everything else penalizes the
//! profile inside a rolling failure window. Success wipes the slate.

use profile_store::{FailureReason, ProfileUsageStats};

use crate::backoff::{billing_backoff_ms, rate_limit_backoff_ms};
use crate::config::ResolvedCooldown;

/// Next stats after a classified failure at `now_ms`.
///
/// `retry_after_ms` overrides the computed backoff on every path except
/// billing, whose backoff is structural.
pub fn apply_failure(
    existing: &ProfileUsageStats,
    now_ms: u64,
    reason: FailureReason,
    cfg: &ResolvedCooldown,
    model: Option<&str>,
    retry_after_ms: Option<u64>,
) -> ProfileUsageStats {
    let mut next = existing.clone();
    let window_expired = existing
        .last_failure_at
        .is_some_and(|at| now_ms.saturating_sub(at) > cfg.failure_window_ms);

    if reason == FailureReason::Billing {
        if window_expired {
            next.failure_counts.clear();
        }
        let count = next
            .failure_counts
            .get(&FailureReason::Billing)
            .copied()
            .unwrap_or(0)
            + 1;
        next.failure_counts.insert(FailureReason::Billing, count);
        let backoff = billing_backoff_ms(count, cfg.billing_base_ms, cfg.billing_max_ms);
        next.disabled_until = Some(now_ms + backoff);
        next.disabled_reason = Some(FailureReason::Billing);
        next.last_failure_at = Some(now_ms);
        return next;
    }

    if let Some(model_id) = model.filter(|_| reason.is_transient()) {
        // Model-scoped penalty: the profile as a whole stays usable and
        // its counters are untouched.
        let entry = next.model_stats.entry(model_id.to_string()).or_default();
        let count = entry.error_count.unwrap_or(0) + 1;
        let backoff = retry_after_ms.unwrap_or_else(|| rate_limit_backoff_ms(count));
        entry.error_count = Some(count);
        entry.cooldown_until = Some(now_ms + backoff);
        entry.last_failure_at = Some(now_ms);
        return next;
    }

    // Profile-wide penalty: auth, format, unknown, or a rate limit /
    // timeout with no model attached.
    let base = if window_expired {
        0
    } else {
        existing.error_count.unwrap_or(0)
    };
    let count = base + 1;
    let backoff = retry_after_ms.unwrap_or_else(|| rate_limit_backoff_ms(count));
    next.error_count = Some(count);
    next.cooldown_until = Some(now_ms + backoff);
    next.last_failure_at = Some(now_ms);
    next
}

/// Next stats after a successful use at `now_ms`: all profile-wide timers
/// and counts are cleared and `lastUsed` stamped. With a model, that
/// model's counters reset too.
pub fn apply_success(
    existing: &ProfileUsageStats,
    now_ms: u64,
    model: Option<&str>,
) -> ProfileUsageStats {
    let mut next = existing.clone();
    next.error_count = None;
    next.cooldown_until = None;
    next.disabled_until = None;
    next.disabled_reason = None;
    next.failure_counts.clear();
    next.last_used = Some(now_ms);

    if let Some(model_id) = model {
        let entry = next.model_stats.entry(model_id.to_string()).or_default();
        entry.error_count = None;
        entry.cooldown_until = None;
        entry.last_used = Some(now_ms);
    }
    next
}

/// Next stats after a manual clear.
///
/// With a model, only that model's stats go; without one, only the
/// profile-wide `errorCount` and `cooldownUntil` are cleared. Disables,
/// structural failure counts, and per-model stats survive a profile-wide
/// clear.
pub fn apply_clear(existing: &ProfileUsageStats, model: Option<&str>) -> ProfileUsageStats {
    let mut next = existing.clone();
    match model {
        Some(model_id) => {
            next.model_stats.remove(model_id);
        }
        None => {
            next.error_count = None;
            next.cooldown_until = None;
        }
    }
    next
}
