//! Eligibility oracle
//!
//! Pure questions over a store snapshot: is a profile usable for a model
//! right now, and if not, when does it next become usable? Profiles with
//! no recorded stats are always eligible.

use profile_store::{AuthProfileStore, ProfileUsageStats, positive_ms};

/// Latest of the timers keeping a profile unusable, or `None` when it is
/// eligible. Considers the profile-wide cooldown, the structural disable,
/// and the given model's cooldown; zero timestamps never count.
pub fn resolve_unusable_until(
    stats: &ProfileUsageStats,
    model: Option<&str>,
) -> Option<u64> {
    let model_cooldown = model
        .and_then(|m| stats.model_stats.get(m))
        .and_then(|m| positive_ms(m.cooldown_until));

    [
        positive_ms(stats.cooldown_until),
        positive_ms(stats.disabled_until),
        model_cooldown,
    ]
    .into_iter()
    .flatten()
    .max()
}

/// Whether `profile_id` is unusable for `model` at `now_ms`.
pub fn is_in_cooldown(
    store: &AuthProfileStore,
    profile_id: &str,
    model: Option<&str>,
    now_ms: u64,
) -> bool {
    store
        .stats(profile_id)
        .and_then(|stats| resolve_unusable_until(stats, model))
        .is_some_and(|until| until > now_ms)
}

/// Smallest wait in ms until some candidate becomes eligible.
///
/// `Some(0)` when any candidate is usable now (including candidates with
/// no stats at all); `None` when the candidate list is empty, letting the
/// caller fall back to its default wait.
pub fn min_eligible_wait(
    store: &AuthProfileStore,
    candidates: &[String],
    model: Option<&str>,
    now_ms: u64,
) -> Option<u64> {
    let mut shortest: Option<u64> = None;
    for id in candidates {
        match store
            .stats(id)
            .and_then(|stats| resolve_unusable_until(stats, model))
        {
            Some(until) if until > now_ms => {
                let wait = until - now_ms;
                shortest = Some(shortest.map_or(wait, |s| s.min(wait)));
            }
            _ => return Some(0),
        }
    }
    shortest
}
