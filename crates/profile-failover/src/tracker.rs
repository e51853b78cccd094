//! Failure-reason surface over the locked store
//!
//! Public entry points by which callers record successes and classified
//! failures against profiles. Every mutation goes through the store's
//! locked read-modify-write; when the locked path declines (profile gone
//! from the fresh document) or fails (lock or I/O error), the tracker
//! falls back to mutating the stale in-memory copy and saving it
//! best-effort, so the signal is not lost outright. Missing profiles are
//! silent no-ops, never errors.

use std::sync::Arc;

use profile_store::{AuthProfileStore, FailureReason, ProfileStore, ProfileUsageStats, normalize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CooldownConfig;
use crate::eligibility;
use crate::stats;

/// Tracks per-profile usage outcomes and answers eligibility questions.
pub struct ProfileTracker {
    store: Arc<ProfileStore>,
    config: CooldownConfig,
    clock: Arc<dyn Clock>,
}

impl ProfileTracker {
    pub fn new(store: Arc<ProfileStore>, config: CooldownConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock. Tests pin time with a manual clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    /// Record a successful call: wipes the profile's timers and counts,
    /// stamps `lastUsed`, and remembers the profile as last-good for its
    /// provider. With a model, that model's counters reset too.
    pub async fn mark_used(
        &self,
        profile_id: &str,
        model: Option<&str>,
    ) -> Option<ProfileUsageStats> {
        let now_ms = self.clock.now_ms();
        let result = self
            .apply(profile_id, |doc: &mut AuthProfileStore| {
                let existing = doc.stats(profile_id).cloned().unwrap_or_default();
                let next = stats::apply_success(&existing, now_ms, model);
                if let Some(provider) = doc.provider_of(profile_id).map(normalize) {
                    doc.last_good.insert(provider, profile_id.to_string());
                }
                doc.usage_stats.insert(profile_id.to_string(), next);
            })
            .await;
        if result.is_some() {
            debug!(profile_id, "profile marked used");
        }
        result
    }

    /// Record a classified failure. Billing disables the profile with a
    /// doubling backoff; a model-scoped rate limit or timeout cools down
    /// only that model; everything else cools down the whole profile.
    /// `retry_after_ms` overrides the computed backoff on non-billing
    /// paths.
    pub async fn mark_failure(
        &self,
        profile_id: &str,
        reason: FailureReason,
        model: Option<&str>,
        retry_after_ms: Option<u64>,
    ) -> Option<ProfileUsageStats> {
        let now_ms = self.clock.now_ms();
        let result = self
            .apply(profile_id, |doc: &mut AuthProfileStore| {
                let resolved = self.config.resolve_for(doc.provider_of(profile_id));
                let existing = doc.stats(profile_id).cloned().unwrap_or_default();
                let next = stats::apply_failure(
                    &existing,
                    now_ms,
                    reason,
                    &resolved,
                    model,
                    retry_after_ms,
                );
                doc.usage_stats.insert(profile_id.to_string(), next);
            })
            .await;

        if let Some(stats) = &result {
            match reason {
                FailureReason::Billing => warn!(
                    profile_id,
                    disabled_until = stats.disabled_until.unwrap_or(0),
                    "profile disabled (billing)"
                ),
                _ if model.is_some() && reason.is_transient() => info!(
                    profile_id,
                    model = model.unwrap_or_default(),
                    reason = %reason,
                    "model entering cooldown"
                ),
                _ => info!(
                    profile_id,
                    reason = %reason,
                    cooldown_until = stats.cooldown_until.unwrap_or(0),
                    "profile entering cooldown"
                ),
            }
        }
        result
    }

    /// Convenience for the common case: a rate-limit failure.
    pub async fn mark_cooldown(
        &self,
        profile_id: &str,
        model: Option<&str>,
        retry_after_ms: Option<u64>,
    ) -> Option<ProfileUsageStats> {
        self.mark_failure(profile_id, FailureReason::RateLimit, model, retry_after_ms)
            .await
    }

    /// Manual reset. With a model, clears only that model's stats;
    /// without one, clears only the profile-wide `errorCount` and
    /// `cooldownUntil` (disables and structural failure counts survive).
    pub async fn clear_cooldown(
        &self,
        profile_id: &str,
        model: Option<&str>,
    ) -> Option<ProfileUsageStats> {
        let result = self
            .apply(profile_id, |doc: &mut AuthProfileStore| {
                let existing = doc.stats(profile_id).cloned().unwrap_or_default();
                let next = stats::apply_clear(&existing, model);
                doc.usage_stats.insert(profile_id.to_string(), next);
            })
            .await;
        if result.is_some() {
            info!(profile_id, "cooldown cleared");
        }
        result
    }

    /// Whether the profile is currently unusable for `model`, judged from
    /// the in-memory snapshot (a hint; authoritative state is on disk).
    pub async fn is_in_cooldown(&self, profile_id: &str, model: Option<&str>) -> bool {
        let snapshot = self.store.snapshot().await;
        eligibility::is_in_cooldown(&snapshot, profile_id, model, self.clock.now_ms())
    }

    /// When the profile next becomes usable for `model`, if it is
    /// currently held by any timer.
    pub async fn next_usable_at(
        &self,
        profile_id: &str,
        model: Option<&str>,
    ) -> Option<u64> {
        let snapshot = self.store.snapshot().await;
        snapshot
            .stats(profile_id)
            .and_then(|stats| eligibility::resolve_unusable_until(stats, model))
    }

    /// Run `mutate` through the locked updater, falling back to the
    /// in-memory copy when the locked path declines or fails. Returns the
    /// post-mutation stats, or `None` when the profile is unknown on both
    /// paths.
    async fn apply<F>(&self, profile_id: &str, mutate: F) -> Option<ProfileUsageStats>
    where
        F: Fn(&mut AuthProfileStore) + Send + Sync,
    {
        let attempted = self
            .store
            .update(|doc| {
                if !doc.profiles.contains_key(profile_id) {
                    return false;
                }
                mutate(doc);
                true
            })
            .await;

        match attempted {
            Ok(Some(doc)) => doc.stats(profile_id).cloned(),
            Ok(None) => self.fallback(profile_id, &mutate).await,
            Err(e) => {
                warn!(profile_id, error = %e, "locked store update failed, using in-memory fallback");
                self.fallback(profile_id, &mutate).await
            }
        }
    }

    /// Best-effort path without serialization against concurrent writers.
    /// Can resurrect a profile's stats after a concurrent delete; callers
    /// see a warning when that happens.
    async fn fallback<F>(&self, profile_id: &str, mutate: &F) -> Option<ProfileUsageStats>
    where
        F: Fn(&mut AuthProfileStore) + Send + Sync,
    {
        let changed = self
            .store
            .mutate(|doc| {
                if !doc.profiles.contains_key(profile_id) {
                    return false;
                }
                mutate(doc);
                true
            })
            .await;

        if !changed {
            return None;
        }
        warn!(profile_id, "writing profile stats through unserialized in-memory fallback");
        if let Err(e) = self.store.save().await {
            warn!(profile_id, error = %e, "best-effort store save failed");
        }
        self.store.snapshot().await.stats(profile_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common::Secret;
    use profile_store::{CredentialKind, ProfileCredential};

    use super::*;
    use crate::backoff::HOUR_MS;
    use crate::clock::ManualClock;
    use crate::config::CooldownSettings;

    const DAY_MS: u64 = 24 * HOUR_MS;

    fn api_key(provider: &str) -> ProfileCredential {
        ProfileCredential::Known(CredentialKind::ApiKey {
            provider: provider.into(),
            key: Some(Secret::new(format!("sk_{provider}"))),
            email: None,
            metadata: None,
        })
    }

    async fn tracker_with_profiles(
        dir: &tempfile::TempDir,
        profiles: &[(&str, &str)],
        clock: ManualClock,
    ) -> ProfileTracker {
        let path = dir.path().join("profiles.json");
        let store = ProfileStore::load(path).await.unwrap();
        store
            .update(|doc| {
                for (id, provider) in profiles {
                    doc.profiles.insert(id.to_string(), api_key(provider));
                }
                true
            })
            .await
            .unwrap();
        ProfileTracker::new(Arc::new(store), CooldownConfig::default())
            .with_clock(Arc::new(clock))
    }

    #[tokio::test]
    async fn rate_limit_failures_escalate_then_window_resets() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], clock.clone()).await;

        let stats = tracker
            .mark_failure("p1", FailureReason::RateLimit, None, None)
            .await
            .unwrap();
        assert_eq!(stats.error_count, Some(1));
        assert_eq!(stats.cooldown_until, Some(60_000));
        assert_eq!(stats.last_failure_at, Some(0));

        clock.set(30_000);
        let stats = tracker
            .mark_failure("p1", FailureReason::RateLimit, None, None)
            .await
            .unwrap();
        assert_eq!(stats.error_count, Some(2));
        assert_eq!(stats.cooldown_until, Some(330_000));

        clock.set(DAY_MS + 1 + 30_000);
        let stats = tracker
            .mark_failure("p1", FailureReason::RateLimit, None, None)
            .await
            .unwrap();
        assert_eq!(stats.error_count, Some(1));
        assert_eq!(stats.cooldown_until, Some(DAY_MS + 1 + 30_000 + 60_000));
    }

    #[tokio::test]
    async fn billing_failures_disable_and_double() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], clock.clone()).await;

        let stats = tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        assert_eq!(stats.disabled_until, Some(5 * HOUR_MS));
        assert_eq!(stats.disabled_reason, Some(FailureReason::Billing));
        assert_eq!(stats.failure_counts.get(&FailureReason::Billing), Some(&1));

        clock.set(HOUR_MS);
        let stats = tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        assert_eq!(stats.failure_counts.get(&FailureReason::Billing), Some(&2));
        assert_eq!(stats.disabled_until, Some(HOUR_MS + 10 * HOUR_MS));
    }

    #[tokio::test]
    async fn per_provider_billing_override_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let store = ProfileStore::load(path).await.unwrap();
        store
            .update(|doc| {
                doc.profiles.insert("p1".into(), api_key("Claude"));
                true
            })
            .await
            .unwrap();

        let settings = CooldownSettings {
            billing_backoff_hours_by_provider: HashMap::from([(
                "anthropic".to_string(),
                2.0,
            )]),
            ..Default::default()
        };
        let tracker = ProfileTracker::new(
            Arc::new(store),
            CooldownConfig::from_settings(&settings),
        )
        .with_clock(Arc::new(ManualClock::at(0)));

        // The credential says "Claude"; normalization folds both sides.
        let stats = tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        assert_eq!(stats.disabled_until, Some(2 * HOUR_MS));
    }

    #[tokio::test]
    async fn model_scoped_cooldown_leaves_other_models_usable() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        tracker
            .mark_failure("p1", FailureReason::RateLimit, Some("opus"), None)
            .await
            .unwrap();

        assert!(tracker.is_in_cooldown("p1", Some("opus")).await);
        assert!(!tracker.is_in_cooldown("p1", Some("haiku")).await);
        assert!(!tracker.is_in_cooldown("p1", None).await);
    }

    #[tokio::test]
    async fn retry_after_hint_overrides_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        let stats = tracker.mark_cooldown("p1", None, Some(2500)).await.unwrap();
        assert_eq!(stats.cooldown_until, Some(2500));
    }

    #[tokio::test]
    async fn mark_used_wipes_state_and_records_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "Claude")], clock.clone()).await;

        tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        tracker
            .mark_failure("p1", FailureReason::RateLimit, Some("opus"), None)
            .await
            .unwrap();
        assert!(tracker.is_in_cooldown("p1", Some("opus")).await);

        clock.set(1000);
        let stats = tracker.mark_used("p1", Some("opus")).await.unwrap();
        assert_eq!(stats.error_count, None);
        assert_eq!(stats.cooldown_until, None);
        assert_eq!(stats.disabled_until, None);
        assert_eq!(stats.disabled_reason, None);
        assert!(stats.failure_counts.is_empty());
        assert_eq!(stats.last_used, Some(1000));
        assert!(!tracker.is_in_cooldown("p1", Some("opus")).await);

        let snapshot = tracker.store().snapshot().await;
        assert_eq!(snapshot.last_good_for("anthropic"), Some("p1"));
    }

    #[tokio::test]
    async fn clear_cooldown_preserves_structural_state() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        tracker
            .mark_failure("p1", FailureReason::RateLimit, None, None)
            .await
            .unwrap();
        tracker
            .mark_failure("p1", FailureReason::RateLimit, Some("opus"), None)
            .await
            .unwrap();

        let stats = tracker.clear_cooldown("p1", None).await.unwrap();
        assert_eq!(stats.error_count, None);
        assert_eq!(stats.cooldown_until, None);
        assert_eq!(stats.disabled_until, Some(5 * HOUR_MS));
        assert_eq!(stats.disabled_reason, Some(FailureReason::Billing));
        assert_eq!(stats.failure_counts.get(&FailureReason::Billing), Some(&1));
        assert!(stats.model_stats.contains_key("opus"));

        let stats = tracker.clear_cooldown("p1", Some("opus")).await.unwrap();
        assert!(!stats.model_stats.contains_key("opus"));
        assert_eq!(stats.disabled_until, Some(5 * HOUR_MS));
    }

    #[tokio::test]
    async fn missing_profile_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        assert!(tracker.mark_used("ghost", None).await.is_none());
        assert!(
            tracker
                .mark_failure("ghost", FailureReason::RateLimit, None, None)
                .await
                .is_none()
        );
        assert!(tracker.clear_cooldown("ghost", None).await.is_none());

        let snapshot = tracker.store().snapshot().await;
        assert!(!snapshot.usage_stats.contains_key("ghost"));
    }

    #[tokio::test]
    async fn fallback_path_resurrects_concurrently_deleted_profile() {
        // The locked update declines because another writer removed the
        // profile from disk; the stale in-memory copy still has it, so
        // the fallback save writes its stats back. Deliberate behavior.
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        let other = ProfileStore::load(tracker.store().path().to_path_buf())
            .await
            .unwrap();
        other
            .update(|doc| {
                doc.profiles.remove("p1");
                true
            })
            .await
            .unwrap();

        let stats = tracker
            .mark_failure("p1", FailureReason::RateLimit, None, None)
            .await;
        assert!(stats.is_some());

        let reloaded = ProfileStore::load(tracker.store().path().to_path_buf())
            .await
            .unwrap();
        let snapshot = reloaded.snapshot().await;
        assert!(snapshot.usage_stats.contains_key("p1"));
    }

    #[tokio::test]
    async fn next_usable_at_reports_the_latest_timer() {
        let dir = tempfile::tempdir().unwrap();
        let tracker =
            tracker_with_profiles(&dir, &[("p1", "anthropic")], ManualClock::at(0)).await;

        assert_eq!(tracker.next_usable_at("p1", None).await, None);

        tracker
            .mark_failure("p1", FailureReason::Billing, None, None)
            .await
            .unwrap();
        assert_eq!(
            tracker.next_usable_at("p1", None).await,
            Some(5 * HOUR_MS)
        );
    }
}
