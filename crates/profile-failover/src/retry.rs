//! Infinite retry driver
//!
//! Invokes a caller-provided `execute` until it succeeds, sleeping out
//! cooldowns between attempts. Only rate-limit and timeout failover
//! errors are retried; everything else propagates immediately. There is
//! no retry budget: the loop ends on success, on cancellation, or on a
//! non-qualifying error. Callers that want a budget wrap the driver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use profile_store::ProfileStore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::eligibility::min_eligible_wait;
use crate::error::{Failover, RetryError};

/// Wait between attempts when no candidate information is available.
const DEFAULT_WAIT_MS: u64 = 60_000;

/// Payload handed to `on_quota_exhaustion` before each cooldown sleep.
#[derive(Debug, Clone)]
pub struct QuotaExhaustion {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub wait_ms: u64,
    pub attempt: u64,
}

pub type QuotaCallback = Arc<dyn Fn(&QuotaExhaustion) + Send + Sync>;

/// Knobs for `run_with_failover`.
///
/// When `store`, `candidates`, and `model` are all present, the wait
/// between attempts is the earliest point at which some candidate
/// becomes eligible again; otherwise it defaults to one minute.
pub struct RetryOptions<'a> {
    pub store: Option<&'a ProfileStore>,
    pub candidates: Vec<String>,
    pub model: Option<String>,
    /// Provider reported through `QuotaExhaustion`.
    pub provider: Option<String>,
    /// Invoked before each cooldown sleep; without it a warning is
    /// logged instead.
    pub on_quota_exhaustion: Option<QuotaCallback>,
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
}

impl Default for RetryOptions<'_> {
    fn default() -> Self {
        Self {
            store: None,
            candidates: Vec::new(),
            model: None,
            provider: None,
            on_quota_exhaustion: None,
            cancel: CancellationToken::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Drive `execute` to completion through transient provider exhaustion.
///
/// Cancellation is honored at the top of each attempt and during the
/// cooldown sleep; an error observed after cancellation propagates
/// untouched.
pub async fn run_with_failover<T, E, F, Fut>(
    mut execute: F,
    opts: RetryOptions<'_>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Failover,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        if opts.cancel.is_cancelled() {
            return Err(RetryError::Aborted);
        }

        let err = match execute().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if opts.cancel.is_cancelled() {
            return Err(RetryError::Execute(err));
        }

        let retryable = err
            .failover()
            .is_some_and(|failover| failover.reason.is_transient());
        if !retryable {
            return Err(RetryError::Execute(err));
        }

        let wait_ms = resolve_wait(&opts).await;
        let exhaustion = QuotaExhaustion {
            provider: opts.provider.clone(),
            model: opts.model.clone(),
            wait_ms,
            attempt,
        };
        match &opts.on_quota_exhaustion {
            Some(callback) => callback(&exhaustion),
            None => warn!(
                provider = exhaustion.provider.as_deref().unwrap_or("unknown"),
                model = exhaustion.model.as_deref().unwrap_or("unknown"),
                wait_ms,
                attempt,
                "all usable profiles exhausted, waiting for cooldown"
            ),
        }

        if !sleep_with_abort(wait_ms, &opts.cancel).await {
            return Err(RetryError::AbortedDuringCooldown);
        }
    }
}

async fn resolve_wait(opts: &RetryOptions<'_>) -> u64 {
    let (Some(store), Some(model)) = (opts.store, opts.model.as_deref()) else {
        return DEFAULT_WAIT_MS;
    };
    if opts.candidates.is_empty() {
        return DEFAULT_WAIT_MS;
    }
    let snapshot = store.snapshot().await;
    min_eligible_wait(&snapshot, &opts.candidates, Some(model), opts.clock.now_ms())
        .unwrap_or(DEFAULT_WAIT_MS)
}

/// Sleep that wakes promptly on cancellation; returns false when the
/// sleep was aborted. The select drops both the timer and the
/// cancellation listener on every exit path, so nothing leaks.
async fn sleep_with_abort(ms: u64, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use common::Secret;
    use profile_store::{CredentialKind, FailureReason, ProfileCredential, ProfileUsageStats};

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FailoverError;

    fn rate_limited() -> FailoverError {
        FailoverError::new(FailureReason::RateLimit, "quota exhausted")
    }

    async fn store_with_cooldown(
        dir: &tempfile::TempDir,
        profile_id: &str,
        cooldown_until: u64,
    ) -> ProfileStore {
        let store = ProfileStore::load(dir.path().join("profiles.json"))
            .await
            .unwrap();
        store
            .update(|doc| {
                doc.profiles.insert(
                    profile_id.into(),
                    ProfileCredential::Known(CredentialKind::ApiKey {
                        provider: "anthropic".into(),
                        key: Some(Secret::new("sk_test".into())),
                        email: None,
                        metadata: None,
                    }),
                );
                doc.usage_stats.insert(
                    profile_id.into(),
                    ProfileUsageStats {
                        cooldown_until: Some(cooldown_until),
                        ..Default::default()
                    },
                );
                true
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_candidate_cooldown_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_000_000;
        let store = store_with_cooldown(&dir, "p1", now + 2000).await;

        let calls = AtomicU32::new(0);
        let observed: Arc<Mutex<Vec<QuotaExhaustion>>> = Arc::new(Mutex::new(Vec::new()));
        let observed_by_callback = observed.clone();

        let opts = RetryOptions {
            store: Some(&store),
            candidates: vec!["p1".to_string()],
            model: Some("opus".to_string()),
            provider: Some("anthropic".to_string()),
            on_quota_exhaustion: Some(Arc::new(move |exhaustion| {
                observed_by_callback.lock().unwrap().push(exhaustion.clone());
            })),
            clock: Arc::new(ManualClock::at(now)),
            ..Default::default()
        };

        let started = tokio::time::Instant::now();
        let result = run_with_failover(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited())
                    } else {
                        Ok("done")
                    }
                }
            },
            opts,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(2000));

        let events = observed.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].wait_ms, 2000);
        assert_eq!(events[0].attempt, 1);
        assert_eq!(events[0].provider.as_deref(), Some("anthropic"));
        assert_eq!(events[0].model.as_deref(), Some("opus"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_sleep_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_000_000;
        let store = store_with_cooldown(&dir, "p1", now + 2000).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let calls = AtomicU32::new(0);
        let opts = RetryOptions {
            store: Some(&store),
            candidates: vec!["p1".to_string()],
            model: Some("opus".to_string()),
            cancel,
            clock: Arc::new(ManualClock::at(now)),
            ..Default::default()
        };

        let result: Result<&str, _> = run_with_failover(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            },
            opts,
        )
        .await;

        assert!(matches!(result, Err(RetryError::AbortedDuringCooldown)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_before_execute() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = AtomicU32::new(0);
        let result: Result<&str, RetryError<FailoverError>> = run_with_failover(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("never") }
            },
            RetryOptions {
                cancel,
                ..Default::default()
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Aborted)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_transient_failover_errors_propagate() {
        for reason in [
            FailureReason::Billing,
            FailureReason::Auth,
            FailureReason::Format,
            FailureReason::Unknown,
        ] {
            let calls = AtomicU32::new(0);
            let result: Result<&str, _> = run_with_failover(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(FailoverError::new(reason, "nope")) }
                },
                RetryOptions::default(),
            )
            .await;

            match result {
                Err(RetryError::Execute(err)) => assert_eq!(err.reason, reason),
                other => panic!("expected Execute, got {other:?}"),
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_wait_is_one_minute_without_candidates() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = run_with_failover(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited())
                    } else {
                        Ok(())
                    }
                }
            },
            RetryOptions::default(),
        )
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(DEFAULT_WAIT_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn eligible_candidate_means_no_wait() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_000_000;
        // Cooldown already expired relative to the injected clock.
        let store = store_with_cooldown(&dir, "p1", now - 1).await;

        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = run_with_failover(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited())
                    } else {
                        Ok(())
                    }
                }
            },
            RetryOptions {
                store: Some(&store),
                candidates: vec!["p1".to_string()],
                model: Some("opus".to_string()),
                clock: Arc::new(ManualClock::at(now)),
                ..Default::default()
            },
        )
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_millis(DEFAULT_WAIT_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_errors_are_retried_like_rate_limits() {
        let calls = AtomicU32::new(0);
        let result = run_with_failover(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FailoverError::new(FailureReason::Timeout, "deadline"))
                    } else {
                        Ok("recovered")
                    }
                }
            },
            RetryOptions {
                store: None,
                candidates: Vec::new(),
                model: None,
                ..Default::default()
            },
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
