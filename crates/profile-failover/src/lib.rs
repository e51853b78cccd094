//! Failover policy for a fleet of provider credentials
//!
//! Decides which profile an agent may use next, penalizes profiles that
//! just failed with a backoff appropriate to the failure class, waits
//! intelligently when every profile is cooling down, and reports when a
//! profile becomes usable again. State lives in the `profile-store`
//! crate's locked JSON document.
//!
//! Failure lifecycle:
//! 1. `execute` fails; the caller classifies the error into a
//!    `FailureReason` (rate_limit, timeout, billing, auth, format, unknown)
//! 2. `ProfileTracker::mark_failure` applies the penalty: billing disables
//!    the profile for hours, a model-scoped rate limit cools down only
//!    that model, anything else cools down the whole profile
//! 3. `run_with_failover` sleeps until the earliest candidate becomes
//!    eligible again (respecting cancellation), then re-invokes `execute`
//! 4. On success, `ProfileTracker::mark_used` wipes the profile's counters
//!
//! An upstream `Retry-After` hint, when present, overrides the locally
//! computed backoff.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod retry;
pub mod retry_after;
pub mod stats;
pub mod tracker;

pub use backoff::{billing_backoff_ms, rate_limit_backoff_ms};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CooldownConfig, CooldownSettings, ResolvedCooldown};
pub use eligibility::{is_in_cooldown, min_eligible_wait, resolve_unusable_until};
pub use error::{Failover, FailoverError, RetryError};
pub use profile_store::FailureReason;
pub use retry::{QuotaCallback, QuotaExhaustion, RetryOptions, run_with_failover};
pub use retry_after::retry_after_ms;
pub use stats::{apply_clear, apply_failure, apply_success};
pub use tracker::ProfileTracker;
