//! Persistent auth profile store
//!
//! Holds the fleet of provider credentials an agent rotates through, plus
//! per-profile usage statistics (cooldowns, disables, error counts). The
//! store is a single JSON document on disk; concurrent invocations
//! serialize their mutations through an advisory file lock and every write
//! is atomic, so the file always parses.
//!
//! Mutation flow:
//! 1. Caller invokes `ProfileStore::update` with a closure
//! 2. The store acquires the exclusive `.lock` (cancellable)
//! 3. The document is re-read fresh from disk (the in-memory copy is a hint)
//! 4. The closure mutates the fresh document, or declines
//! 5. On a mutation, the document is written atomically and the in-memory
//!    copy refreshed
//!
//! Cooldown policy lives in the `profile-failover` crate; this crate only
//! knows how to persist and serialize the state it decides on.

pub mod error;
pub mod lock;
pub mod provider;
pub mod schema;
pub mod store;

pub use error::{Error, Result};
pub use lock::StoreLock;
pub use provider::normalize;
pub use schema::{
    AuthProfileStore, CredentialKind, FailureReason, ModelUsageStats, OAuthTokens,
    ProfileCredential, ProfileUsageStats, STORE_VERSION, positive_ms,
};
pub use store::{ProfileStore, parse_store};
