//! Common types for the profile failover workspace

mod secret;

pub use secret::Secret;
