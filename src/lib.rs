//! ytsig - remote signature resolver for YouTube player scripts.
//!
//! Streaming clients hand this service a player-script reference plus
//! obfuscated tokens; it fetches the referenced script, extracts the
//! deobfuscation routines, evaluates them, and returns decrypted values,
//! the player's signature timestamp, or a rewritten stream URL.
//!
//! The interesting part is the resolver pipeline: an on-disk script store,
//! three TTL/LRU in-memory caches, a bounded preprocessing worker pool, and
//! a single-flight registry that guarantees at most one concurrent
//! fetch+preprocess+extract per player fingerprint.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod player;
pub mod ratelimit;
pub mod registry;
pub mod resolvers;
pub mod server;
pub mod solver;
pub mod worker;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use server::AppState;
