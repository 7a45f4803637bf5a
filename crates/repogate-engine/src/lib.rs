//! Cache coherence and request-serving engine for a caching proxy in front
//! of Alpine APK and Debian/Ubuntu APT package repositories.
//!
//! The engine is organized as one module per component of the design: a
//! [`classify`]r turns a request path into a [`types::CacheKey`], a
//! [`lock_registry`] gives exclusive per-key access during fetches, an
//! [`access_tracker`] and [`freshness`] policy decide whether a cached
//! object is still usable, an [`integrity`] store records and verifies
//! content digests, a [`memory_cache`] and [`disk_cache`] hold content at
//! two tiers, an [`upstream`] pool selects and health-checks origins, a
//! [`conditional`] protocol bridges client/cache/upstream `304` handling,
//! a [`fetch`] coordinator runs the miss path, a [`handler`] dispatches
//! incoming requests, and a [`janitor`] runs periodic maintenance. The
//! [`engine`] module composes all of these into one `Clone`-able handle.

pub mod access_tracker;
pub mod classify;
pub mod conditional;
pub mod disk_cache;
pub mod engine;
pub mod fetch;
pub mod freshness;
pub mod handler;
pub mod integrity;
pub mod janitor;
pub mod lock_registry;
pub mod memory_cache;
pub mod metrics;
pub mod types;
pub mod upstream;

pub use engine::Engine;
pub use types::CacheKey;
