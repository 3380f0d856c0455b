//! Infrastructure - configuration, metrics, clock and storage
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `clock` - UTC clock source (system or fixed)
//! - `store` - Storage collaborator traits
//! - `memory_store` - In-process store implementing every trait

pub mod clock;
pub mod config;
pub mod memory_store;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use memory_store::MemoryStore;
pub use metrics::Metrics;
pub use store::{StoreError, StoreResult};
