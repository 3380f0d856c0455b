//! Services - business logic
//!
//! - `fingerprint` - perceptual hash of a frame and hash similarity
//! - `identity_matcher` - best fingerprint match within one owner
//! - `admission` - door admission pipeline, policy and access log
//! - `device_trust` - collar challenge verification and device pairing
//! - `replay_cache` - remembers verified challenges
//! - `telemetry` - location batches, history and activity summaries
//! - `geofence_sync` - fence management, incremental sync and crossings
//! - `notifier` - owner notification queue and delivery worker
//! - `animal_registry` - owner-managed animals and fingerprint enrollment
//! - `firmware` - collar firmware checks, downloads and uploads

pub mod admission;
pub mod animal_registry;
pub mod device_trust;
pub mod error;
pub mod fingerprint;
pub mod firmware;
pub mod geofence_sync;
pub mod identity_matcher;
pub mod notifier;
pub mod replay_cache;
pub mod telemetry;

// Re-export commonly used types
pub use admission::{AccessDecision, AdmissionEngine};
pub use animal_registry::AnimalRegistry;
pub use device_trust::DeviceTrustVerifier;
pub use error::{EngineError, EngineResult};
pub use firmware::FirmwareCatalog;
pub use geofence_sync::GeofencePolicySync;
pub use identity_matcher::IdentityMatcher;
pub use notifier::{create_notification_channel, NotificationSender, NotificationWorker, Notifier};
pub use telemetry::TelemetryIngest;
