//! Domain models - core types shared by the engine
//!
//! - `types` - identifiers, door sides, the closed event-kind set
//! - `door` - admission policy, fingerprints, access events
//! - `device` - wearable devices and location telemetry
//! - `geofence` - versioned boundary policies and crossing events
//! - `notification` - owner preferences and rendered messages
//! - `firmware` - collar firmware releases and update checks

pub mod device;
pub mod door;
pub mod firmware;
pub mod geofence;
pub mod notification;
pub mod types;
