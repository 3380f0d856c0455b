//! IO modules - external system interfaces
//!
//! - `device_api` - hyper endpoint used by doors and collars
//! - `owner_api` - token-guarded owner and firmware management routes
//! - `event_journal` - append-only JSONL event log
//! - `firmware_files` - collar firmware images on disk
//! - `image_store` - captured door frames on disk
//! - `mqtt_notify` - MQTT delivery of owner notifications
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod device_api;
pub mod event_journal;
pub mod firmware_files;
pub mod image_store;
pub mod mqtt_notify;
pub mod owner_api;
pub mod prometheus;

// Re-export commonly used types
pub use device_api::{start_device_api, ApiState};
pub use event_journal::EventJournal;
pub use firmware_files::FirmwareFiles;
pub use image_store::ImageStore;
pub use mqtt_notify::MqttTransport;
