//! Device status pipeline
//!
//! Snapshots flow from supervisors through normalization into the store.
//! Only real changes reach the notifier, persistence and change stream.

pub mod catalog;
pub mod error_code;
pub mod notifier;
pub mod persistence;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod store;
pub mod types;

pub use catalog::MessageCatalog;
pub use error_code::{ErrorCategory, ErrorCode, InvalidErrorCode};
pub use notifier::{LogNotificationSink, NotificationBatch, NotificationSink};
pub use persistence::{FanoutPersistence, JsonlFileSink, LogPersistenceSink, PersistenceSink};
pub use pipeline::{PipelineHandle, StatusPipeline};
pub use policy::{ErrorPolicy, PolicyTable};
pub use queue::BoundedQueue;
pub use store::{StatusStore, StoreUpdate};
pub use types::{AlertKey, AlertScope, Health, Severity, StatusEvent, StatusSnapshot};
