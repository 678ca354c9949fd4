//! Runtime: per-device supervision and the service facade

pub mod service;
pub mod supervisor;

pub use service::DeviceService;
pub use supervisor::{DeviceSupervisor, SupervisorHandle, SupervisorState, SupervisorStats};
