//! Device Service Library (devsrv)
//!
//! Async communication and supervision for kiosk peripherals: barcode
//! scanners speaking SSI and cash dispensers speaking an STX/ETX protocol
//! with an ACK/ENQ/NAK handshake, over serial, TCP or vendor SDK sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ Config       │──►│ DeviceService    │──►│ DeviceSupervisor │ one per device
//! │ (figment)    │   │                  │   │ connect/poll/cmd │
//! └──────────────┘   └──────────────────┘   └──────────────────┘
//!                                                    │
//!                         ┌──────────────────────────┤
//!                         ▼                          ▼
//!               ┌──────────────────┐       ┌──────────────────┐
//!               │ Device driver    │       │ StatusPipeline   │
//!               │ (scanner, ...)   │       │ store, notifier, │
//!               └──────────────────┘       │ persistence      │
//!                         │                └──────────────────┘
//!                         ▼
//!               ┌──────────────────┐
//!               │ Protocol client  │ SSI / STX-ETX
//!               ├──────────────────┤
//!               │ Channel + Framer │ read loop, waiters
//!               ├──────────────────┤
//!               │ Transport        │ serial / tcp / sdk
//!               └──────────────────┘
//! ```
//!
//! - **`core`**: configuration, transports, framers and the channel
//! - **`protocols`**: SSI and STX/ETX protocol clients
//! - **`device`**: driver trait, built-in drivers and the driver registry
//! - **`runtime`**: per-device supervisor and the service facade
//! - **`status`**: error codes, policies, store and the status pipeline

pub mod core;
pub mod device;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod status;

pub use crate::core::config::{DeviceDescriptor, DevsrvConfig};
pub use crate::device::{CommandResult, Device, DeviceCommand, DeviceEvent, DeviceRegistry};
pub use crate::error::{DevSrvError, Result};
pub use crate::runtime::{DeviceService, SupervisorHandle, SupervisorState};
pub use crate::status::{StatusPipeline, StatusSnapshot};
