//! Kiosk services basic library
//!
//! Provides basic functions shared by the device services, including:
//! - logging initialisation
//! - graceful shutdown signal handling
//! - hex formatting for raw traffic logs

pub mod error;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
