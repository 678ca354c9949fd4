//! Transport Layer Module
//!
//! Separates the physical medium from protocol logic.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Channel / Protocol Clients            │
//! └──────────────────────────────────────────────┘
//!                        │
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │   Transport trait: open/close/read/write     │
//! │   + disconnect signal                        │
//! └──────────────────────────────────────────────┘
//!                        │
//!     ┌──────────┬───────┴──────┬──────────┐
//!     ▼          ▼              ▼          ▼
//! ┌────────┐ ┌────────┐   ┌──────────┐ ┌────────┐
//! │ Serial │ │  TCP   │   │ SDK      │ │ None / │
//! │        │ │        │   │ session  │ │ Mock   │
//! └────────┘ └────────┘   └──────────┘ └────────┘
//! ```

pub mod factory;
pub mod mock;
pub mod null;
pub mod sdk;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use factory::{TransportFactory, TransportType};
pub use mock::MockTransport;
pub use null::NullTransport;
pub use sdk::{SdkTransport, VendorSession};
pub use serial::{SerialParams, SerialTransport};
pub use tcp::TcpTransport;
pub use traits::{Transport, TransportError, TransportStats};
