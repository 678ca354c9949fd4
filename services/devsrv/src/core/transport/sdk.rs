//! Vendor SDK sessions exposed as transports
//!
//! Some peripherals are only reachable through a vendor library. The core
//! never sees their bytes: the session is opened and closed like any other
//! medium and its driver talks to the SDK directly.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::null::NULL_READ_IDLE;
use super::traits::{LinkState, Transport, TransportError, TransportStats};

/// Opaque vendor session
#[async_trait]
pub trait VendorSession: Send + Sync + fmt::Debug {
    /// Open the session; `parameters` is the descriptor's parameter string
    async fn open(&self, parameters: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Session-side loss detection. The default never fires.
    fn lost(&self) -> Option<CancellationToken> {
        None
    }
}

/// Builds a fresh session for each connection attempt
pub type SessionProvider = Arc<dyn Fn() -> Arc<dyn VendorSession> + Send + Sync>;

/// Transport adapter around a vendor session
#[derive(Debug)]
pub struct SdkTransport {
    key: String,
    parameters: String,
    session: Arc<dyn VendorSession>,
    link: LinkState,
}

impl SdkTransport {
    pub fn new(
        key: impl Into<String>,
        parameters: impl Into<String>,
        session: Arc<dyn VendorSession>,
    ) -> Self {
        Self {
            key: key.into(),
            parameters: parameters.into(),
            session,
            link: LinkState::new(),
        }
    }
}

#[async_trait]
impl Transport for SdkTransport {
    fn transport_type(&self) -> &str {
        "sdk"
    }

    fn name(&self) -> &str {
        &self.key
    }

    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        self.link.check_reusable(&self.key)?;

        if let Err(e) = self.session.open(&self.parameters).await {
            self.link.mark_failed_open();
            return Err(e);
        }
        self.link.mark_open();

        // Forward session-side loss to our own signal
        if let Some(lost) = self.session.lost() {
            let ours = self.link.token();
            let key = self.key.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = lost.cancelled() => {
                        warn!("SDK session {} lost", key);
                        ours.cancel();
                    }
                    _ = ours.cancelled() => {}
                }
            });
        }

        info!("Opened SDK session: {}", self.key);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let was_open = self.link.is_open();
        self.link.mark_lost();
        if was_open {
            self.session.close().await?;
            info!("Closed SDK session: {}", self.key);
        }
        Ok(())
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        tokio::time::sleep(NULL_READ_IDLE).await;
        Ok(0)
    }

    async fn write(&self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        self.link.token()
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn stats(&self) -> TransportStats {
        self.link.stats()
    }
}
