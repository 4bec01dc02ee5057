//! Capability negotiation
//!
//! The relay publishes its media capabilities once per session (in the join
//! acknowledgement). The device is loaded with them exactly once; everything
//! that creates a transport or a consumer reads the derived local set from
//! here.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::device::{LocalCapabilities, MediaDevice, RelayCapabilities};
use crate::error::{Error, NegotiationStage, Result};

pub struct CapabilityNegotiator {
    device: Arc<dyn MediaDevice>,
    loaded: OnceCell<(RelayCapabilities, LocalCapabilities)>,
}

impl CapabilityNegotiator {
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        Self {
            device,
            loaded: OnceCell::new(),
        }
    }

    /// Load the device with the relay's capabilities.
    ///
    /// Subsequent calls return the capabilities from the first successful
    /// load without touching the device again. Failures are not retried.
    pub async fn load(&self, relay: RelayCapabilities) -> Result<LocalCapabilities> {
        let (_, local) = self
            .loaded
            .get_or_try_init(|| async move {
                match self.device.load(&relay).await {
                    Ok(local) => {
                        info!("Device loaded with relay capabilities");
                        Ok((relay, local))
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to load relay capabilities");
                        Err(e.at_stage(NegotiationStage::LoadCapabilities))
                    }
                }
            })
            .await?;
        Ok(local.clone())
    }

    /// Local capabilities, once loaded
    pub fn local(&self) -> Result<LocalCapabilities> {
        self.loaded
            .get()
            .map(|(_, local)| local.clone())
            .ok_or_else(|| Error::InvalidState("capabilities have not been loaded".to_string()))
    }

    #[must_use]
    pub fn relay(&self) -> Option<&RelayCapabilities> {
        self.loaded.get().map(|(relay, _)| relay)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }
}
