//! Outbound transport manager
//!
//! Owns the single send transport of a session and at most one producer per
//! media kind.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::device::{
    LocalCapture, MediaDevice, MediaTrack, ProduceRequest, Producer, SendTransport,
    TransportListener,
};
use crate::error::{Error, NegotiationStage, Result};
use crate::signaling::RelaySignaling;
use crate::types::{MediaKind, PeerId, ProducerId, Role, TransportId};

/// Raised when the relay reports that this identity already publishes
/// elsewhere. Never cleared for the rest of the session.
#[derive(Debug, Default)]
pub struct DuplicateUserFlag(AtomicBool);

impl DuplicateUserFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag; returns `true` only for the call that raised it
    pub fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Connect and produce hooks of the send transport
struct OutboundListener {
    signaling: RelaySignaling,
    duplicate: Arc<DuplicateUserFlag>,
}

#[async_trait]
impl TransportListener for OutboundListener {
    async fn on_connect(&self, dtls_parameters: Value) -> Result<()> {
        debug!("Connecting send transport");
        self.signaling.connect_transport(dtls_parameters, None).await
    }

    async fn on_produce(&self, request: ProduceRequest) -> Result<ProducerId> {
        if self.duplicate.is_raised() {
            debug!(kind = %request.kind, "Produce suppressed for duplicate user");
            return Err(Error::DuplicatePublisher);
        }
        let kind = request.kind;
        let producer_id = self.signaling.produce(request).await?;
        debug!(kind = %kind, producer_id = %producer_id, "Relay accepted producer");
        Ok(producer_id)
    }
}

pub struct OutboundSession {
    transport: Arc<dyn SendTransport>,
    producers: Mutex<HashMap<MediaKind, Arc<dyn Producer>>>,
    duplicate: Arc<DuplicateUserFlag>,
    app_data: Value,
    closed: AtomicBool,
}

impl OutboundSession {
    /// Create the send transport. Nothing is published yet; see
    /// [`OutboundSession::publish`].
    pub async fn create(
        signaling: &RelaySignaling,
        device: &dyn MediaDevice,
        duplicate: Arc<DuplicateUserFlag>,
        peer_id: &PeerId,
        role: Role,
    ) -> Result<Arc<Self>> {
        let descriptor = signaling.create_transport(false).await?;
        let listener = Arc::new(OutboundListener {
            signaling: signaling.clone(),
            duplicate: Arc::clone(&duplicate),
        });
        let transport = device
            .create_send_transport(descriptor, listener)
            .map_err(|e| e.at_stage(NegotiationStage::CreateTransport))?;

        info!(transport_id = %transport.id(), "Send transport created");

        Ok(Arc::new(Self {
            transport,
            producers: Mutex::new(HashMap::new()),
            duplicate,
            app_data: json!({ "peerId": peer_id, "role": role }),
            closed: AtomicBool::new(false),
        }))
    }

    /// Produce every captured track concurrently.
    ///
    /// Both kinds are requested before either is awaited, and both must
    /// settle before this returns. Nothing is produced once the duplicate-user
    /// flag is up.
    pub async fn publish(&self, capture: &LocalCapture) -> Result<()> {
        if self.duplicate.is_raised() {
            warn!("Identity already publishing elsewhere, skipping publish");
            return Ok(());
        }

        let (audio, video) = tokio::join!(
            self.produce_captured(capture, MediaKind::Audio),
            self.produce_captured(capture, MediaKind::Video),
        );
        audio?;
        video?;
        Ok(())
    }

    async fn produce_captured(&self, capture: &LocalCapture, kind: MediaKind) -> Result<()> {
        let Some(track) = capture.track(kind) else {
            debug!(kind = %kind, "No captured track to publish");
            return Ok(());
        };
        match self.produce(Arc::clone(track)).await {
            Ok(_) => Ok(()),
            Err(_) if self.duplicate.is_raised() => {
                warn!(kind = %kind, "Publish suppressed for duplicate user");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish one track.
    ///
    /// Returns the existing producer's id when this kind is already
    /// published; fails with [`Error::DuplicatePublisher`] without contacting
    /// the relay once the duplicate-user flag is up.
    pub async fn produce(&self, track: Arc<dyn MediaTrack>) -> Result<ProducerId> {
        let kind = track.kind();
        if let Some(existing) = self.producers.lock().get(&kind) {
            return Ok(existing.id().clone());
        }
        if self.duplicate.is_raised() {
            return Err(Error::DuplicatePublisher);
        }
        if self.is_closed() {
            return Err(Error::InvalidState("send transport closed".to_string()));
        }

        let producer = self
            .transport
            .produce(track, self.app_data.clone())
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Produce))?;

        let mut producers = self.producers.lock();
        if self.is_closed() {
            producer.close();
            return Err(Error::InvalidState("send transport closed".to_string()));
        }
        if let Some(existing) = producers.get(&kind) {
            // a concurrent call for the same kind won
            producer.close();
            return Ok(existing.id().clone());
        }
        let producer_id = producer.id().clone();
        producers.insert(kind, producer);
        info!(kind = %kind, producer_id = %producer_id, "Producer created");
        Ok(producer_id)
    }

    #[must_use]
    pub fn transport_id(&self) -> TransportId {
        self.transport.id().clone()
    }

    #[must_use]
    pub fn producer_id(&self, kind: MediaKind) -> Option<ProducerId> {
        self.producers.lock().get(&kind).map(|p| p.id().clone())
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers
            .lock()
            .values()
            .any(|p| p.id() == producer_id)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every producer, then the transport. A produce still in flight
    /// closes its producer when it lands.
    pub fn close(&self) {
        let producers: Vec<_> = {
            let mut producers = self.producers.lock();
            self.closed.store(true, Ordering::SeqCst);
            producers.drain().map(|(_, p)| p).collect()
        };
        for producer in producers {
            producer.close();
        }
        self.transport.close();
        debug!(transport_id = %self.transport.id(), "Send transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_flag_raised_once() {
        let flag = DuplicateUserFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_raised());
    }
}
