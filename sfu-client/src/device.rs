//! Seams to the local media stack
//!
//! The client never touches ICE, DTLS or RTP itself. A platform device library
//! turns relay descriptors into transports and tracks into producers/consumers;
//! this module describes that library as traits so the orchestrator can drive
//! any implementation (native WebRTC stack, test double, ...).
//!
//! Transports report their own negotiation needs through a
//! [`TransportListener`]: `on_connect` fires once before the first media
//! flows, `on_produce` fires for every `produce` on a send transport. An
//! implementation must await the listener before completing the operation that
//! triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// Opaque capability descriptor published by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayCapabilities(pub Value);

/// Receive/send capabilities derived by the device from the relay's
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalCapabilities(pub Value);

/// Everything needed to construct one local transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Parameters the relay returns for a new consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParameters {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// A produce request raised by a send transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// A captured or received media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Release the underlying source. Must be idempotent.
    fn stop(&self);
}

/// Locally captured tracks for one session
#[derive(Debug, Clone, Default)]
pub struct LocalCapture {
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

impl LocalCapture {
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn MediaTrack>> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn stop(&self) {
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
    }
}

/// Platform access to camera and microphone
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Request an audio + video pair. Fails with [`Error::Capture`] when the
    /// devices are missing or permission is denied.
    async fn acquire(&self) -> Result<LocalCapture>;
}

/// Negotiation hooks a transport calls back into
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Forward local DTLS parameters to the relay
    async fn on_connect(&self, dtls_parameters: Value) -> Result<()>;

    /// Forward a produce request to the relay and return its producer id
    async fn on_produce(&self, request: ProduceRequest) -> Result<ProducerId> {
        let _ = request;
        Err(Error::Device(
            "produce is not supported on a receive transport".to_string(),
        ))
    }
}

pub trait Producer: Send + Sync + fmt::Debug {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    /// Must be idempotent.
    fn close(&self);
}

pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn MediaTrack>;
    /// Must be idempotent.
    fn close(&self);
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Publish `track`, invoking the listener's `on_connect` (first use only)
    /// and `on_produce` before returning.
    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        app_data: Value,
    ) -> Result<Arc<dyn Producer>>;

    fn close(&self);
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Create a local consumer, invoking the listener's `on_connect` on first
    /// use before returning.
    async fn consume(&self, parameters: ConsumerParameters) -> Result<Arc<dyn Consumer>>;

    /// Close the transport and everything flowing over it. Must be idempotent.
    fn close(&self);
}

/// The platform device: capability loading and transport factory
#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn load(&self, capabilities: &RelayCapabilities) -> Result<LocalCapabilities>;

    fn create_send_transport(
        &self,
        descriptor: TransportDescriptor,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>>;

    fn create_recv_transport(
        &self,
        descriptor: TransportDescriptor,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn RecvTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingTrack {
        kind: MediaKind,
        stops: AtomicUsize,
    }

    impl MediaTrack for CountingTrack {
        fn id(&self) -> &str {
            "t"
        }
        fn kind(&self) -> MediaKind {
            self.kind
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_local_capture_stops_every_track() {
        let audio = Arc::new(CountingTrack {
            kind: MediaKind::Audio,
            stops: AtomicUsize::new(0),
        });
        let video = Arc::new(CountingTrack {
            kind: MediaKind::Video,
            stops: AtomicUsize::new(0),
        });
        let capture = LocalCapture {
            audio: Some(audio.clone()),
            video: Some(video.clone()),
        };

        assert_eq!(capture.track(MediaKind::Video).unwrap().kind(), MediaKind::Video);
        capture.stop();
        assert_eq!(audio.stops.load(Ordering::SeqCst), 1);
        assert_eq!(video.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = serde_json::json!({
            "id": "t-1",
            "iceParameters": {"usernameFragment": "u", "password": "p"},
            "iceCandidates": [],
            "dtlsParameters": {"role": "auto", "fingerprints": []}
        });
        let descriptor: TransportDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(descriptor.id, TransportId::from("t-1"));
        assert_eq!(descriptor.dtls_parameters["role"], "auto");
    }
}
