//! In-memory relay, device and capture doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, OnceCell};

use sfu_client::device::{
    Consumer, ConsumerParameters, LocalCapabilities, LocalCapture, MediaCapture, MediaDevice,
    MediaTrack, ProduceRequest, Producer, RecvTransport, RelayCapabilities, SendTransport,
    TransportDescriptor, TransportListener,
};
use sfu_client::{
    ConsumerId, Error, MediaKind, Notification, PeerId, ProducerId, Result, Role,
    SessionConfig, SfuSession, SignalingChannel, Sleeper, TransportId,
};

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RemoteProducer {
    peer_id: PeerId,
    role: Role,
    kind: MediaKind,
}

/// Pauses a relay request until released
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
struct RelayState {
    producers: HashMap<ProducerId, RemoteProducer>,
    existing: Vec<ProducerId>,
    failing: HashMap<ProducerId, String>,
    consume_gates: HashMap<ProducerId, Arc<Gate>>,
    produce_gates: HashMap<String, Arc<Gate>>,
    on_join: Vec<Notification>,
    calls: Vec<(String, Value)>,
    emits: Vec<(String, Value)>,
    next_transport: usize,
    next_consumer: usize,
}

/// Scripted relay speaking the signaling protocol over an in-memory channel
pub struct FakeRelay {
    state: Mutex<RelayState>,
    notifications: Mutex<Option<broadcast::Sender<Notification>>>,
    produced: AtomicUsize,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(RelayState::default()),
            notifications: Mutex::new(Some(tx)),
            produced: AtomicUsize::new(0),
        })
    }

    /// A producer already live when the session joins
    pub fn add_existing(&self, producer_id: &str, peer_id: &str, role: Role, kind: MediaKind) {
        let mut state = self.state.lock();
        state.producers.insert(
            ProducerId::from(producer_id),
            RemoteProducer {
                peer_id: PeerId::from(peer_id),
                role,
                kind,
            },
        );
        state.existing.push(ProducerId::from(producer_id));
    }

    /// Register a producer without listing it as existing
    pub fn register(&self, producer_id: &str, peer_id: &str, role: Role, kind: MediaKind) {
        self.state.lock().producers.insert(
            ProducerId::from(producer_id),
            RemoteProducer {
                peer_id: PeerId::from(peer_id),
                role,
                kind,
            },
        );
    }

    /// Register a producer and push `newProducer` for it
    pub fn announce(&self, producer_id: &str, peer_id: &str, role: Role, kind: MediaKind) {
        self.register(producer_id, peer_id, role, kind);
        self.push("newProducer", json!({ "producerId": producer_id }));
    }

    pub fn close_producer(&self, producer_id: &str) {
        self.state.lock().producers.remove(&ProducerId::from(producer_id));
        self.push("producerClosed", json!({ "remoteProducerId": producer_id }));
    }

    /// Answer consume requests for `producer_id` with an error
    pub fn fail_consume(&self, producer_id: &str, reason: &str) {
        self.state
            .lock()
            .failing
            .insert(ProducerId::from(producer_id), reason.to_string());
    }

    pub fn hold_consume(&self, producer_id: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state
            .lock()
            .consume_gates
            .insert(ProducerId::from(producer_id), Arc::clone(&gate));
        gate
    }

    /// Hold `produce` requests for `kind` ("audio" or "video")
    pub fn hold_produce(&self, kind: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state
            .lock()
            .produce_gates
            .insert(kind.to_string(), Arc::clone(&gate));
        gate
    }

    /// Notification pushed while the join request is being answered
    pub fn push_on_join(&self, method: &str, data: Value) {
        self.state.lock().on_join.push(Notification::new(method, data));
    }

    pub fn push(&self, method: &str, data: Value) {
        if let Some(tx) = self.notifications.lock().as_ref() {
            let _ = tx.send(Notification::new(method, data));
        }
    }

    /// Drop the connection; subscribers observe `Closed`
    pub fn disconnect(&self) {
        self.notifications.lock().take();
    }

    pub fn produce_count(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn consume_requests_for(&self, producer_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(m, data)| m == "consume" && data["remoteProducerId"] == producer_id)
            .count()
    }

    pub fn emits(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .emits
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn transport_params(&self) -> Value {
        let mut state = self.state.lock();
        state.next_transport += 1;
        json!({
            "transportParams": {
                "id": format!("server-transport-{}", state.next_transport),
                "iceParameters": { "usernameFragment": "frag", "password": "pass" },
                "iceCandidates": [],
                "dtlsParameters": { "role": "auto", "fingerprints": [] }
            }
        })
    }

    async fn answer_consume(&self, data: &Value) -> Result<Value> {
        let producer_id = ProducerId::from(data["remoteProducerId"].as_str().unwrap_or_default());

        let gate = self.state.lock().consume_gates.get(&producer_id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.failing.get(&producer_id) {
            return Ok(json!({ "error": reason }));
        }
        let Some(producer) = state.producers.get(&producer_id).cloned() else {
            return Ok(json!({ "error": "producer not found" }));
        };
        state.next_consumer += 1;
        Ok(json!({
            "consumerParams": {
                "id": format!("server-consumer-{}", state.next_consumer),
                "producerId": producer_id,
                "kind": producer.kind,
                "rtpParameters": { "codecs": [] }
            },
            "publisherId": producer.peer_id,
            "role": producer.role
        }))
    }
}

#[async_trait]
impl SignalingChannel for FakeRelay {
    async fn emit(&self, method: &str, data: Value) -> Result<()> {
        if self.notifications.lock().is_none() {
            return Err(Error::ChannelClosed);
        }
        self.state.lock().emits.push((method.to_string(), data));
        Ok(())
    }

    async fn call(&self, method: &str, data: Value) -> Result<Value> {
        if self.notifications.lock().is_none() {
            return Err(Error::ChannelClosed);
        }
        self.state
            .lock()
            .calls
            .push((method.to_string(), data.clone()));

        match method {
            "join" => {
                let pushed = std::mem::take(&mut self.state.lock().on_join);
                if !pushed.is_empty() {
                    for notification in pushed {
                        self.push(&notification.method, notification.data);
                    }
                    // let the session's event loop observe them mid-setup
                    for _ in 0..8 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok(json!({ "relayCapabilities": { "codecs": ["opus", "VP8"] } }))
            }
            "createTransport" => Ok(self.transport_params()),
            "produce" => {
                let kind = data["kind"].as_str().unwrap_or("unknown");
                let gate = self.state.lock().produce_gates.get(kind).cloned();
                if let Some(gate) = gate {
                    gate.pass().await;
                }
                let n = self.produced.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "producerId": format!("local-{kind}-{n}") }))
            }
            "producersExist" => Ok(json!({ "exists": !self.state.lock().existing.is_empty() })),
            "getExistingProducers" => {
                Ok(json!({ "producerIds": self.state.lock().existing.clone() }))
            }
            "consume" => self.answer_consume(&data).await,
            other => Err(Error::Signaling(format!("unknown method {other}"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        match self.notifications.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Camera/microphone that refuses the first `failures` requests
pub struct FakeCapture {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self) -> Result<LocalCapture> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Capture("permission denied".to_string()));
        }

        let audio = FakeTrack::new(format!("mic-{attempt}"), MediaKind::Audio);
        let video = FakeTrack::new(format!("cam-{attempt}"), MediaKind::Video);
        self.tracks.lock().extend([Arc::clone(&audio), Arc::clone(&video)]);
        Ok(LocalCapture {
            audio: Some(audio),
            video: Some(video),
        })
    }
}

#[derive(Debug)]
pub struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: AtomicBool,
}

impl FakeProducer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Producer for FakeProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    track: Arc<FakeTrack>,
    closed: AtomicBool,
}

impl FakeConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Consumer for FakeConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
    }
}

pub struct FakeSendTransport {
    id: TransportId,
    listener: Arc<dyn TransportListener>,
    connected: OnceCell<()>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    closed: AtomicBool,
}

impl FakeSendTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }
}

#[async_trait]
impl SendTransport for FakeSendTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        app_data: Value,
    ) -> Result<Arc<dyn Producer>> {
        self.connected
            .get_or_try_init(|| self.listener.on_connect(json!({ "role": "client" })))
            .await?;
        let id = self
            .listener
            .on_produce(ProduceRequest {
                kind: track.kind(),
                rtp_parameters: json!({ "mid": track.id() }),
                app_data,
            })
            .await?;
        let producer = Arc::new(FakeProducer {
            id,
            kind: track.kind(),
            closed: AtomicBool::new(false),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeRecvTransport {
    id: TransportId,
    listener: Arc<dyn TransportListener>,
    connected: OnceCell<()>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    closed: AtomicBool,
}

impl FakeRecvTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }
}

#[async_trait]
impl RecvTransport for FakeRecvTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn consume(&self, parameters: ConsumerParameters) -> Result<Arc<dyn Consumer>> {
        self.connected
            .get_or_try_init(|| self.listener.on_connect(json!({ "role": "client" })))
            .await?;
        let consumer = Arc::new(FakeConsumer {
            track: FakeTrack::new(format!("remote-{}", parameters.producer_id), parameters.kind),
            id: parameters.id,
            producer_id: parameters.producer_id,
            kind: parameters.kind,
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Device double recording every transport it builds
#[derive(Default)]
pub struct FakeDevice {
    reject_capabilities: bool,
    loads: AtomicUsize,
    send_transports: Mutex<Vec<Arc<FakeSendTransport>>>,
    recv_transports: Mutex<Vec<Arc<FakeRecvTransport>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device that cannot handle the relay's capabilities
    pub fn incompatible() -> Arc<Self> {
        Arc::new(Self {
            reject_capabilities: true,
            ..Self::default()
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn send_transports(&self) -> Vec<Arc<FakeSendTransport>> {
        self.send_transports.lock().clone()
    }

    pub fn recv_transports(&self) -> Vec<Arc<FakeRecvTransport>> {
        self.recv_transports.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.recv_transports()
            .iter()
            .flat_map(|transport| transport.consumers())
            .collect()
    }

    pub fn consumers_for(&self, producer_id: &str) -> Vec<Arc<FakeConsumer>> {
        self.consumers()
            .into_iter()
            .filter(|consumer| consumer.producer_id.as_str() == producer_id)
            .collect()
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
    async fn load(&self, capabilities: &RelayCapabilities) -> Result<LocalCapabilities> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.reject_capabilities {
            return Err(Error::Device("no common codec".to_string()));
        }
        Ok(LocalCapabilities(json!({ "codecs": capabilities.0["codecs"] })))
    }

    fn create_send_transport(
        &self,
        descriptor: TransportDescriptor,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(FakeSendTransport {
            id: descriptor.id,
            listener,
            connected: OnceCell::new(),
            producers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.send_transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn create_recv_transport(
        &self,
        descriptor: TransportDescriptor,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn RecvTransport>> {
        let transport = Arc::new(FakeRecvTransport {
            id: descriptor.id,
            listener,
            connected: OnceCell::new(),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.recv_transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Records requested pauses and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.pauses.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub relay: Arc<FakeRelay>,
    pub device: Arc<FakeDevice>,
    pub capture: Arc<FakeCapture>,
    pub sleeper: Arc<RecordingSleeper>,
    pub session: Arc<SfuSession>,
}

impl Harness {
    pub fn new(role: Role) -> Self {
        Self::with(FakeRelay::new(), FakeDevice::new(), FakeCapture::new(), role)
    }

    pub fn with(
        relay: Arc<FakeRelay>,
        device: Arc<FakeDevice>,
        capture: Arc<FakeCapture>,
        role: Role,
    ) -> Self {
        let sleeper = Arc::new(RecordingSleeper::default());
        let config = SessionConfig::new("room-1", "alice", role);
        let session = Arc::new(
            SfuSession::new(
                config,
                relay.clone(),
                device.clone(),
                capture.clone(),
            )
            .with_sleeper(sleeper.clone()),
        );
        Self {
            relay,
            device,
            capture,
            sleeper,
            session,
        }
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within two seconds");
}

/// Give the event loop a moment to process anything already pushed
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
