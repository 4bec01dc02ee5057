//! Session orchestrator
//!
//! Drives one participant through capture → join → capability load →
//! publish → subscribe, then keeps the inbound side in step with the relay's
//! `newProducer` / `producerClosed` notifications until the session closes.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::capability::CapabilityNegotiator;
use crate::config::SessionConfig;
use crate::consumers::ConsumerRegistry;
use crate::device::{LocalCapture, MediaCapture, MediaDevice};
use crate::error::{Error, Result};
use crate::inbound::InboundRegistry;
use crate::outbound::{DuplicateUserFlag, OutboundSession};
use crate::retry::{retry, RetryPolicy, Sleeper, TokioSleeper};
use crate::signaling::{Notification, RelayEvent, RelaySignaling, SignalingChannel};
use crate::state::{SessionEvent, SessionState, SessionStats};
use crate::types::{MediaKind, ProducerId, SessionId};

/// Producers announced before capabilities were loaded
#[derive(Default)]
struct PendingProducers {
    drained: bool,
    ids: Vec<ProducerId>,
}

/// One participant's media session with the relay
pub struct SfuSession {
    id: SessionId,
    config: SessionConfig,
    signaling: RelaySignaling,
    device: Arc<dyn MediaDevice>,
    capture: Arc<dyn MediaCapture>,
    sleeper: Arc<dyn Sleeper>,
    negotiator: Arc<CapabilityNegotiator>,
    consumers: Arc<ConsumerRegistry>,
    inbound: Arc<InboundRegistry>,
    outbound: RwLock<Option<Arc<OutboundSession>>>,
    local_capture: Mutex<Option<LocalCapture>>,
    duplicate: Arc<DuplicateUserFlag>,
    pending: Mutex<PendingProducers>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    opened: AtomicBool,
    cancel: CancellationToken,
}

impl SfuSession {
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        device: Arc<dyn MediaDevice>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        let signaling = RelaySignaling::new(channel);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (state, _) = watch::channel(SessionState::Idle);
        let negotiator = Arc::new(CapabilityNegotiator::new(Arc::clone(&device)));
        let consumers = Arc::new(ConsumerRegistry::new());
        let inbound = Arc::new(InboundRegistry::new(
            signaling.clone(),
            Arc::clone(&device),
            Arc::clone(&negotiator),
            Arc::clone(&consumers),
            events.clone(),
        ));

        Self {
            id: SessionId::new(),
            config,
            signaling,
            device,
            capture,
            sleeper: Arc::new(TokioSleeper),
            negotiator,
            consumers,
            inbound,
            outbound: RwLock::new(None),
            local_capture: Mutex::new(None),
            duplicate: Arc::new(DuplicateUserFlag::new()),
            pending: Mutex::new(PendingProducers::default()),
            state,
            events,
            opened: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the timer used between capture attempts
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run the session up to `Active`.
    ///
    /// Relay notifications are handled from the moment this is called. On
    /// error the session ends in `Failed` with its resources released.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("session already opened".to_string()));
        }

        let span = tracing::info_span!(
            "sfu_session",
            session_id = %self.id,
            room_id = %self.config.room_id,
            user_id = %self.config.user_id,
        );

        // subscribe before joining so nothing pushed during setup is missed
        let notifications = self.signaling.subscribe();
        tokio::spawn(
            Self::event_loop(Arc::downgrade(self), notifications, self.cancel.clone())
                .instrument(span.clone()),
        );

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(closed_during_setup()),
            result = self.establish().instrument(span) => result,
        };

        match result {
            Ok(()) => {
                info!(
                    session_id = %self.id,
                    inbound_sessions = self.inbound.len(),
                    attendee_peers = self.consumers.peer_count(),
                    "Session active"
                );
                Ok(())
            }
            Err(e) => {
                if self.state().is_terminal() {
                    return Err(e);
                }
                error!(session_id = %self.id, error = %e, "Session setup failed");
                self.release();
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.ensure_open()?;
        self.set_state(SessionState::AcquiringMedia);
        let capture = self.acquire_media().await?;
        {
            // checked under the lock release() takes after cancelling
            let mut local = self.local_capture.lock();
            if self.cancel.is_cancelled() {
                capture.stop();
                return Err(closed_during_setup());
            }
            *local = Some(capture.clone());
        }

        self.set_state(SessionState::Joining);
        let relay_capabilities = self
            .signaling
            .join(&self.config.room_id(), &self.config.peer_id(), self.config.role)
            .await?;
        self.ensure_open()?;

        self.set_state(SessionState::NegotiatingCapabilities);
        self.negotiator.load(relay_capabilities).await?;
        self.ensure_open()?;

        self.set_state(SessionState::Publishing);
        let outbound = OutboundSession::create(
            &self.signaling,
            self.device.as_ref(),
            Arc::clone(&self.duplicate),
            &self.config.peer_id(),
            self.config.role,
        )
        .await?;
        {
            let mut slot = self.outbound.write();
            if self.cancel.is_cancelled() {
                outbound.close();
                return Err(closed_during_setup());
            }
            *slot = Some(Arc::clone(&outbound));
        }
        outbound.publish(&capture).await?;
        self.ensure_open()?;

        self.set_state(SessionState::Subscribing);
        let mut producer_ids = if self.signaling.producers_exist().await? {
            self.signaling.existing_producers().await?
        } else {
            Vec::new()
        };
        self.ensure_open()?;
        {
            let mut pending = self.pending.lock();
            pending.drained = true;
            producer_ids.append(&mut pending.ids);
        }
        self.subscribe_all(producer_ids).await;

        if self.set_state(SessionState::Active) {
            Ok(())
        } else {
            Err(closed_during_setup())
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(closed_during_setup())
        } else {
            Ok(())
        }
    }

    async fn acquire_media(&self) -> Result<LocalCapture> {
        let policy = match self.config.max_capture_attempts {
            0 => RetryPolicy::unbounded(self.config.capture_retry_delay()),
            attempts => RetryPolicy::bounded(self.config.capture_retry_delay(), attempts),
        };
        let capture = Arc::clone(&self.capture);
        retry(policy, self.sleeper.as_ref(), move |attempt| {
            let capture = Arc::clone(&capture);
            async move {
                debug!(attempt, "Acquiring local media");
                capture.acquire().await
            }
        })
        .await
    }

    /// Subscribe to every producer concurrently; failures stay per producer
    async fn subscribe_all(&self, producer_ids: Vec<ProducerId>) {
        let own: Vec<ProducerId> = producer_ids
            .into_iter()
            .filter(|id| !self.is_own_producer(id))
            .collect();
        if own.is_empty() {
            return;
        }
        debug!(count = own.len(), "Subscribing to existing producers");
        let results = join_all(own.into_iter().map(|id| self.inbound.subscribe(id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "Some subscriptions could not be established");
        }
    }

    async fn event_loop(
        session: Weak<Self>,
        mut notifications: broadcast::Receiver<Notification>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = notifications.recv() => received,
            };
            let Some(session) = session.upgrade() else { break };
            match received {
                Ok(notification) => session.handle_notification(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay notifications dropped");
                    let _ = session
                        .events
                        .send(SessionEvent::NotificationsLagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Signaling channel disconnected, closing session");
                    session.close();
                    break;
                }
            }
        }
        debug!("Session event loop stopped");
    }

    fn handle_notification(&self, notification: Notification) {
        let event = match RelayEvent::parse(&notification.method, notification.data) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(method = %notification.method, "Ignoring relay notification");
                return;
            }
            Err(e) => {
                warn!(method = %notification.method, error = %e, "Malformed relay notification");
                return;
            }
        };

        match event {
            RelayEvent::NewProducer { producer_id } => self.on_new_producer(producer_id),
            RelayEvent::ProducerClosed { remote_producer_id } => {
                self.pending
                    .lock()
                    .ids
                    .retain(|id| id != &remote_producer_id);
                self.inbound.cleanup(&remote_producer_id);
            }
            RelayEvent::DuplicateUser { exists } => {
                if exists && self.duplicate.raise() {
                    warn!("Identity already has an active publisher, publishing disabled");
                    let _ = self.events.send(SessionEvent::DuplicatePublisher);
                }
            }
        }
    }

    fn on_new_producer(&self, producer_id: ProducerId) {
        if self.is_own_producer(&producer_id) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            if !pending.drained {
                debug!(producer_id = %producer_id, "Queueing producer until capabilities are loaded");
                pending.ids.push(producer_id);
                return;
            }
        }

        let inbound = Arc::clone(&self.inbound);
        tokio::spawn(
            async move {
                // per-producer failures are logged and published by the registry
                if let Err(e) = inbound.subscribe(producer_id).await {
                    if e.is_session_fatal() {
                        warn!(error = %e, "Subscription hit a relay or device failure");
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn is_own_producer(&self, producer_id: &ProducerId) -> bool {
        self.outbound
            .read()
            .as_ref()
            .is_some_and(|outbound| outbound.owns_producer(producer_id))
    }

    /// Move to `state`; returns whether the state changed. `Failed` and
    /// `Closed` are never left.
    fn set_state(&self, state: SessionState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            previous = Some(std::mem::replace(current, state));
            true
        });
        let Some(previous) = previous else {
            return false;
        };
        info!(from = %previous, to = %state, "Session state changed");
        let _ = self.events.send(SessionEvent::StateChanged(state));
        true
    }

    /// Stop the event loop and release every transport, producer, consumer
    /// and captured track.
    fn release(&self) {
        self.cancel.cancel();
        self.inbound.close_all();
        if let Some(outbound) = self.outbound.write().take() {
            outbound.close();
        }
        if let Some(capture) = self.local_capture.lock().take() {
            capture.stop();
        }
    }

    /// Tear the session down. Safe to call more than once; a failed
    /// session stays `Failed`.
    pub fn close(&self) {
        self.release();
        if self.set_state(SessionState::Closed) {
            info!(session_id = %self.id, "Session closed");
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Receive consumer and state events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    #[must_use]
    pub fn inbound(&self) -> &InboundRegistry {
        &self.inbound
    }

    #[must_use]
    pub fn outbound(&self) -> Option<Arc<OutboundSession>> {
        self.outbound.read().clone()
    }

    #[must_use]
    pub fn local_capture(&self) -> Option<LocalCapture> {
        self.local_capture.lock().clone()
    }

    #[must_use]
    pub fn is_duplicate_publisher(&self) -> bool {
        self.duplicate.is_raised()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let admin = self.consumers.admin();
        SessionStats {
            state: self.state(),
            producers: self.outbound().map_or(0, |o| o.producer_count()),
            inbound_sessions: self.inbound.len(),
            attendee_peers: self.consumers.peer_count(),
            consumers: self.consumers.len(),
            admin_audio: admin.get(MediaKind::Audio).is_some(),
            admin_video: admin.get(MediaKind::Video).is_some(),
            duplicate_publisher: self.duplicate.is_raised(),
        }
    }
}

impl Drop for SfuSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn closed_during_setup() -> Error {
    Error::InvalidState("session closed during setup".to_string())
}
