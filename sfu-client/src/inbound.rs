//! Inbound transport registry
//!
//! One receive transport per remote producer. Each subscription runs
//! create transport → connect → consume → resume strictly in order; separate
//! producers negotiate independently and may finish in any order.
//!
//! A `producerClosed` can land while a subscription is still negotiating.
//! Every subscription claims its slot before the first round-trip, so cleanup
//! always finds it; the negotiating task notices the slot is gone (or its
//! token cancelled) at its next step and closes what it built instead of
//! activating it.
//!
//! Two producers of one publisher and kind compete for the same registry
//! slot. The subscription that started later keeps it, whichever finishes
//! first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::CapabilityNegotiator;
use crate::consumers::{ConsumerEntry, ConsumerRegistry, Placement};
use crate::device::{Consumer, MediaDevice, RecvTransport, TransportListener};
use crate::error::{Error, NegotiationStage, Result};
use crate::signaling::RelaySignaling;
use crate::state::SessionEvent;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, Role, TransportId};

/// Forwards a receive transport's DTLS parameters together with the
/// relay-side transport id
struct InboundConnectListener {
    signaling: RelaySignaling,
    server_transport_id: TransportId,
}

#[async_trait]
impl TransportListener for InboundConnectListener {
    async fn on_connect(&self, dtls_parameters: Value) -> Result<()> {
        debug!(server_transport_id = %self.server_transport_id, "Connecting receive transport");
        self.signaling
            .connect_transport(dtls_parameters, Some(self.server_transport_id.clone()))
            .await
    }
}

/// Registry slot for one remote producer
struct InboundSlot {
    attempt: u64,
    cancel: CancellationToken,
    server_transport_id: Option<TransportId>,
    transport: Option<Arc<dyn RecvTransport>>,
    consumer: Option<Arc<dyn Consumer>>,
    publisher: Option<(PeerId, Role, MediaKind)>,
    created_at: DateTime<Utc>,
}

impl InboundSlot {
    fn claim(attempt: u64, cancel: CancellationToken) -> Self {
        Self {
            attempt,
            cancel,
            server_transport_id: None,
            transport: None,
            consumer: None,
            publisher: None,
            created_at: Utc::now(),
        }
    }

    /// Close consumer then transport
    fn close(&self) {
        self.cancel.cancel();
        if let Some(consumer) = &self.consumer {
            consumer.close();
        }
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }
}

/// Read-only view of one inbound session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSession {
    pub remote_producer_id: ProducerId,
    /// `None` while the transport is still being created
    pub server_transport_id: Option<TransportId>,
    pub consumer_id: Option<ConsumerId>,
    pub publisher_id: Option<PeerId>,
    pub role: Option<Role>,
    pub kind: Option<MediaKind>,
    pub created_at: DateTime<Utc>,
}

impl InboundSession {
    /// Whether the consumer has been created and registered
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.consumer_id.is_some()
    }

    fn from_slot(producer_id: &ProducerId, slot: &InboundSlot) -> Self {
        Self {
            remote_producer_id: producer_id.clone(),
            server_transport_id: slot.server_transport_id.clone(),
            consumer_id: slot.consumer.as_ref().map(|c| c.id().clone()),
            publisher_id: slot.publisher.as_ref().map(|(peer, _, _)| peer.clone()),
            role: slot.publisher.as_ref().map(|(_, role, _)| *role),
            kind: slot.publisher.as_ref().map(|(_, _, kind)| *kind),
            created_at: slot.created_at,
        }
    }
}

pub struct InboundRegistry {
    signaling: RelaySignaling,
    device: Arc<dyn MediaDevice>,
    negotiator: Arc<CapabilityNegotiator>,
    consumers: Arc<ConsumerRegistry>,
    sessions: DashMap<ProducerId, InboundSlot>,
    attempts: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    /// Parent of every slot token; cancelled once by `close_all`
    shutdown: CancellationToken,
}

impl InboundRegistry {
    pub fn new(
        signaling: RelaySignaling,
        device: Arc<dyn MediaDevice>,
        negotiator: Arc<CapabilityNegotiator>,
        consumers: Arc<ConsumerRegistry>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            signaling,
            device,
            negotiator,
            consumers,
            sessions: DashMap::new(),
            attempts: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribe to one remote producer.
    ///
    /// Returns `Ok(None)` when the producer already has an inbound session.
    /// A failure only affects this producer; it is logged, published as
    /// [`SessionEvent::SubscriptionFailed`] and returned.
    pub async fn subscribe(&self, producer_id: ProducerId) -> Result<Option<InboundSession>> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = match self.sessions.entry(producer_id.clone()) {
            Entry::Occupied(_) => {
                debug!(producer_id = %producer_id, "Already subscribed to producer");
                return Ok(None);
            }
            Entry::Vacant(vacant) => {
                // born cancelled once the registry has shut down
                let slot = InboundSlot::claim(attempt, self.shutdown.child_token());
                let cancel = slot.cancel.clone();
                vacant.insert(slot);
                cancel
            }
        };

        match self.negotiate(&producer_id, attempt, &cancel).await {
            Ok(session) => {
                info!(
                    producer_id = %producer_id,
                    publisher_id = ?session.publisher_id,
                    kind = ?session.kind,
                    "Subscribed to remote producer"
                );
                Ok(Some(session))
            }
            Err(e) => {
                // a failure after the producer closed is just the closure
                let e = if cancel.is_cancelled() {
                    Error::Cancelled(producer_id.clone())
                } else {
                    e
                };
                if let Some((_, slot)) = self
                    .sessions
                    .remove_if(&producer_id, |_, slot| slot.attempt == attempt)
                {
                    slot.close();
                }
                if matches!(e, Error::Cancelled(_)) {
                    debug!(producer_id = %producer_id, "Subscription cancelled");
                } else {
                    warn!(producer_id = %producer_id, error = %e, "Subscription failed");
                    let _ = self.events.send(SessionEvent::SubscriptionFailed {
                        producer_id: producer_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        producer_id: &ProducerId,
        attempt: u64,
        cancel: &CancellationToken,
    ) -> Result<InboundSession> {
        self.ensure_live(producer_id, cancel)?;
        let capabilities = self.negotiator.local()?;

        let descriptor = self.signaling.create_transport(true).await?;
        let server_transport_id = descriptor.id.clone();
        self.ensure_live(producer_id, cancel)?;

        let listener = Arc::new(InboundConnectListener {
            signaling: self.signaling.clone(),
            server_transport_id: server_transport_id.clone(),
        });
        let transport = self
            .device
            .create_recv_transport(descriptor, listener)
            .map_err(|e| e.at_stage(NegotiationStage::CreateTransport))?;

        // hand the transport to the slot so a concurrent cleanup closes it
        {
            let Some(mut slot) = self.live_slot(producer_id, attempt, cancel) else {
                transport.close();
                return Err(Error::Cancelled(producer_id.clone()));
            };
            slot.server_transport_id = Some(server_transport_id.clone());
            slot.transport = Some(Arc::clone(&transport));
        }

        let grant = self
            .signaling
            .consume(&capabilities, producer_id, &server_transport_id)
            .await?;
        self.ensure_live(producer_id, cancel)?;

        let consumer = transport
            .consume(grant.parameters.clone())
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Consume))?;

        let entry = ConsumerEntry {
            peer_id: grant.publisher_id.clone(),
            kind: consumer.kind(),
            producer_id: producer_id.clone(),
            track: consumer.track(),
            consumer: Arc::clone(&consumer),
            sequence: attempt,
            created_at: Utc::now(),
        };

        // activation and registration happen under the slot lock so cleanup
        // either sees the entry or the subscription sees the slot gone
        let (session, displaced) = {
            let Some(mut slot) = self.live_slot(producer_id, attempt, cancel) else {
                consumer.close();
                return Err(Error::Cancelled(producer_id.clone()));
            };
            let displaced = match self.consumers.insert(entry.clone(), grant.role) {
                Placement::Stored(displaced) => displaced,
                Placement::Superseded(_) => {
                    drop(slot);
                    debug!(
                        peer_id = %entry.peer_id,
                        kind = %entry.kind,
                        producer_id = %producer_id,
                        "A later producer already holds this slot"
                    );
                    consumer.close();
                    return Err(Error::Cancelled(producer_id.clone()));
                }
            };
            slot.consumer = Some(Arc::clone(&consumer));
            slot.publisher = Some((grant.publisher_id.clone(), grant.role, entry.kind));
            (InboundSession::from_slot(producer_id, &slot), displaced)
        };

        let _ = self.events.send(SessionEvent::ConsumerAdded {
            peer_id: entry.peer_id.clone(),
            kind: entry.kind,
            producer_id: producer_id.clone(),
            admin: grant.role.is_admin(),
        });

        if let Some(old) = displaced {
            if &old.producer_id != producer_id {
                debug!(
                    peer_id = %old.peer_id,
                    kind = %old.kind,
                    old_producer_id = %old.producer_id,
                    "Replacing consumer from superseded producer"
                );
                old.consumer.close();
                self.cleanup(&old.producer_id);
            }
        }

        if let Err(e) = self.signaling.resume_consumer(consumer.id()).await {
            warn!(producer_id = %producer_id, error = %e, "Failed to resume consumer");
        }

        Ok(session)
    }

    fn ensure_live(&self, producer_id: &ProducerId, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(Error::Cancelled(producer_id.clone()))
        } else {
            Ok(())
        }
    }

    fn live_slot(
        &self,
        producer_id: &ProducerId,
        attempt: u64,
        cancel: &CancellationToken,
    ) -> Option<dashmap::mapref::one::RefMut<'_, ProducerId, InboundSlot>> {
        if cancel.is_cancelled() {
            return None;
        }
        self.sessions
            .get_mut(producer_id)
            .filter(|slot| slot.attempt == attempt)
    }

    /// Tear down the inbound session for `producer_id`.
    ///
    /// Registry entries are removed before the consumer and transport are
    /// closed. Returns `false` when there was nothing to clean up.
    pub fn cleanup(&self, producer_id: &ProducerId) -> bool {
        let Some((_, slot)) = self.sessions.remove(producer_id) else {
            debug!(producer_id = %producer_id, "No inbound session to clean up");
            return false;
        };

        slot.cancel.cancel();
        for entry in self.consumers.remove_producer(producer_id) {
            let _ = self.events.send(SessionEvent::ConsumerRemoved {
                peer_id: entry.peer_id.clone(),
                kind: entry.kind,
                producer_id: producer_id.clone(),
                admin: slot
                    .publisher
                    .as_ref()
                    .is_some_and(|(_, role, _)| role.is_admin()),
            });
        }
        slot.close();

        info!(producer_id = %producer_id, "Closed inbound session");
        true
    }

    /// Tear down every inbound session. Subscriptions started afterwards are
    /// cancelled before they register anything.
    pub fn close_all(&self) {
        self.shutdown.cancel();
        let producer_ids: Vec<ProducerId> =
            self.sessions.iter().map(|slot| slot.key().clone()).collect();
        for producer_id in &producer_ids {
            self.cleanup(producer_id);
        }
        // entries whose slot was already gone
        for entry in self.consumers.drain() {
            entry.consumer.close();
        }
    }

    #[must_use]
    pub fn get(&self, producer_id: &ProducerId) -> Option<InboundSession> {
        self.sessions
            .get(producer_id)
            .map(|slot| InboundSession::from_slot(producer_id, &slot))
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<InboundSession> {
        self.sessions
            .iter()
            .map(|slot| InboundSession::from_slot(slot.key(), slot.value()))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, producer_id: &ProducerId) -> bool {
        self.sessions.contains_key(producer_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
