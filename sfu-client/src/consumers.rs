//! Consumer registry
//!
//! Holds the audio/video consumers received from every remote publisher.
//! Publishers the relay marks as admin share one distinguished slot (merged
//! per kind); everyone else is keyed by peer id. At most one entry exists per
//! (publisher, kind).
//!
//! Only the inbound registry mutates this structure. Readers get cloned
//! snapshots since entries can disappear between two reads.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::device::{Consumer, MediaTrack};
use crate::types::{MediaKind, PeerId, ProducerId, Role};

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub producer_id: ProducerId,
    pub consumer: Arc<dyn Consumer>,
    pub track: Arc<dyn MediaTrack>,
    /// Arrival order of the subscription that produced this entry
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of storing an entry
#[derive(Debug)]
pub(crate) enum Placement {
    /// Stored, with whatever previously held the slot
    Stored(Option<ConsumerEntry>),
    /// The slot holds a later subscription; the entry was not stored
    Superseded(ConsumerEntry),
}

/// The audio/video pair received from one publisher (or the admin slot)
#[derive(Debug, Clone, Default)]
pub struct PeerMedia {
    pub audio: Option<ConsumerEntry>,
    pub video: Option<ConsumerEntry>,
}

impl PeerMedia {
    #[must_use]
    pub const fn get(&self, kind: MediaKind) -> Option<&ConsumerEntry> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<ConsumerEntry> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    /// Later subscriptions win the slot regardless of completion order
    fn place(&mut self, entry: ConsumerEntry) -> Placement {
        let slot = self.slot_mut(entry.kind);
        if slot
            .as_ref()
            .is_some_and(|current| current.sequence > entry.sequence)
        {
            return Placement::Superseded(entry);
        }
        Placement::Stored(slot.replace(entry))
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.audio.iter().chain(self.video.iter())
    }

    fn take_producer(&mut self, producer_id: &ProducerId) -> Vec<ConsumerEntry> {
        let mut removed = Vec::new();
        for slot in [&mut self.audio, &mut self.video] {
            if slot.as_ref().is_some_and(|e| &e.producer_id == producer_id) {
                removed.extend(slot.take());
            }
        }
        removed
    }
}

#[derive(Default)]
pub struct ConsumerRegistry {
    peers: DashMap<PeerId, PeerMedia>,
    admin: RwLock<PeerMedia>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry` unless its slot already holds a later subscription
    pub(crate) fn insert(&self, entry: ConsumerEntry, role: Role) -> Placement {
        debug!(
            peer_id = %entry.peer_id,
            kind = %entry.kind,
            producer_id = %entry.producer_id,
            admin = role.is_admin(),
            "Registering consumer"
        );
        if role.is_admin() {
            self.admin.write().place(entry)
        } else {
            self.peers
                .entry(entry.peer_id.clone())
                .or_default()
                .place(entry)
        }
    }

    /// Remove every entry fed by `producer_id`
    pub(crate) fn remove_producer(&self, producer_id: &ProducerId) -> Vec<ConsumerEntry> {
        let mut removed = self.admin.write().take_producer(producer_id);

        let mut emptied = Vec::new();
        for mut peer in self.peers.iter_mut() {
            let taken = peer.take_producer(producer_id);
            if !taken.is_empty() {
                if peer.is_empty() {
                    emptied.push(peer.key().clone());
                }
                removed.extend(taken);
            }
        }
        for peer_id in emptied {
            self.peers.remove_if(&peer_id, |_, media| media.is_empty());
        }

        removed
    }

    /// Empty the registry, returning everything it held
    pub(crate) fn drain(&self) -> Vec<ConsumerEntry> {
        let mut removed: Vec<ConsumerEntry> = std::mem::take(&mut *self.admin.write())
            .entries()
            .cloned()
            .collect();
        let peer_ids: Vec<PeerId> = self.peers.iter().map(|p| p.key().clone()).collect();
        for peer_id in peer_ids {
            if let Some((_, media)) = self.peers.remove(&peer_id) {
                removed.extend(media.entries().cloned());
            }
        }
        removed
    }

    /// Snapshot of the admin slot
    #[must_use]
    pub fn admin(&self) -> PeerMedia {
        self.admin.read().clone()
    }

    /// Snapshot of one attendee's media
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerMedia> {
        self.peers.get(peer_id).map(|media| media.clone())
    }

    /// Snapshot of all attendees' media
    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, PeerMedia)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of attendees with at least one consumer
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Total number of consumer entries, admin slot included
    #[must_use]
    pub fn len(&self) -> usize {
        let attendees: usize = self.peers.iter().map(|p| p.entries().count()).sum();
        attendees + self.admin.read().entries().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
