//! Session states, events and statistics

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{MediaKind, PeerId, ProducerId};

/// Orchestrator state
///
/// `Idle → AcquiringMedia → Joining → NegotiatingCapabilities → Publishing →
/// Subscribing → Active`. `Failed` ends a session that could not be set up,
/// `Closed` one that was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    Joining,
    NegotiatingCapabilities,
    Publishing,
    Subscribing,
    Active,
    Failed,
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AcquiringMedia => "acquiring_media",
            Self::Joining => "joining",
            Self::NegotiatingCapabilities => "negotiating_capabilities",
            Self::Publishing => "publishing",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications for the rendering layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ConsumerAdded {
        peer_id: PeerId,
        kind: MediaKind,
        producer_id: ProducerId,
        admin: bool,
    },
    ConsumerRemoved {
        peer_id: PeerId,
        kind: MediaKind,
        producer_id: ProducerId,
        admin: bool,
    },
    SubscriptionFailed {
        producer_id: ProducerId,
        reason: String,
    },
    /// Publishing is suppressed for the rest of the session
    DuplicatePublisher,
    /// Relay notifications were dropped before the session saw them; the
    /// consumer registry may be stale until the application resyncs
    NotificationsLagged { skipped: u64 },
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub producers: usize,
    pub inbound_sessions: usize,
    pub attendee_peers: usize,
    pub consumers: usize,
    pub admin_audio: bool,
    pub admin_video: bool,
    pub duplicate_publisher: bool,
}
