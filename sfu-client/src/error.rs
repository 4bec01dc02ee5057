//! Error types for the SFU client

use std::fmt;
use thiserror::Error;

use crate::types::ProducerId;

/// Negotiation step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    Join,
    LoadCapabilities,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    Discovery,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Join => "join",
            Self::LoadCapabilities => "load capabilities",
            Self::CreateTransport => "create transport",
            Self::ConnectTransport => "connect transport",
            Self::Produce => "produce",
            Self::Consume => "consume",
            Self::Discovery => "producer discovery",
        };
        f.write_str(name)
    }
}

/// SFU client error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Media capture failed: {0}")]
    Capture(String),

    #[error("Negotiation failed during {stage}: {reason}")]
    Negotiation {
        stage: NegotiationStage,
        reason: String,
    },

    #[error("Relay cannot consume producer {producer_id}: {reason}")]
    CannotConsume {
        producer_id: ProducerId,
        reason: String,
    },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling request timed out: {0}")]
    Timeout(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Publishing suppressed: identity already has an active publisher")]
    DuplicatePublisher,

    #[error("Subscription to producer {0} was cancelled")]
    Cancelled(ProducerId),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn negotiation(stage: NegotiationStage, reason: impl fmt::Display) -> Self {
        Self::Negotiation {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Wrap a lower-level failure as a negotiation failure at `stage`,
    /// leaving conditions that already carry their own meaning untouched.
    #[must_use]
    pub fn at_stage(self, stage: NegotiationStage) -> Self {
        match self {
            Self::Negotiation { .. }
            | Self::CannotConsume { .. }
            | Self::DuplicatePublisher
            | Self::Cancelled(_) => self,
            other => Self::negotiation(stage, other),
        }
    }

    /// Whether the error ends the whole session rather than one subscription
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            Self::CannotConsume { .. } | Self::Cancelled(_) | Self::DuplicatePublisher
        )
    }
}

/// Result type for SFU client operations
pub type Result<T> = std::result::Result<T, Error>;
