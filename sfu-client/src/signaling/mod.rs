//! Signaling with the relay
//!
//! [`SignalingChannel`] is the raw persistent connection: fire-and-forget
//! events, request/response calls and pushed notifications. [`RelaySignaling`]
//! layers the relay's typed operations on top of any channel, and
//! [`ws::WsSignalingChannel`] is a WebSocket implementation of the channel.

mod client;
pub mod protocol;
pub mod ws;

pub use client::RelaySignaling;
pub use protocol::RelayEvent;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// A notification pushed by the relay without a matching request
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }
}

/// Persistent, bidirectional connection to the relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send an event without waiting for a response
    async fn emit(&self, method: &str, data: Value) -> Result<()>;

    /// Send a request and wait for the relay's response payload
    async fn call(&self, method: &str, data: Value) -> Result<Value>;

    /// Receive pushed notifications. The receiver reports `Closed` once the
    /// underlying connection is gone.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}
