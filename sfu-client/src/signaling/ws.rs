//! WebSocket signaling channel
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! - `request`: `{ "type": "request", "id": 7, "method": "produce", "data": {..} }`
//! - `response`: `{ "type": "response", "id": 7, "ok": true, "data": {..} }`
//!   or `{ "type": "response", "id": 7, "ok": false, "error": "reason" }`
//! - `notification`: `{ "type": "notification", "method": "newProducer", "data": {..} }`
//!
//! Client events (`emit`) travel as notifications. Requests coming from the
//! relay are answered with `ok: false` since the client serves none.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Notification, SignalingChannel};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notification {
        method: String,
        #[serde(default)]
        data: Value,
    },
}

/// State shared between the channel handle and its socket tasks
struct Shared {
    pending: DashMap<u64, oneshot::Sender<Result<Value>>>,
    next_id: AtomicU64,
    notifications: Mutex<Option<broadcast::Sender<Notification>>>,
}

impl Shared {
    fn new(notification_buffer: usize) -> Self {
        let (notifications, _) = broadcast::channel(notification_buffer.max(1));
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            notifications: Mutex::new(Some(notifications)),
        }
    }

    /// Route one inbound text frame; returns a frame to send back, if any
    fn dispatch(&self, text: &str) -> Option<Frame> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                return None;
            }
        };

        match frame {
            Frame::Response {
                id,
                ok,
                data,
                error,
            } => {
                let Some((_, waiter)) = self.pending.remove(&id) else {
                    debug!(id, "Response for unknown or expired request");
                    return None;
                };
                let result = if ok {
                    Ok(data)
                } else {
                    Err(Error::Signaling(
                        error.unwrap_or_else(|| "request rejected by relay".to_string()),
                    ))
                };
                // the caller may have timed out and dropped its receiver
                let _ = waiter.send(result);
                None
            }
            Frame::Notification { method, data } => {
                if let Some(sender) = self.notifications.lock().as_ref() {
                    // no subscribers is fine
                    let _ = sender.send(Notification { method, data });
                }
                None
            }
            Frame::Request { id, method, .. } => {
                debug!(id, method = %method, "Rejecting relay-initiated request");
                Some(Frame::Response {
                    id,
                    ok: false,
                    data: Value::Null,
                    error: Some(format!("client does not handle {method}")),
                })
            }
        }
    }

    /// Fail every in-flight call and close the notification stream
    fn shutdown(&self) {
        // dropping the waiters resolves them with ChannelClosed
        self.pending.clear();
        self.notifications.lock().take();
    }
}

/// [`SignalingChannel`] over a WebSocket connection
pub struct WsSignalingChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl WsSignalingChannel {
    /// Connect to `config.url` and start the socket reader/writer tasks
    pub async fn connect(config: &SignalingConfig) -> Result<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| Error::Signaling(format!("failed to connect to {}: {e}", config.url)))?;

        info!(url = %config.url, "Signaling channel connected");

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared::new(config.notification_buffer));
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = sink.send(message).await {
                            warn!(error = %e, "Failed to write signaling frame");
                            break;
                        }
                    }
                }
            }
            debug!("Signaling writer stopped");
        });

        let reader_shared = Arc::clone(&shared);
        let reader_cancel = cancel.clone();
        let reply = outgoing.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(frame) = reader_shared.dispatch(text.as_str()) {
                                if let Ok(json) = serde_json::to_string(&frame) {
                                    let _ = reply.send(Message::text(json));
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Signaling socket error");
                            break;
                        }
                    }
                }
            }
            // mark closed before failing waiters so no new call slips in
            reader_cancel.cancel();
            reader_shared.shutdown();
            info!("Signaling channel disconnected");
        });

        Ok(Self {
            outgoing,
            shared,
            request_timeout: config.request_timeout(),
            cancel,
        })
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.outgoing
            .send(Message::text(json))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Whether the socket tasks are still running
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Close the socket; pending calls fail with [`Error::ChannelClosed`]
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn emit(&self, method: &str, data: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }
        self.send(&Frame::Notification {
            method: method.to_string(),
            data,
        })
    }

    async fn call(&self, method: &str, data: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            data,
        };
        if let Err(e) = self.send(&frame) {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(Error::Timeout(format!("{method} (request {id})")))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        if let Some(sender) = self.shared.notifications.lock().as_ref() {
            return sender.subscribe();
        }
        // already disconnected: hand out a receiver that reports Closed
        let (_, receiver) = broadcast::channel(1);
        receiver
    }
}
