//! SFU client session orchestrator
//!
//! Connects one participant to a selective-forwarding relay: captures local
//! audio and video, joins a room, publishes both tracks over a single send
//! transport and consumes every remote producer over its own receive
//! transport. Consumed tracks are kept in a registry keyed by peer and media
//! kind, with a dedicated slot for the room administrator.
//!
//! ## Architecture
//!
//! - **`SfuSession`**: State machine driving setup and relay notifications
//! - **`RelaySignaling`**: Typed relay operations over a `SignalingChannel`
//! - **`CapabilityNegotiator`**: Loads the device with relay capabilities once
//! - **`OutboundSession`**: Send transport with one producer per media kind
//! - **`InboundRegistry`**: One receive transport per remote producer
//! - **`ConsumerRegistry`**: Consumed tracks by peer/kind plus the admin slot
//!
//! The media stack itself (ICE, DTLS, RTP) stays behind the traits in
//! [`device`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_client::{ClientConfig, SfuSession, WsSignalingChannel};
//!
//! let config = ClientConfig::load(Some("sfu-client.toml"))?;
//! let channel = Arc::new(WsSignalingChannel::connect(&config.signaling).await?);
//! let session = Arc::new(SfuSession::new(config.session, channel, device, capture));
//! session.open().await?;
//!
//! let admin = session.consumers().admin();
//! ```

pub mod capability;
pub mod config;
pub mod consumers;
pub mod device;
mod error;
pub mod inbound;
pub mod logging;
pub mod outbound;
pub mod retry;
mod session;
pub mod signaling;
mod state;
mod types;

pub use capability::CapabilityNegotiator;
pub use config::{ClientConfig, LoggingConfig, SessionConfig, SignalingConfig};
pub use consumers::{ConsumerEntry, ConsumerRegistry, PeerMedia};
pub use error::{Error, NegotiationStage, Result};
pub use inbound::{InboundRegistry, InboundSession};
pub use logging::init_logging;
pub use outbound::{DuplicateUserFlag, OutboundSession};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use session::SfuSession;
pub use signaling::ws::WsSignalingChannel;
pub use signaling::{Notification, RelayEvent, RelaySignaling, SignalingChannel};
pub use state::{SessionEvent, SessionState, SessionStats};
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, Role, RoomId, SessionId, TransportId};
