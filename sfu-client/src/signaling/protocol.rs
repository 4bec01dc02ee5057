//! Wire shapes of the relay signaling operations

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{ConsumerParameters, LocalCapabilities, RelayCapabilities, TransportDescriptor};
use crate::error::{Error, Result};
use crate::types::{MediaKind, PeerId, ProducerId, Role, RoomId, TransportId};

pub mod method {
    pub const JOIN: &str = "join";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const GET_EXISTING_PRODUCERS: &str = "getExistingProducers";
    pub const CONSUME: &str = "consume";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const PRODUCERS_EXIST: &str = "producersExist";
}

pub mod event {
    pub const NEW_PRODUCER: &str = "newProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";
    pub const DUPLICATE_USER: &str = "duplicateUser";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user_id: PeerId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub relay_capabilities: RelayCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub is_consumer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportResponse {
    #[serde(default)]
    pub transport_params: Option<TransportDescriptor>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CreateTransportResponse {
    pub fn into_result(self) -> Result<TransportDescriptor> {
        match (self.transport_params, self.error) {
            (_, Some(reason)) => Err(Error::Signaling(reason)),
            (Some(params), None) => Ok(params),
            (None, None) => Err(Error::Signaling(
                "createTransport response carried neither params nor error".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_transport_id: Option<TransportId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceSignal {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    #[serde(alias = "id")]
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingProducersResponse {
    #[serde(default)]
    pub producer_ids: Vec<ProducerId>,
}

/// The relay answers either a bare boolean or `{ "exists": bool }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProducersExistResponse {
    Flag(bool),
    Object { exists: bool },
}

impl ProducersExistResponse {
    #[must_use]
    pub const fn exists(&self) -> bool {
        match self {
            Self::Flag(exists) | Self::Object { exists } => *exists,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub capabilities: LocalCapabilities,
    pub remote_producer_id: ProducerId,
    pub server_transport_id: TransportId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    #[serde(default)]
    pub consumer_params: Option<ConsumerParameters>,
    #[serde(default)]
    pub publisher_id: Option<PeerId>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub error: Option<String>,
}

/// A granted consume: what to build locally and whom it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeGrant {
    pub parameters: ConsumerParameters,
    pub publisher_id: PeerId,
    pub role: Role,
}

impl ConsumeResponse {
    pub fn into_grant(self, producer_id: &ProducerId) -> Result<ConsumeGrant> {
        if let Some(reason) = self.error {
            return Err(Error::CannotConsume {
                producer_id: producer_id.clone(),
                reason,
            });
        }
        match (self.consumer_params, self.publisher_id) {
            (Some(parameters), Some(publisher_id)) => Ok(ConsumeGrant {
                parameters,
                publisher_id,
                role: self.role,
            }),
            _ => Err(Error::CannotConsume {
                producer_id: producer_id.clone(),
                reason: "consume response is missing consumer parameters or publisher".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    pub server_consumer_id: crate::types::ConsumerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewProducerData {
    producer_id: ProducerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerClosedData {
    remote_producer_id: ProducerId,
}

#[derive(Debug, Clone, Deserialize)]
struct DuplicateUserData {
    exists: bool,
}

/// Events pushed by the relay that the session reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    NewProducer { producer_id: ProducerId },
    ProducerClosed { remote_producer_id: ProducerId },
    DuplicateUser { exists: bool },
}

impl RelayEvent {
    /// Decode a pushed notification. Unknown methods yield `Ok(None)`.
    pub fn parse(method: &str, data: Value) -> Result<Option<Self>> {
        let event = match method {
            event::NEW_PRODUCER => {
                let data: NewProducerData = serde_json::from_value(data)?;
                Self::NewProducer {
                    producer_id: data.producer_id,
                }
            }
            event::PRODUCER_CLOSED => {
                let data: ProducerClosedData = serde_json::from_value(data)?;
                Self::ProducerClosed {
                    remote_producer_id: data.remote_producer_id,
                }
            }
            event::DUPLICATE_USER => {
                let data: DuplicateUserData = serde_json::from_value(data)?;
                Self::DuplicateUser {
                    exists: data.exists,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
