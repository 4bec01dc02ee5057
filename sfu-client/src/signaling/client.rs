use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::protocol::{
    method, ConnectTransportRequest, ConsumeGrant, ConsumeRequest, ConsumeResponse,
    CreateTransportRequest, CreateTransportResponse, ExistingProducersResponse, JoinRequest,
    JoinResponse, ProduceResponse, ProduceSignal, ProducersExistResponse, ResumeConsumerRequest,
};
use super::{Notification, SignalingChannel};
use crate::device::{LocalCapabilities, ProduceRequest, RelayCapabilities, TransportDescriptor};
use crate::error::{Error, NegotiationStage, Result};
use crate::types::{ConsumerId, PeerId, ProducerId, Role, RoomId, TransportId};

/// Typed access to the relay's signaling operations
#[derive(Clone)]
pub struct RelaySignaling {
    channel: Arc<dyn SignalingChannel>,
}

impl RelaySignaling {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.channel.subscribe()
    }

    async fn request<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        trace!(method, "Signaling request");
        let response = self.channel.call(method, payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn notify<Req>(&self, method: &str, request: &Req) -> Result<()>
    where
        Req: Serialize + Sync,
    {
        let payload = serde_json::to_value(request)?;
        trace!(method, "Signaling event");
        self.channel.emit(method, payload).await
    }

    pub async fn join(
        &self,
        room_id: &RoomId,
        user_id: &PeerId,
        role: Role,
    ) -> Result<RelayCapabilities> {
        let request = JoinRequest {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            role,
        };
        let response: JoinResponse = self
            .request(method::JOIN, &request)
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Join))?;
        debug!(room_id = %room_id, user_id = %user_id, role = %role, "Joined room");
        Ok(response.relay_capabilities)
    }

    pub async fn create_transport(&self, is_consumer: bool) -> Result<TransportDescriptor> {
        let response: CreateTransportResponse = self
            .request(method::CREATE_TRANSPORT, &CreateTransportRequest { is_consumer })
            .await
            .map_err(|e| e.at_stage(NegotiationStage::CreateTransport))?;
        response
            .into_result()
            .map_err(|e| e.at_stage(NegotiationStage::CreateTransport))
    }

    /// Fire-and-forget: the relay does not answer connect
    pub async fn connect_transport(
        &self,
        dtls_parameters: serde_json::Value,
        server_transport_id: Option<TransportId>,
    ) -> Result<()> {
        let request = ConnectTransportRequest {
            dtls_parameters,
            server_transport_id,
        };
        self.notify(method::CONNECT_TRANSPORT, &request)
            .await
            .map_err(|e| e.at_stage(NegotiationStage::ConnectTransport))
    }

    pub async fn produce(&self, request: ProduceRequest) -> Result<ProducerId> {
        let signal = ProduceSignal {
            kind: request.kind,
            rtp_parameters: request.rtp_parameters,
            app_data: request.app_data,
        };
        let response: ProduceResponse = self
            .request(method::PRODUCE, &signal)
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Produce))?;
        Ok(response.producer_id)
    }

    pub async fn producers_exist(&self) -> Result<bool> {
        let response: ProducersExistResponse = self
            .request(method::PRODUCERS_EXIST, &serde_json::json!({}))
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Discovery))?;
        Ok(response.exists())
    }

    pub async fn existing_producers(&self) -> Result<Vec<ProducerId>> {
        let response: ExistingProducersResponse = self
            .request(method::GET_EXISTING_PRODUCERS, &serde_json::json!({}))
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Discovery))?;
        Ok(response.producer_ids)
    }

    pub async fn consume(
        &self,
        capabilities: &LocalCapabilities,
        remote_producer_id: &ProducerId,
        server_transport_id: &TransportId,
    ) -> Result<ConsumeGrant> {
        let request = ConsumeRequest {
            capabilities: capabilities.clone(),
            remote_producer_id: remote_producer_id.clone(),
            server_transport_id: server_transport_id.clone(),
        };
        let response: ConsumeResponse = self
            .request(method::CONSUME, &request)
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Consume))?;
        response.into_grant(remote_producer_id)
    }

    /// Fire-and-forget: consumers start paused on the relay
    pub async fn resume_consumer(&self, server_consumer_id: &ConsumerId) -> Result<()> {
        let request = ResumeConsumerRequest {
            server_consumer_id: server_consumer_id.clone(),
        };
        self.notify(method::RESUME_CONSUMER, &request)
            .await
            .map_err(|e| e.at_stage(NegotiationStage::Consume))
    }
}

impl std::fmt::Debug for RelaySignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySignaling").finish_non_exhaustive()
    }
}
