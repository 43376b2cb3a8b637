use anyhow::Result;
use thiserror::Error;

use crate::{
    metadata::manifest::ResourceId,
    protocol::{tracker_messages::SignalPayload, wire_protocol::FrameChannel, ParticipantId},
};

#[cfg(test)]
pub mod loopback;
pub mod tcp_engine;

pub static DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
pub static DEFAULT_MAX_RETRANSMITS: u16 = 3;

#[derive(Debug, Error)]
#[error("negotiation with participant {participant} failed: {reason}")]
pub struct NegotiationFailure {
    pub participant: ParticipantId,
    pub reason: String,
}

/// Options of the data channels opened by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IceConfig {
    pub ice_servers: Vec<String>,
    pub ordered: bool,
    pub max_retransmits: u16,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            ordered: true,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Failed,
}

/// Outcomes an engine posts back asynchronously, for the (remote, resource) pair the
/// negotiation was started for.
#[derive(Debug)]
pub enum RtcEvent {
    LocalCandidate {
        remote: ParticipantId,
        resource_id: ResourceId,
        payload: SignalPayload,
    },
    ChannelOpen {
        remote: ParticipantId,
        resource_id: ResourceId,
        channel: FrameChannel,
    },
    ConnectionState {
        remote: ParticipantId,
        resource_id: ResourceId,
        state: ConnectionState,
    },
}

/// Drives the offer/answer handshake towards a remote participant. Every negotiation is
/// scoped to a resource, so the same remote can hold one channel per resource. The engine
/// only moves opaque payloads; relaying them is up to the caller. Readiness and failures
/// are reported as `RtcEvent`s on the sender the engine was built with.
pub trait RtcEngine: Send {
    fn create_offer(&mut self, remote: ParticipantId, resource_id: ResourceId) -> Result<SignalPayload>;

    /// Accepts a remote offer and returns the answer to relay back.
    fn accept_offer(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        offer: SignalPayload,
    ) -> Result<SignalPayload>;

    fn accept_answer(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        answer: SignalPayload,
    ) -> Result<()>;

    fn add_ice_candidate(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        candidate: SignalPayload,
    ) -> Result<()>;

    fn close(&mut self, remote: ParticipantId, resource_id: ResourceId);
}
