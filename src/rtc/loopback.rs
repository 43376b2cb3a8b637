use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    metadata::manifest::ResourceId,
    protocol::{tracker_messages::SignalPayload, wire_protocol::FrameChannel, ParticipantId},
    rtc::{RtcEngine, RtcEvent},
};

/// Registry of the in-process engines that can reach each other.
#[derive(Clone, Default)]
pub struct Switchboard {
    engines: Arc<Mutex<HashMap<ParticipantId, UnboundedSender<RtcEvent>>>>,
}

/// Engine linking managers living in the same process with in-memory frame channels.
pub struct LoopbackEngine {
    local_id: ParticipantId,
    switchboard: Switchboard,
    events_tx: UnboundedSender<RtcEvent>,
}

impl LoopbackEngine {
    pub fn new(
        local_id: ParticipantId,
        switchboard: Switchboard,
        events_tx: UnboundedSender<RtcEvent>,
    ) -> Self {
        switchboard
            .engines
            .lock()
            .unwrap()
            .insert(local_id, events_tx.clone());
        LoopbackEngine {
            local_id,
            switchboard,
            events_tx,
        }
    }
}

impl RtcEngine for LoopbackEngine {
    fn create_offer(&mut self, remote: ParticipantId, resource_id: ResourceId) -> Result<SignalPayload> {
        let _ = self.events_tx.send(RtcEvent::LocalCandidate {
            remote,
            resource_id,
            payload: json!({ "candidate": format!("loopback {}", self.local_id) }),
        });
        Ok(json!({ "sdp": format!("offer from {}", self.local_id) }))
    }

    fn accept_offer(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        _offer: SignalPayload,
    ) -> Result<SignalPayload> {
        let remote_tx = match self.switchboard.engines.lock().unwrap().get(&remote) {
            Some(tx) => tx.clone(),
            None => bail!("participant {remote} is not on the switchboard"),
        };
        let (ours, theirs) = FrameChannel::pair(64);
        let _ = remote_tx.send(RtcEvent::ChannelOpen {
            remote: self.local_id,
            resource_id,
            channel: theirs,
        });
        let _ = self.events_tx.send(RtcEvent::ChannelOpen {
            remote,
            resource_id,
            channel: ours,
        });
        Ok(json!({ "sdp": format!("answer from {}", self.local_id) }))
    }

    fn accept_answer(&mut self, _remote: ParticipantId, _resource_id: ResourceId, _answer: SignalPayload) -> Result<()> {
        Ok(())
    }

    fn add_ice_candidate(
        &mut self,
        _remote: ParticipantId,
        _resource_id: ResourceId,
        _candidate: SignalPayload,
    ) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _remote: ParticipantId, _resource_id: ResourceId) {}
}
