use std::collections::HashSet;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Instant;

use crate::{
    metadata::manifest::ResourceId,
    protocol::{
        peer_messages::PeerMessage,
        wire_protocol::{FrameChannel, ProtocolError, ProtocolReadHalf, ProtocolWriteHalf},
        ParticipantId,
    },
};

pub type SessionId = u64;

/// A session is scoped to one resource: the same participant can be met once per resource.
pub type PeerKey = (ParticipantId, ResourceId);

#[derive(Debug)]
pub enum ToPeerMsg {
    Send(PeerMessage),
}

#[derive(Debug)]
pub enum PeersToManagerMsg {
    Error(PeerKey, SessionId),
    Receive(PeerKey, SessionId, PeerMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

/// One session with a remote participant, scoped to the resource it was opened for.
pub struct Peer {
    pub participant_id: ParticipantId,
    pub resource_id: ResourceId,
    pub session: SessionId,
    pub state: PeerState,
    pub initiator: bool, // we sent the offer
    pub negotiation_started: Instant,
    pub connected_at: Option<Instant>,
    haves: HashSet<usize>,
    bitfield_received: bool,
    to_peer_tx: Option<Sender<ToPeerMsg>>,
}

impl Peer {
    pub fn new(
        participant_id: ParticipantId,
        resource_id: ResourceId,
        session: SessionId,
        initiator: bool,
    ) -> Self {
        Peer {
            participant_id,
            resource_id,
            session,
            state: PeerState::Negotiating,
            initiator,
            negotiation_started: Instant::now(),
            connected_at: None,
            haves: HashSet::new(),
            bitfield_received: false,
            to_peer_tx: None,
        }
    }

    pub fn connected(&mut self, to_peer_tx: Sender<ToPeerMsg>) {
        self.state = PeerState::Connected;
        self.connected_at = Some(Instant::now());
        self.to_peer_tx = Some(to_peer_tx);
    }

    pub fn key(&self) -> PeerKey {
        (self.participant_id, self.resource_id)
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    pub fn set_bitfield(&mut self, indices: Vec<usize>) {
        self.bitfield_received = true;
        self.haves = indices.into_iter().collect();
    }

    pub fn add_have(&mut self, piece_idx: usize) {
        self.haves.insert(piece_idx);
    }

    /// Until the remote tells us what it holds, it is assumed to hold everything:
    /// peers are only pursued when announced as sources.
    pub fn have_piece(&self, piece_idx: usize) -> bool {
        !self.bitfield_received || self.haves.contains(&piece_idx)
    }

    pub fn known_pieces(&self) -> usize {
        self.haves.len()
    }

    pub async fn send(&mut self, msg: PeerMessage) {
        let Some(to_peer_tx) = &self.to_peer_tx else {
            log::trace!(
                "not sending {msg} to participant {}: channel not open",
                self.participant_id
            );
            return;
        };
        if to_peer_tx.capacity() <= 5 {
            log::warn!("low to_peer_tx capacity: {}", to_peer_tx.capacity());
        }
        // the channel can be closed if the handlers exited on a transport error that the
        // manager has not processed yet
        let _ = to_peer_tx.send(ToPeerMsg::Send(msg)).await;
    }

    /// Drops the sending side, which makes the send handler exit and close the channel.
    pub fn close(&mut self) {
        self.to_peer_tx = None;
    }
}

pub fn start_peer_msg_handlers(
    key: PeerKey,
    session: SessionId,
    channel: FrameChannel,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    to_peer_rx: Receiver<ToPeerMsg>,
) {
    let FrameChannel { tx, rx } = channel;
    tokio::spawn(rcv_message_handler(
        key,
        session,
        peers_to_manager_tx.clone(),
        rx,
    ));
    tokio::spawn(snd_message_handler(
        key,
        session,
        to_peer_rx,
        peers_to_manager_tx,
        tx,
    ));
}

async fn rcv_message_handler<T: ProtocolReadHalf<PeerMessage> + 'static>(
    key: PeerKey,
    session: SessionId,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    mut wire_proto: T,
) {
    let (participant_id, _) = key;
    loop {
        match wire_proto.receive().await {
            Ok(msg) => {
                log::trace!("received from participant {participant_id}: {msg}");
                send_to_manager(
                    &peers_to_manager_tx,
                    PeersToManagerMsg::Receive(key, session, msg),
                )
                .await;
            }
            Err(e) => {
                if let Some(ProtocolError::Malformed(reason)) = e.downcast_ref::<ProtocolError>() {
                    log::warn!("dropping malformed frame from participant {participant_id}: {reason}");
                    continue;
                }
                log::debug!("receive failed with participant {participant_id}: {e}");
                send_to_manager(
                    &peers_to_manager_tx,
                    PeersToManagerMsg::Error(key, session),
                )
                .await;
                break;
            }
        }
    }
}

async fn snd_message_handler<T: ProtocolWriteHalf<PeerMessage> + 'static>(
    key: PeerKey,
    session: SessionId,
    mut to_peer_rx: Receiver<ToPeerMsg>,
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    mut wire_proto: T,
) {
    let (participant_id, _) = key;
    while let Some(ToPeerMsg::Send(msg)) = to_peer_rx.recv().await {
        log::trace!("sending {msg} to participant {participant_id}");
        if let Err(e) = wire_proto.send(msg).await {
            log::debug!("sending failed with participant {participant_id}: {e}");
            send_to_manager(
                &peers_to_manager_tx,
                PeersToManagerMsg::Error(key, session),
            )
            .await;
            break;
        }
    }
}

async fn send_to_manager(peers_to_manager_tx: &Sender<PeersToManagerMsg>, msg: PeersToManagerMsg) {
    if peers_to_manager_tx.capacity() <= 5 {
        log::warn!(
            "low peers_to_manager_tx capacity: {}",
            peers_to_manager_tx.capacity()
        );
    }
    // the manager is gone only when shutting down
    let _ = peers_to_manager_tx.send(msg).await;
}
