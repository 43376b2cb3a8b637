use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::UnboundedSender,
    time::timeout,
};

use crate::{
    metadata::manifest::ResourceId,
    protocol::{
        tcp_frames,
        tracker_messages::SignalPayload,
        wire_protocol::{ProtocolReadHalf, ProtocolWriteHalf},
        ParticipantId,
    },
    rtc::{ConnectionState, IceConfig, NegotiationFailure, RtcEngine, RtcEvent},
};

static DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct Offer {
    addr: String,
    token: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    user_id: ParticipantId,
    resource_id: ResourceId,
    token: u64,
}

// the offerer's reply to a greeting, the dialing side is connected only once it is accepted
#[derive(Debug, Serialize, Deserialize)]
struct GreetingAck {
    accepted: bool,
}

type PendingOffers = Arc<Mutex<HashMap<(ParticipantId, ResourceId), u64>>>; // -> token we handed out

/// Engine opening direct TCP channels. The offerer advertises its listening address and a
/// one-time token; the answerer dials it and greets with its participant id, the resource
/// and the token. The offerer acknowledges a matching greeting, after which both sides
/// report the channel as open.
pub struct TcpRtcEngine {
    local_id: ParticipantId,
    advertised_addr: String,
    ice_config: IceConfig,
    pending: PendingOffers,
    events_tx: UnboundedSender<RtcEvent>,
}

impl TcpRtcEngine {
    pub async fn bind(
        local_id: ParticipantId,
        listen_port: u16,
        advertised_host: String,
        ice_config: IceConfig,
        events_tx: UnboundedSender<RtcEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(format!("0.0.0.0:{listen_port}")).await?;
        let advertised_addr = format!("{advertised_host}:{}", listener.local_addr()?.port());
        log::info!(
            "peer channels listening on {} (advertised as {advertised_addr}, ice servers: {:?})",
            listener.local_addr()?,
            ice_config.ice_servers
        );
        let pending: PendingOffers = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run_incoming_channels_handler(
            listener,
            pending.clone(),
            events_tx.clone(),
        ));
        Ok(TcpRtcEngine {
            local_id,
            advertised_addr,
            ice_config,
            pending,
            events_tx,
        })
    }
}

impl RtcEngine for TcpRtcEngine {
    fn create_offer(&mut self, remote: ParticipantId, resource_id: ResourceId) -> Result<SignalPayload> {
        let token = rand::random::<u64>();
        match self.pending.lock() {
            Ok(mut pending) => pending.insert((remote, resource_id), token),
            Err(_) => bail!("pending offers lock poisoned"),
        };
        log::trace!(
            "offering channel to participant {remote} for resource {resource_id} (ordered: {}, max retransmits: {})",
            self.ice_config.ordered,
            self.ice_config.max_retransmits
        );
        Ok(serde_json::to_value(Offer {
            addr: self.advertised_addr.clone(),
            token,
        })?)
    }

    fn accept_offer(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        offer: SignalPayload,
    ) -> Result<SignalPayload> {
        let offer: Offer = match serde_json::from_value(offer) {
            Ok(offer) => offer,
            Err(e) => bail!(NegotiationFailure {
                participant: remote,
                reason: format!("undecodable offer: {e}"),
            }),
        };
        tokio::spawn(dial(
            self.local_id,
            remote,
            resource_id,
            offer,
            self.events_tx.clone(),
        ));
        Ok(serde_json::json!({ "accepted": true }))
    }

    fn accept_answer(
        &mut self,
        remote: ParticipantId,
        resource_id: ResourceId,
        _answer: SignalPayload,
    ) -> Result<()> {
        let offered = match self.pending.lock() {
            Ok(pending) => pending.contains_key(&(remote, resource_id)),
            Err(_) => bail!("pending offers lock poisoned"),
        };
        if !offered {
            bail!(NegotiationFailure {
                participant: remote,
                reason: format!("answer for resource {resource_id} without a pending offer"),
            });
        }
        Ok(())
    }

    fn add_ice_candidate(
        &mut self,
        remote: ParticipantId,
        _resource_id: ResourceId,
        _candidate: SignalPayload,
    ) -> Result<()> {
        log::trace!("ignoring ice candidate from participant {remote}, direct channels need none");
        Ok(())
    }

    fn close(&mut self, remote: ParticipantId, resource_id: ResourceId) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&(remote, resource_id));
        }
    }
}

async fn dial(
    local_id: ParticipantId,
    remote: ParticipantId,
    resource_id: ResourceId,
    offer: Offer,
    events_tx: UnboundedSender<RtcEvent>,
) {
    let failed = || {
        let _ = events_tx.send(RtcEvent::ConnectionState {
            remote,
            resource_id,
            state: ConnectionState::Failed,
        });
    };
    log::trace!("dialing participant {remote} at {}", offer.addr);
    let stream = match timeout(DEFAULT_TIMEOUT, TcpStream::connect(&offer.addr)).await {
        Err(_elapsed) => {
            log::debug!("timed out connecting to participant {remote} at {}", offer.addr);
            failed();
            return;
        }
        Ok(Err(e)) => {
            log::debug!("error connecting to participant {remote} at {}: {e}", offer.addr);
            failed();
            return;
        }
        Ok(Ok(stream)) => stream,
    };
    let mut channel = tcp_frames::bridge(stream, format!("participant {remote}"));
    let greeting = Greeting {
        user_id: local_id,
        resource_id,
        token: offer.token,
    };
    if let Err(e) = ProtocolWriteHalf::send(&mut channel.tx, greeting).await {
        log::debug!("greeting participant {remote} failed: {e}");
        failed();
        return;
    }
    let ack: GreetingAck = match timeout(DEFAULT_TIMEOUT, channel.rx.receive()).await {
        Err(_elapsed) => {
            log::debug!("participant {remote} did not acknowledge the greeting");
            failed();
            return;
        }
        Ok(Err(e)) => {
            log::debug!("participant {remote} closed the channel before acknowledging: {e}");
            failed();
            return;
        }
        Ok(Ok(ack)) => ack,
    };
    if !ack.accepted {
        log::debug!("participant {remote} refused the channel for resource {resource_id}");
        failed();
        return;
    }
    let _ = events_tx.send(RtcEvent::ChannelOpen {
        remote,
        resource_id,
        channel,
    });
}

async fn run_incoming_channels_handler(
    listener: TcpListener,
    pending: PendingOffers,
    events_tx: UnboundedSender<RtcEvent>,
) {
    loop {
        log::debug!("waiting for incoming peer channels...");
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("error accepting peer channel: {e}");
                continue;
            }
        };
        if events_tx.is_closed() {
            log::debug!("engine dropped, stop accepting peer channels");
            return;
        }
        let pending = pending.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let remote_addr = addr_or_unknown(&stream);
            let mut channel = tcp_frames::bridge(stream, format!("incoming {remote_addr}"));
            let greeting: Greeting = match timeout(DEFAULT_TIMEOUT, channel.rx.receive()).await {
                Err(_elapsed) => {
                    log::trace!("greeting timeout with {remote_addr}");
                    return;
                }
                Ok(Err(e)) => {
                    log::trace!("greeting failed with {remote_addr}: {e}");
                    return;
                }
                Ok(Ok(greeting)) => greeting,
            };
            // the token stays until the session is closed: the answer may be relayed after this
            let expected = match pending.lock() {
                Ok(pending) => pending.get(&(greeting.user_id, greeting.resource_id)).copied(),
                Err(_) => None,
            };
            let accepted = expected == Some(greeting.token);
            if let Err(e) = ProtocolWriteHalf::send(&mut channel.tx, GreetingAck { accepted }).await {
                log::trace!("could not acknowledge {remote_addr}: {e}");
                return;
            }
            if !accepted {
                log::debug!(
                    "refusing channel from {remote_addr}: no matching offer for participant {} and resource {}",
                    greeting.user_id,
                    greeting.resource_id
                );
                return;
            }
            let _ = events_tx.send(RtcEvent::ChannelOpen {
                remote: greeting.user_id,
                resource_id: greeting.resource_id,
                channel,
            });
        });
    }
}

fn addr_or_unknown(stream: &TcpStream) -> String {
    match stream.peer_addr() {
        Ok(s) => s.to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}
