use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender, UnboundedReceiver},
        oneshot,
    },
    time::Instant,
};

use crate::{
    manager::{
        bandwidth_tracker::BandwidthTracker,
        events::{EventBus, Failure, FailureKind, SwarmEvent},
        peer::{self, Peer, PeerKey, PeerState, PeersToManagerMsg, SessionId},
        piece_requestor::PieceRequestor,
    },
    metadata::manifest::{Manifest, ResourceId, ResourceMetadata, DEFAULT_PIECE_SIZE_B},
    persistence::{chunking::InvalidInputError, piece_store::PieceStore},
    protocol::{
        peer_messages::{PeerMessage, MAX_PIECE_SIZE_B},
        tracker_messages::{AnnounceEvent, AnnounceStatus, SignalPayload, SwarmPeer, TrackerMessage},
        wire_protocol::{self, FrameChannel, ProtocolError, ProtocolReadHalf},
        ParticipantId,
    },
    registry::{ResourceNotFoundError, ResourceRegistry},
    rtc::{ConnectionState, NegotiationFailure, RtcEngine, RtcEvent},
    tracker::{self, Backoff, TrackerConnector},
    util::{pretty_size, start_tick},
};

pub const DEFAULT_MAX_PEERS: usize = 10;
const DEFAULT_MAX_OUTSTANDING_REQUESTS_PER_PEER: usize = 8; // pieces are 1 MiB, a few in flight keep a peer busy
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PIECE_ATTEMPTS: u32 = 5;
const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const PEER_DISCOVERY_INTERVAL: Duration = Duration::from_secs(15); // how often a leecher with no peers asks the registry again
const TO_PEER_CHANNEL_CAPACITY: usize = 2000;
const PEERS_TO_MANAGER_CHANNEL_CAPACITY: usize = 50000;
const TRACKER_TO_MANAGER_CHANNEL_CAPACITY: usize = 1000;
const TASKS_CHANNEL_CAPACITY: usize = 100;
const COMMANDS_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub participant_id: ParticipantId,
    pub piece_size: u64,
    pub max_peers: usize, // sessions across all transfers
    pub max_outstanding_requests_per_peer: usize,
    pub request_timeout: Duration,
    pub max_piece_attempts: u32,
    pub negotiation_timeout: Duration,
    pub backoff: Backoff,
    pub tick_interval: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            participant_id: rand::rng().random_range(1..=u32::MAX as u64),
            piece_size: DEFAULT_PIECE_SIZE_B,
            max_peers: DEFAULT_MAX_PEERS,
            max_outstanding_requests_per_peer: DEFAULT_MAX_OUTSTANDING_REQUESTS_PER_PEER,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_piece_attempts: DEFAULT_MAX_PIECE_ATTEMPTS,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            backoff: Backoff::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Leeching,
    Seeding,
    Completed, // transient: a completed transfer goes on seeding
    Failed,
}

/// Point in time view of a transfer, handed out of the manager task.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub resource_id: ResourceId,
    pub title: String,
    pub status: TransferStatus,
    pub total_size: u64,
    pub piece_count: usize,
    pub owned_pieces: usize,
    pub owned_bytes: u64,
    pub downloaded_bytes: u64, // verified bytes received in this session
    pub uploaded_bytes: u64,
    pub peers: Vec<ParticipantId>, // connected, in connection order
}

impl TransferSnapshot {
    pub fn progress(&self) -> f64 {
        progress_percentage(self.owned_pieces, self.piece_count)
    }
}

fn progress_percentage(owned_pieces: usize, piece_count: usize) -> f64 {
    if piece_count == 0 {
        return 100.;
    }
    owned_pieces as f64 * 100. / piece_count as f64
}

struct Transfer {
    manifest: Manifest,
    status: TransferStatus,
    store: PieceStore,
    requestor: PieceRequestor,
    bandwidth: BandwidthTracker,
    started_at: Instant,
    peers: HashSet<ParticipantId>,
    assembled: Option<Arc<Vec<u8>>>,
    announced: bool, // the tracker has seen at least one announce
    announced_progress: f64,
    last_discovery: Instant,
}

impl Transfer {
    fn new(manifest: Manifest, status: TransferStatus, store: PieceStore, config: &SwarmConfig) -> Self {
        let now = Instant::now();
        Transfer {
            manifest,
            status,
            store,
            requestor: PieceRequestor::new(
                config.max_piece_attempts,
                config.max_outstanding_requests_per_peer,
            ),
            bandwidth: BandwidthTracker::new(),
            started_at: now,
            peers: HashSet::new(),
            assembled: None,
            announced: false,
            announced_progress: 0.,
            last_discovery: now,
        }
    }

    fn progress(&self) -> f64 {
        progress_percentage(self.store.completed_pieces(), self.store.num_pieces())
    }
}

enum SwarmCommand {
    CreateAndSeed {
        payload: Vec<u8>,
        mime_type: String,
        metadata: ResourceMetadata,
        reply: oneshot::Sender<Result<ResourceId, Failure>>,
    },
    StartLeeching {
        resource_id: ResourceId,
        reply: oneshot::Sender<Result<(), Failure>>,
    },
    Snapshot {
        resource_id: ResourceId,
        reply: oneshot::Sender<Option<TransferSnapshot>>,
    },
    AssembledPayload {
        resource_id: ResourceId,
        reply: oneshot::Sender<Option<Arc<Vec<u8>>>>,
    },
    Cancel {
        resource_id: ResourceId,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        reply: oneshot::Sender<UnboundedReceiver<SwarmEvent>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// results of the work spawned off the control loop
enum TaskMsg {
    ResourceCreated {
        manifest: Manifest,
        payload: Arc<Vec<u8>>,
        result: Result<ResourceId>,
        reply: oneshot::Sender<Result<ResourceId, Failure>>,
    },
    ManifestFetched {
        resource_id: ResourceId,
        result: Result<(Manifest, Vec<SwarmPeer>)>,
        reply: oneshot::Sender<Result<(), Failure>>,
    },
    SwarmPeersFetched {
        resource_id: ResourceId,
        peers: Vec<SwarmPeer>,
    },
    TrackerReconnecting {
        attempt: u32,
        delay: Duration,
    },
    TrackerConnected(FrameChannel),
    TrackerLost(anyhow::Error),
}

// tagged with the generation of the tracker connection they come from
enum TrackerToManagerMsg {
    Receive(u64, TrackerMessage),
    Disconnected(u64),
}

/// Cloneable access to a running `SwarmManager`.
#[derive(Clone)]
pub struct SwarmHandle {
    commands_tx: Sender<SwarmCommand>,
}

impl SwarmHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand,
    ) -> Result<T, Failure> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands_tx.send(command(reply_tx)).await.is_err() {
            return Err(manager_gone());
        }
        reply_rx.await.map_err(|_| manager_gone())
    }

    pub async fn create_and_seed(
        &self,
        payload: Vec<u8>,
        mime_type: String,
        metadata: ResourceMetadata,
    ) -> Result<ResourceId, Failure> {
        self.request(|reply| SwarmCommand::CreateAndSeed {
            payload,
            mime_type,
            metadata,
            reply,
        })
        .await?
    }

    pub async fn start_leeching(&self, resource_id: ResourceId) -> Result<(), Failure> {
        self.request(|reply| SwarmCommand::StartLeeching { resource_id, reply })
            .await?
    }

    pub async fn snapshot(&self, resource_id: ResourceId) -> Option<TransferSnapshot> {
        self.request(|reply| SwarmCommand::Snapshot { resource_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn assembled_payload(&self, resource_id: ResourceId) -> Option<Arc<Vec<u8>>> {
        self.request(|reply| SwarmCommand::AssembledPayload { resource_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn cancel(&self, resource_id: ResourceId) -> bool {
        self.request(|reply| SwarmCommand::Cancel { resource_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn subscribe(&self) -> Result<UnboundedReceiver<SwarmEvent>, Failure> {
        self.request(|reply| SwarmCommand::Subscribe { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.request(|reply| SwarmCommand::Shutdown { reply }).await;
    }
}

fn manager_gone() -> Failure {
    Failure::new(FailureKind::Other, "the swarm manager is not running")
}

/// Owns every transfer and peer session of the local participant. All state changes
/// happen inside `control_loop`; other tasks talk to it through channels only.
pub struct SwarmManager<R, C> {
    config: SwarmConfig,
    registry: R,
    connector: C,
    engine: Box<dyn RtcEngine>,
    transfers: HashMap<ResourceId, Transfer>,
    peers: HashMap<PeerKey, Peer>, // one session per remote participant and resource
    next_session: SessionId,
    events: EventBus<SwarmEvent>,
    tracker_tx: Option<Sender<String>>,
    tracker_generation: u64,
    tracker_reconnecting: bool,

    // internal channels, stored here to avoid passing them around in nested calls
    peers_to_manager_tx: Sender<PeersToManagerMsg>,
    peers_to_manager_rx: Receiver<PeersToManagerMsg>,
    tracker_to_manager_tx: Sender<TrackerToManagerMsg>,
    tracker_to_manager_rx: Receiver<TrackerToManagerMsg>,
    tasks_tx: Sender<TaskMsg>,
    tasks_rx: Receiver<TaskMsg>,
    rtc_events_rx: UnboundedReceiver<RtcEvent>,
    commands_rx: Receiver<SwarmCommand>,
}

impl<R, C> SwarmManager<R, C>
where
    R: ResourceRegistry + Send,
    C: TrackerConnector + Clone + Send + Sync + 'static,
{
    /// `rtc_events_rx` must receive the events of `engine`.
    pub fn new(
        config: SwarmConfig,
        registry: R,
        connector: C,
        engine: Box<dyn RtcEngine>,
        rtc_events_rx: UnboundedReceiver<RtcEvent>,
    ) -> (Self, SwarmHandle) {
        let (peers_to_manager_tx, peers_to_manager_rx) =
            mpsc::channel(PEERS_TO_MANAGER_CHANNEL_CAPACITY);
        let (tracker_to_manager_tx, tracker_to_manager_rx) =
            mpsc::channel(TRACKER_TO_MANAGER_CHANNEL_CAPACITY);
        let (tasks_tx, tasks_rx) = mpsc::channel(TASKS_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMANDS_CHANNEL_CAPACITY);
        let manager = SwarmManager {
            config,
            registry,
            connector,
            engine,
            transfers: HashMap::new(),
            peers: HashMap::new(),
            next_session: 0,
            events: EventBus::new(),
            tracker_tx: None,
            tracker_generation: 0,
            tracker_reconnecting: false,

            peers_to_manager_tx,
            peers_to_manager_rx,
            tracker_to_manager_tx,
            tracker_to_manager_rx,
            tasks_tx,
            tasks_rx,
            rtc_events_rx,
            commands_rx,
        };
        (manager, SwarmHandle { commands_tx })
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Connects to the tracker and runs until shut down through a handle, or until
    /// every handle is dropped.
    pub async fn start(mut self) {
        match self.connector.connect(self.config.participant_id).await {
            Ok(channel) => self.attach_tracker(channel).await,
            Err(e) => {
                log::warn!("could not connect to the tracker: {e:#}");
                self.emit(SwarmEvent::TrackerDisconnected);
                self.start_reconnect();
            }
        }

        let (tick_tx, tick_rx) = mpsc::channel(1);
        start_tick(tick_tx, self.config.tick_interval);

        self.control_loop(tick_rx).await;
    }

    async fn control_loop(&mut self, mut tick_rx: Receiver<()>) {
        loop {
            tokio::select! {
                Some(msg) = self.peers_to_manager_rx.recv() => {
                    match msg {
                        PeersToManagerMsg::Receive(key, session, msg) => {
                            self.handle_peer_message(key, session, msg).await;
                        }
                        PeersToManagerMsg::Error(key, session) => {
                            self.handle_peer_error(key, session).await;
                        }
                    }
                }
                Some(msg) = self.tracker_to_manager_rx.recv() => {
                    match msg {
                        TrackerToManagerMsg::Receive(generation, msg) if generation == self.tracker_generation => {
                            self.handle_tracker_message(msg).await;
                        }
                        TrackerToManagerMsg::Disconnected(generation) if generation == self.tracker_generation => {
                            self.handle_tracker_disconnected();
                        }
                        _ => log::trace!("ignoring message from a previous tracker connection"),
                    }
                }
                Some(event) = self.rtc_events_rx.recv() => {
                    self.handle_rtc_event(event).await;
                }
                Some(msg) = self.tasks_rx.recv() => {
                    self.handle_task_msg(msg).await;
                }
                Some(()) = tick_rx.recv() => {
                    self.handle_ticker().await;
                }
                command = self.commands_rx.recv() => {
                    match command {
                        Some(SwarmCommand::Shutdown { reply }) => {
                            self.disconnect().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            log::info!("every swarm handle was dropped, shutting down");
                            self.disconnect().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    fn emit(&mut self, event: SwarmEvent) {
        log::debug!("event {}", event.name());
        self.events.emit(event);
    }

    fn new_session_id(&mut self) -> SessionId {
        self.next_session += 1;
        self.next_session
    }

    async fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::CreateAndSeed {
                payload,
                mime_type,
                metadata,
                reply,
            } => self.create_and_seed(payload, mime_type, metadata, reply),
            SwarmCommand::StartLeeching { resource_id, reply } => {
                self.start_leeching(resource_id, reply)
            }
            SwarmCommand::Snapshot { resource_id, reply } => {
                let _ = reply.send(self.snapshot(resource_id));
            }
            SwarmCommand::AssembledPayload { resource_id, reply } => {
                let payload = self
                    .transfers
                    .get(&resource_id)
                    .and_then(|t| t.assembled.clone());
                let _ = reply.send(payload);
            }
            SwarmCommand::Cancel { resource_id, reply } => {
                let cancelled = self.cancel(resource_id).await;
                let _ = reply.send(cancelled);
            }
            SwarmCommand::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            SwarmCommand::Shutdown { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_task_msg(&mut self, msg: TaskMsg) {
        match msg {
            TaskMsg::ResourceCreated {
                manifest,
                payload,
                result,
                reply,
            } => self.finish_create(manifest, payload, result, reply).await,
            TaskMsg::ManifestFetched {
                resource_id,
                result,
                reply,
            } => self.begin_leeching(resource_id, result, reply).await,
            TaskMsg::SwarmPeersFetched { resource_id, peers } => {
                self.discover_peers(resource_id, peers).await
            }
            TaskMsg::TrackerReconnecting { attempt, delay } => {
                self.emit(SwarmEvent::TrackerReconnecting { attempt, delay })
            }
            TaskMsg::TrackerConnected(channel) => {
                self.tracker_reconnecting = false;
                self.attach_tracker(channel).await;
            }
            TaskMsg::TrackerLost(e) => {
                self.tracker_reconnecting = false;
                let failure = Failure::classify(&e);
                log::error!("giving up on the tracker: {failure}");
                self.emit(SwarmEvent::TrackerConnectionLost { failure });
            }
        }
    }

    // seeding

    fn create_and_seed(
        &mut self,
        payload: Vec<u8>,
        mime_type: String,
        metadata: ResourceMetadata,
        reply: oneshot::Sender<Result<ResourceId, Failure>>,
    ) {
        let title = metadata.title.clone();
        self.emit(SwarmEvent::CreateResourceStart {
            title: title.clone(),
        });
        let manifest = match self.build_manifest(&payload, mime_type, metadata) {
            Ok(manifest) => manifest,
            Err(e) => {
                let failure = Failure::classify(&e);
                log::warn!("could not create resource {title:?}: {failure}");
                self.emit(SwarmEvent::CreateResourceError {
                    title,
                    failure: failure.clone(),
                });
                let _ = reply.send(Err(failure));
                return;
            }
        };
        log::info!("registering resource\n{manifest}");

        let payload = Arc::new(payload);
        let registry = self.registry.clone();
        let tasks_tx = self.tasks_tx.clone();
        let uploader_id = self.config.participant_id;
        tokio::spawn(async move {
            let result = registry
                .create_resource(manifest.clone(), payload.clone(), uploader_id)
                .await;
            let _ = tasks_tx
                .send(TaskMsg::ResourceCreated {
                    manifest,
                    payload,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn build_manifest(
        &self,
        payload: &[u8],
        mime_type: String,
        metadata: ResourceMetadata,
    ) -> Result<Manifest> {
        if payload.is_empty() {
            bail!(InvalidInputError("cannot share an empty payload".to_string()));
        }
        if self.config.piece_size > MAX_PIECE_SIZE_B {
            bail!(InvalidInputError(format!(
                "piece size {} is over the {MAX_PIECE_SIZE_B} bytes a peer frame can carry",
                self.config.piece_size
            )));
        }
        Manifest::from_payload(payload, self.config.piece_size, mime_type, metadata)
    }

    async fn finish_create(
        &mut self,
        manifest: Manifest,
        payload: Arc<Vec<u8>>,
        result: Result<ResourceId>,
        reply: oneshot::Sender<Result<ResourceId, Failure>>,
    ) {
        let title = manifest.metadata.title.clone();
        let resource_id = match result {
            Ok(resource_id) => resource_id,
            Err(e) => {
                let failure = Failure::classify(&e);
                log::error!("registry refused resource {title:?}: {failure}");
                self.emit(SwarmEvent::CreateResourceError {
                    title,
                    failure: failure.clone(),
                });
                let _ = reply.send(Err(failure));
                return;
            }
        };
        let store = match PieceStore::from_payload(&payload, manifest.piece_size) {
            Ok(store) => store,
            Err(e) => {
                let failure = Failure::classify(&e);
                log::error!("could not seed resource {resource_id}: {failure}");
                self.emit(SwarmEvent::SeedingError {
                    resource_id,
                    failure: failure.clone(),
                });
                let _ = reply.send(Err(failure));
                return;
            }
        };
        let mut transfer = Transfer::new(manifest, TransferStatus::Seeding, store, &self.config);
        transfer.assembled = Some(payload);
        self.transfers.insert(resource_id, transfer);
        log::info!("created resource {resource_id} ({title:?}), seeding");

        self.emit(SwarmEvent::CreateResourceSuccess { resource_id, title });
        self.announce(resource_id).await;
        self.emit(SwarmEvent::SeedingStarted { resource_id });
        let _ = reply.send(Ok(resource_id));
    }

    // leeching

    fn start_leeching(&mut self, resource_id: ResourceId, reply: oneshot::Sender<Result<(), Failure>>) {
        match self.transfers.get(&resource_id).map(|t| t.status) {
            Some(TransferStatus::Failed) => {
                log::info!("restarting failed transfer of resource {resource_id}");
                self.transfers.remove(&resource_id);
            }
            Some(status) => {
                log::debug!("resource {resource_id} is already transferring ({status:?})");
                let _ = reply.send(Ok(()));
                return;
            }
            None => {}
        }
        self.emit(SwarmEvent::LeechStart { resource_id });

        let registry = self.registry.clone();
        let tasks_tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let result = fetch_manifest_and_peers(&registry, resource_id).await;
            let _ = tasks_tx
                .send(TaskMsg::ManifestFetched {
                    resource_id,
                    result,
                    reply,
                })
                .await;
        });
    }

    async fn begin_leeching(
        &mut self,
        resource_id: ResourceId,
        result: Result<(Manifest, Vec<SwarmPeer>)>,
        reply: oneshot::Sender<Result<(), Failure>>,
    ) {
        let (manifest, swarm_peers) = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                let failure = Failure::classify(&e);
                log::error!("could not leech resource {resource_id}: {failure}");
                self.emit(SwarmEvent::LeechError {
                    resource_id,
                    failure: failure.clone(),
                });
                let _ = reply.send(Err(failure));
                return;
            }
        };
        if self.transfers.contains_key(&resource_id) {
            let _ = reply.send(Ok(()));
            return;
        }
        log::info!("leeching resource {resource_id}\n{manifest}");

        let title = manifest.metadata.title.clone();
        let total_size = manifest.total_size;
        let piece_count = manifest.piece_count();
        let store = PieceStore::new(total_size, manifest.piece_size, manifest.piece_hashes.clone());
        let transfer = Transfer::new(manifest, TransferStatus::Leeching, store, &self.config);
        self.transfers.insert(resource_id, transfer);

        self.emit(SwarmEvent::LeechStarted {
            resource_id,
            title,
            total_size,
            piece_count,
        });
        self.announce(resource_id).await;
        let _ = reply.send(Ok(()));

        if piece_count == 0 {
            self.check_completion(resource_id).await;
            return;
        }
        self.discover_peers(resource_id, swarm_peers).await;
    }

    /// Opens sessions to the candidates that can serve `resource_id`, while under the
    /// peer limit.
    async fn discover_peers(&mut self, resource_id: ResourceId, candidates: Vec<SwarmPeer>) {
        match self.transfers.get(&resource_id) {
            Some(transfer) if transfer.status == TransferStatus::Leeching => {}
            _ => return,
        }
        for candidate in candidates {
            let participant = candidate.user_id;
            if !matches!(
                candidate.status,
                AnnounceStatus::Seeding | AnnounceStatus::Completed
            ) || participant == self.config.participant_id
                || self.peers.contains_key(&(participant, resource_id))
            {
                continue;
            }
            if self.peers.len() >= self.config.max_peers {
                log::debug!("max peers reached, not contacting participant {participant}");
                break;
            }
            self.initiate_session(participant, resource_id).await;
        }
    }

    async fn initiate_session(&mut self, participant: ParticipantId, resource_id: ResourceId) {
        if self.tracker_tx.is_none() {
            log::debug!("no tracker connection to reach participant {participant}");
            return;
        }
        let offer = match self.engine.create_offer(participant, resource_id) {
            Ok(offer) => offer,
            Err(e) => {
                let failure = Failure::classify(&e);
                log::warn!("could not create an offer for participant {participant}: {failure}");
                self.emit(SwarmEvent::PeerFailed {
                    participant,
                    resource_id,
                    failure,
                });
                return;
            }
        };
        let session = self.new_session_id();
        log::debug!("offering session {session} to participant {participant} for resource {resource_id}");
        self.peers.insert(
            (participant, resource_id),
            Peer::new(participant, resource_id, session, true),
        );
        self.relay_signal(participant, resource_id, SignalKind::Offer, offer)
            .await;
    }

    // tracker

    async fn attach_tracker(&mut self, channel: FrameChannel) {
        self.tracker_generation += 1;
        let FrameChannel { tx, rx } = channel;
        self.tracker_tx = Some(tx);
        tokio::spawn(tracker_msg_handler(
            self.tracker_generation,
            rx,
            self.tracker_to_manager_tx.clone(),
        ));
        log::info!("tracker connected");
        self.emit(SwarmEvent::TrackerConnected);

        let resource_ids: Vec<ResourceId> = self.transfers.keys().copied().collect();
        for resource_id in resource_ids {
            self.announce(resource_id).await;
        }
    }

    fn handle_tracker_disconnected(&mut self) {
        log::warn!("tracker connection lost");
        self.tracker_tx = None;
        self.emit(SwarmEvent::TrackerDisconnected);
        self.start_reconnect();
    }

    fn start_reconnect(&mut self) {
        if self.tracker_reconnecting {
            return;
        }
        self.tracker_reconnecting = true;
        let connector = self.connector.clone();
        let participant_id = self.config.participant_id;
        let mut backoff = self.config.backoff.clone();
        backoff.reset();
        let tasks_tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let attempts_tx = tasks_tx.clone();
            let result = tracker::reconnect(&connector, participant_id, backoff, |attempt, delay| {
                let _ = attempts_tx.try_send(TaskMsg::TrackerReconnecting { attempt, delay });
            })
            .await;
            let msg = match result {
                Ok(channel) => TaskMsg::TrackerConnected(channel),
                Err(e) => TaskMsg::TrackerLost(e),
            };
            let _ = tasks_tx.send(msg).await;
        });
    }

    async fn send_to_tracker(&mut self, msg: TrackerMessage) -> bool {
        let Some(tracker_tx) = &self.tracker_tx else {
            log::debug!("not connected to the tracker, dropping {msg}");
            return false;
        };
        let frame = match wire_protocol::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("could not encode {msg}: {e}");
                return false;
            }
        };
        log::trace!("sending to tracker: {msg}");
        tracker_tx.send(frame).await.is_ok()
    }

    /// Announces the current status and progress of a transfer.
    async fn announce(&mut self, resource_id: ResourceId) {
        let Some(transfer) = self.transfers.get(&resource_id) else {
            return;
        };
        let status = match transfer.status {
            TransferStatus::Leeching => AnnounceStatus::Leeching,
            TransferStatus::Seeding => AnnounceStatus::Seeding,
            TransferStatus::Completed => AnnounceStatus::Completed,
            TransferStatus::Failed => return,
        };
        let progress = transfer.progress();
        let event = if transfer.announced {
            AnnounceEvent::Update
        } else {
            AnnounceEvent::Started
        };
        let msg = TrackerMessage::PeerAnnounce {
            user_id: self.config.participant_id,
            resource_id,
            status: Some(status),
            progress,
            event: Some(event),
            peers: Vec::new(),
        };
        if self.send_to_tracker(msg).await {
            if let Some(transfer) = self.transfers.get_mut(&resource_id) {
                transfer.announced = true;
                transfer.announced_progress = progress;
            }
        }
    }

    async fn relay_signal(
        &mut self,
        target: ParticipantId,
        resource_id: ResourceId,
        kind: SignalKind,
        payload: SignalPayload,
    ) {
        let user_id = self.config.participant_id;
        let msg = match kind {
            SignalKind::Offer => TrackerMessage::Offer {
                user_id,
                target_user_id: target,
                resource_id,
                payload,
            },
            SignalKind::Answer => TrackerMessage::Answer {
                user_id,
                target_user_id: target,
                resource_id,
                payload,
            },
            SignalKind::IceCandidate => TrackerMessage::IceCandidate {
                user_id,
                target_user_id: target,
                resource_id,
                payload,
            },
        };
        self.send_to_tracker(msg).await;
    }

    async fn handle_tracker_message(&mut self, msg: TrackerMessage) {
        log::trace!("received from tracker: {msg}");
        let own_id = self.config.participant_id;
        match msg {
            TrackerMessage::PeerAnnounce {
                user_id,
                resource_id,
                status,
                progress,
                peers,
                ..
            } => {
                let mut candidates = peers;
                if let (Some(status), true) = (status, user_id != own_id) {
                    candidates.push(SwarmPeer {
                        user_id,
                        username: String::new(),
                        status,
                        progress,
                    });
                }
                self.discover_peers(resource_id, candidates).await;
            }
            TrackerMessage::SwarmUpdate {
                resource_id,
                peers,
                swarm_stats,
            } => {
                if let Some(stats) = swarm_stats {
                    log::debug!(
                        "swarm of resource {resource_id}: {} seeders, {} leechers, {} completed",
                        stats.seeders,
                        stats.leechers,
                        stats.completed
                    );
                }
                self.discover_peers(resource_id, peers).await;
            }
            TrackerMessage::PeerConnect { user_id } => {
                log::debug!("participant {user_id} joined the tracker");
            }
            TrackerMessage::PeerDisconnect { user_id } => {
                let sessions: Vec<PeerKey> = self
                    .peers
                    .keys()
                    .filter(|(participant, _)| *participant == user_id)
                    .copied()
                    .collect();
                if !sessions.is_empty() {
                    log::debug!("participant {user_id} left the tracker, closing {} sessions", sessions.len());
                }
                for key in sessions {
                    self.remove_peer(key, PeerState::Disconnected).await;
                }
            }
            TrackerMessage::Offer {
                user_id,
                target_user_id,
                resource_id,
                payload,
            } if target_user_id == own_id => {
                self.handle_offer(user_id, resource_id, payload).await;
            }
            TrackerMessage::Answer {
                user_id,
                target_user_id,
                resource_id,
                payload,
            } if target_user_id == own_id => {
                self.handle_answer((user_id, resource_id), payload).await;
            }
            TrackerMessage::IceCandidate {
                user_id,
                target_user_id,
                resource_id,
                payload,
            } if target_user_id == own_id => {
                if !self.peers.contains_key(&(user_id, resource_id)) {
                    return;
                }
                if let Err(e) = self.engine.add_ice_candidate(user_id, resource_id, payload) {
                    log::debug!("dropping candidate from participant {user_id}: {e:#}");
                }
            }
            msg => log::debug!("ignoring signalling not meant for us: {msg}"),
        }
    }

    async fn handle_offer(&mut self, from: ParticipantId, resource_id: ResourceId, offer: SignalPayload) {
        if !self.transfers.contains_key(&resource_id) {
            log::debug!("ignoring offer from participant {from} for unknown resource {resource_id}");
            return;
        }
        let key = (from, resource_id);
        if let Some(existing) = self.peers.get(&key) {
            // both sides offered at once: the offer of the lower id wins
            let ours_loses = existing.state == PeerState::Negotiating
                && existing.initiator
                && from < self.config.participant_id;
            if !ours_loses {
                log::debug!("ignoring offer from participant {from}: a session for resource {resource_id} already exists");
                return;
            }
            self.engine.close(from, resource_id);
            self.peers.remove(&key);
        } else if self.peers.len() >= self.config.max_peers {
            log::debug!("ignoring offer from participant {from}: max peers reached");
            return;
        }

        match self.engine.accept_offer(from, resource_id, offer) {
            Ok(answer) => {
                let session = self.new_session_id();
                log::debug!("answering participant {from} for resource {resource_id} (session {session})");
                self.peers
                    .insert(key, Peer::new(from, resource_id, session, false));
                self.relay_signal(from, resource_id, SignalKind::Answer, answer)
                    .await;
            }
            Err(e) => {
                let failure = Failure::classify(&e);
                log::warn!("could not answer participant {from}: {failure}");
                self.emit(SwarmEvent::PeerFailed {
                    participant: from,
                    resource_id,
                    failure,
                });
            }
        }
    }

    async fn handle_answer(&mut self, key: PeerKey, answer: SignalPayload) {
        let (from, resource_id) = key;
        match self.peers.get(&key) {
            Some(peer) if peer.initiator && peer.state == PeerState::Negotiating => {}
            _ => {
                log::debug!("ignoring unexpected answer from participant {from} for resource {resource_id}");
                return;
            }
        }
        if let Err(e) = self.engine.accept_answer(from, resource_id, answer) {
            self.fail_negotiation(key, Failure::classify(&e)).await;
        }
    }

    // rtc

    async fn handle_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::LocalCandidate {
                remote,
                resource_id,
                payload,
            } => {
                if !self.peers.contains_key(&(remote, resource_id)) {
                    return;
                }
                self.relay_signal(remote, resource_id, SignalKind::IceCandidate, payload)
                    .await;
            }
            RtcEvent::ChannelOpen {
                remote,
                resource_id,
                channel,
            } => {
                self.handle_channel_open((remote, resource_id), channel).await;
            }
            RtcEvent::ConnectionState {
                remote,
                resource_id,
                state,
            } => {
                let key = (remote, resource_id);
                let Some(peer) = self.peers.get(&key) else {
                    return;
                };
                let negotiating = peer.state == PeerState::Negotiating;
                match state {
                    ConnectionState::Failed if negotiating => {
                        let error = anyhow::Error::new(NegotiationFailure {
                            participant: remote,
                            reason: "transport reported failure".to_string(),
                        });
                        self.fail_negotiation(key, Failure::classify(&error)).await;
                    }
                    ConnectionState::Failed => {
                        self.emit(SwarmEvent::PeerFailed {
                            participant: remote,
                            resource_id,
                            failure: Failure::new(FailureKind::Other, "transport failed"),
                        });
                        self.remove_peer(key, PeerState::Failed).await;
                    }
                    ConnectionState::Disconnected => {
                        self.remove_peer(key, PeerState::Disconnected).await;
                    }
                }
            }
        }
    }

    async fn handle_channel_open(&mut self, key: PeerKey, channel: FrameChannel) {
        let (remote, resource_id) = key;
        let Some(peer) = self.peers.get_mut(&key) else {
            log::debug!("dropping channel from participant {remote} for resource {resource_id}: no session");
            return;
        };
        if peer.state != PeerState::Negotiating {
            log::debug!("dropping extra channel from participant {remote} for resource {resource_id}");
            return;
        }
        let (to_peer_tx, to_peer_rx) = mpsc::channel(TO_PEER_CHANNEL_CAPACITY);
        peer::start_peer_msg_handlers(
            key,
            peer.session,
            channel,
            self.peers_to_manager_tx.clone(),
            to_peer_rx,
        );
        peer.connected(to_peer_tx);

        let owned = match self.transfers.get_mut(&resource_id) {
            Some(transfer) => {
                transfer.peers.insert(remote);
                transfer.store.owned_pieces()
            }
            None => Vec::new(),
        };
        log::info!("connected to participant {remote} for resource {resource_id}");
        self.emit(SwarmEvent::PeerConnected {
            participant: remote,
            resource_id,
        });
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.send(PeerMessage::Bitfield { indices: owned }).await;
        }
        self.send_pieces_reqs(resource_id).await;
    }

    async fn fail_negotiation(&mut self, key: PeerKey, failure: Failure) {
        let (participant, resource_id) = key;
        log::warn!("dropping participant {participant} for resource {resource_id}: {failure}");
        self.emit(SwarmEvent::PeerFailed {
            participant,
            resource_id,
            failure,
        });
        self.remove_peer(key, PeerState::Failed).await;
    }

    /// Closes the session and hands its outstanding requests back to the pool.
    async fn remove_peer(&mut self, key: PeerKey, state: PeerState) {
        let Some(mut peer) = self.peers.remove(&key) else {
            return;
        };
        let (participant, resource_id) = key;
        let was_connected = peer.is_connected();
        peer.state = state;
        peer.close();
        self.engine.close(participant, resource_id);
        log::debug!(
            "session {} with participant {participant} for resource {resource_id} ended: {:?}",
            peer.session,
            peer.state
        );

        if let Some(transfer) = self.transfers.get_mut(&resource_id) {
            transfer.peers.remove(&participant);
            let released = transfer.requestor.remove_assignments_to_peer(participant);
            if !released.is_empty() {
                log::debug!(
                    "released {} requests assigned to participant {participant}",
                    released.len()
                );
            }
        }
        if was_connected {
            log::info!("participant {participant} disconnected from resource {resource_id}");
            self.emit(SwarmEvent::PeerDisconnected {
                participant,
                resource_id,
            });
        }
        self.send_pieces_reqs(resource_id).await;
    }

    // peer messages

    async fn handle_peer_error(&mut self, key: PeerKey, session: SessionId) {
        match self.peers.get(&key) {
            Some(peer) if peer.session == session => {
                self.remove_peer(key, PeerState::Disconnected).await;
            }
            _ => log::trace!("error from an already closed session with participant {}", key.0),
        }
    }

    async fn handle_peer_message(&mut self, key: PeerKey, session: SessionId, msg: PeerMessage) {
        let participant = key.0;
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.session != session {
            log::trace!("dropping {msg} from a closed session with participant {participant}");
            return;
        }
        log::trace!("received from participant {participant}: {msg}");

        match msg {
            PeerMessage::PieceRequest {
                resource_id,
                piece_index,
            } => {
                self.handle_piece_request(key, resource_id, piece_index)
                    .await;
            }
            PeerMessage::PieceResponse {
                resource_id,
                piece_index,
                piece_data,
            } => {
                self.handle_piece_response(participant, resource_id, piece_index, piece_data)
                    .await;
                self.send_pieces_reqs(resource_id).await;
            }
            PeerMessage::Bitfield { indices } => {
                peer.set_bitfield(indices);
                log::debug!(
                    "participant {participant} holds {} pieces of resource {}",
                    peer.known_pieces(),
                    key.1
                );
                self.send_pieces_reqs(key.1).await;
            }
            PeerMessage::Have { piece_index } => {
                peer.add_have(piece_index);
                self.send_pieces_reqs(key.1).await;
            }
        }
    }

    async fn handle_piece_request(&mut self, key: PeerKey, resource_id: ResourceId, piece_index: usize) {
        let participant = key.0;
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            log::debug!("participant {participant} asked for unknown resource {resource_id}");
            return;
        };
        let piece_data = match transfer.store.read_piece(piece_index) {
            Ok(data) => data.to_vec(),
            Err(e) => {
                log::debug!("not serving piece {piece_index} of resource {resource_id} to participant {participant}: {e}");
                return;
            }
        };
        transfer.bandwidth.add_uploaded_bytes(piece_data.len() as u64);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.send(PeerMessage::PieceResponse {
                resource_id,
                piece_index,
                piece_data,
            })
            .await;
        }
    }

    /// Only bytes matching the manifest digest are stored. Anything else is dropped, and
    /// charged as a failed attempt for that piece when it came from the peer it was requested to.
    async fn handle_piece_response(
        &mut self,
        participant: ParticipantId,
        resource_id: ResourceId,
        piece_index: usize,
        piece_data: Vec<u8>,
    ) {
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            log::debug!("discarding piece {piece_index} of unknown resource {resource_id}");
            return;
        };
        if transfer.status != TransferStatus::Leeching {
            log::debug!("discarding piece {piece_index} of resource {resource_id}: not leeching");
            return;
        }
        if piece_index >= transfer.store.num_pieces() {
            log::warn!("participant {participant} sent out of range piece {piece_index} of resource {resource_id}");
            return;
        }
        let len = piece_data.len() as u64;
        match transfer.store.write_piece(piece_index, piece_data) {
            Ok(true) => {
                transfer.requestor.piece_request_completed(piece_index);
                transfer.bandwidth.add_downloaded_bytes(len);
                let progress = transfer.progress();
                log::debug!("verified piece {piece_index} of resource {resource_id} from participant {participant} ({progress:.1}%)");
                self.emit(SwarmEvent::PieceDownloaded {
                    resource_id,
                    piece_index,
                    progress,
                });
                self.broadcast_have(resource_id, piece_index, participant)
                    .await;
                self.check_completion(resource_id).await;
            }
            Ok(false) => {
                transfer.requestor.piece_request_completed(piece_index);
            }
            Err(e) => {
                let failure = Failure::classify(&e);
                let mut exhausted = false;
                if transfer.requestor.assigned_to(piece_index) == Some(participant) {
                    exhausted = transfer
                        .requestor
                        .piece_request_failed(piece_index, participant);
                    log::warn!(
                        "bad piece from participant {participant} (attempt {}): {failure}",
                        transfer.requestor.failed_attempts(piece_index)
                    );
                } else {
                    log::warn!("bad piece {piece_index} from participant {participant}, which was not asked for it: {failure}");
                }
                let attempts = transfer.requestor.failed_attempts(piece_index);
                self.emit(SwarmEvent::PieceIntegrityFailed {
                    resource_id,
                    piece_index,
                    participant,
                    failure,
                });
                if exhausted {
                    self.fail_transfer(
                        resource_id,
                        Failure::new(
                            FailureKind::PieceIntegrity,
                            format!("piece {piece_index} failed verification {attempts} times"),
                        ),
                    );
                }
            }
        }
    }

    async fn broadcast_have(&mut self, resource_id: ResourceId, piece_index: usize, source: ParticipantId) {
        for peer in self.peers.values_mut().filter(|p| {
            p.resource_id == resource_id && p.is_connected() && p.participant_id != source
        }) {
            peer.send(PeerMessage::Have { piece_index }).await;
        }
    }

    /// Assembles the payload once every piece is owned, then turns the transfer into a seed.
    async fn check_completion(&mut self, resource_id: ResourceId) {
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            return;
        };
        if transfer.status != TransferStatus::Leeching || !transfer.store.completed() {
            return;
        }
        transfer.requestor.clear();
        match transfer.store.assemble(&transfer.manifest.content_digest) {
            Ok(payload) => {
                let size = payload.len() as u64;
                transfer.assembled = Some(Arc::new(payload));
                transfer.status = TransferStatus::Completed;
                log::info!(
                    "resource {resource_id} complete ({}) in {:?}",
                    pretty_size(size as f64),
                    transfer.started_at.elapsed()
                );
                self.emit(SwarmEvent::DownloadComplete { resource_id, size });
                self.announce(resource_id).await;

                if let Some(transfer) = self.transfers.get_mut(&resource_id) {
                    transfer.status = TransferStatus::Seeding;
                }
                self.announce(resource_id).await;
                self.emit(SwarmEvent::SeedingStarted { resource_id });
            }
            Err(e) => {
                transfer.status = TransferStatus::Failed;
                let failure = Failure::classify(&e);
                log::error!("could not assemble resource {resource_id}: {failure}");
                self.emit(SwarmEvent::DownloadCompleteError {
                    resource_id,
                    failure,
                });
            }
        }
    }

    fn fail_transfer(&mut self, resource_id: ResourceId, failure: Failure) {
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            return;
        };
        transfer.status = TransferStatus::Failed;
        transfer.requestor.clear();
        log::error!("transfer of resource {resource_id} failed: {failure}");
        self.emit(SwarmEvent::TransferFailed {
            resource_id,
            failure,
        });
    }

    fn connected_peers(&self, resource_id: ResourceId) -> Vec<ParticipantId> {
        let mut connected: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.resource_id == resource_id && p.is_connected())
            .collect();
        connected.sort_by_key(|p| (p.connected_at, p.participant_id));
        connected.iter().map(|p| p.participant_id).collect()
    }

    async fn send_pieces_reqs(&mut self, resource_id: ResourceId) {
        let peer_order = self.connected_peers(resource_id);
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            return;
        };
        if transfer.status != TransferStatus::Leeching {
            return;
        }
        let missing = transfer.store.missing_pieces();
        let peers = &self.peers;
        let requests = transfer
            .requestor
            .generate_requests_to_send(&missing, &peer_order, |participant, piece_idx| {
                peers
                    .get(&(participant, resource_id))
                    .is_some_and(|p| p.have_piece(piece_idx))
            });
        for (participant, piece_index) in requests {
            log::trace!("requesting piece {piece_index} of resource {resource_id} to participant {participant}");
            if let Some(peer) = self.peers.get_mut(&(participant, resource_id)) {
                peer.send(PeerMessage::PieceRequest {
                    resource_id,
                    piece_index,
                })
                .await;
            }
        }
    }

    // tick

    async fn handle_ticker(&mut self) {
        for transfer in self.transfers.values_mut() {
            transfer.bandwidth.update();
        }
        self.log_stats();

        let now = Instant::now();
        let expired: Vec<PeerKey> = self
            .peers
            .values()
            .filter(|p| {
                p.state == PeerState::Negotiating
                    && now.duration_since(p.negotiation_started) >= self.config.negotiation_timeout
            })
            .map(Peer::key)
            .collect();
        for key in expired {
            let error = anyhow::Error::new(NegotiationFailure {
                participant: key.0,
                reason: format!("not connected after {:?}", self.config.negotiation_timeout),
            });
            self.fail_negotiation(key, Failure::classify(&error)).await;
        }

        let resource_ids: Vec<ResourceId> = self.transfers.keys().copied().collect();
        for resource_id in resource_ids {
            self.retry_stale_requests(resource_id);
            self.refresh_swarm(resource_id);
            let progressed = self.transfers.get(&resource_id).is_some_and(|t| {
                t.status == TransferStatus::Leeching && t.progress() != t.announced_progress
            });
            if progressed {
                self.announce(resource_id).await;
            }
            self.send_pieces_reqs(resource_id).await;
        }
    }

    fn log_stats(&self) {
        for (resource_id, transfer) in self.transfers.iter() {
            let stats = format!(
                "resource {resource_id} [{:?}]: {}/{} pieces ({}/{}), {} peers, {} requests in flight, {}",
                transfer.status,
                transfer.store.completed_pieces(),
                transfer.store.num_pieces(),
                pretty_size(transfer.store.owned_bytes() as f64),
                pretty_size(transfer.manifest.total_size as f64),
                transfer.peers.len(),
                transfer.requestor.outstanding_count(),
                transfer.bandwidth,
            );
            if transfer.status == TransferStatus::Leeching {
                log::info!("{stats}");
            } else {
                log::debug!("{stats}");
            }
        }
        if self.peers_to_manager_tx.capacity() < PEERS_TO_MANAGER_CHANNEL_CAPACITY / 10 {
            log::warn!(
                "peers_to_manager channel almost full: {} free slots",
                self.peers_to_manager_tx.capacity()
            );
        }
    }

    fn retry_stale_requests(&mut self, resource_id: ResourceId) {
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            return;
        };
        if transfer.status != TransferStatus::Leeching {
            return;
        }
        let mut exhausted = None;
        for (piece_idx, participant) in transfer.requestor.stale_requests(self.config.request_timeout) {
            log::debug!("request for piece {piece_idx} of resource {resource_id} to participant {participant} timed out");
            if transfer.requestor.piece_request_failed(piece_idx, participant) {
                exhausted = Some(piece_idx);
            }
        }
        if let Some(piece_idx) = exhausted {
            let failure = Failure::new(
                FailureKind::Other,
                format!(
                    "piece {piece_idx} timed out {} times",
                    self.config.max_piece_attempts
                ),
            );
            self.fail_transfer(resource_id, failure);
        }
    }

    /// Asks the registry again for sources when a leecher has nobody to talk to.
    fn refresh_swarm(&mut self, resource_id: ResourceId) {
        let has_sessions = self.peers.keys().any(|(_, id)| *id == resource_id);
        let Some(transfer) = self.transfers.get_mut(&resource_id) else {
            return;
        };
        if transfer.status != TransferStatus::Leeching
            || has_sessions
            || transfer.last_discovery.elapsed() < PEER_DISCOVERY_INTERVAL
        {
            return;
        }
        transfer.last_discovery = Instant::now();
        log::debug!("no peers for resource {resource_id}, asking the registry again");
        let registry = self.registry.clone();
        let tasks_tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            match registry.fetch_swarm_peers(resource_id).await {
                Ok(peers) => {
                    let _ = tasks_tx
                        .send(TaskMsg::SwarmPeersFetched { resource_id, peers })
                        .await;
                }
                Err(e) => log::warn!("could not fetch swarm peers of resource {resource_id}: {e:#}"),
            }
        });
    }

    // lifecycle

    fn snapshot(&self, resource_id: ResourceId) -> Option<TransferSnapshot> {
        let transfer = self.transfers.get(&resource_id)?;
        Some(TransferSnapshot {
            resource_id,
            title: transfer.manifest.metadata.title.clone(),
            status: transfer.status,
            total_size: transfer.manifest.total_size,
            piece_count: transfer.store.num_pieces(),
            owned_pieces: transfer.store.completed_pieces(),
            owned_bytes: transfer.store.owned_bytes(),
            downloaded_bytes: transfer.bandwidth.downloaded_bytes(),
            uploaded_bytes: transfer.bandwidth.uploaded_bytes(),
            peers: self.connected_peers(resource_id),
        })
    }

    /// Forgets the transfer; responses still in flight for it are dropped on arrival.
    async fn cancel(&mut self, resource_id: ResourceId) -> bool {
        let Some(transfer) = self.transfers.remove(&resource_id) else {
            return false;
        };
        log::info!(
            "cancelled transfer of resource {resource_id} ({:?})",
            transfer.status
        );
        let scoped: Vec<PeerKey> = self
            .peers
            .keys()
            .filter(|(_, id)| *id == resource_id)
            .copied()
            .collect();
        for key in scoped {
            self.remove_peer(key, PeerState::Disconnected).await;
        }
        true
    }

    async fn disconnect(&mut self) {
        let sessions: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in sessions {
            self.remove_peer(key, PeerState::Disconnected).await;
        }
        self.tracker_tx = None;
        self.tracker_generation += 1; // whatever the old connection still delivers is ignored
        log::info!("disconnected from the swarm");
    }
}

enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

async fn fetch_manifest_and_peers<R: ResourceRegistry>(
    registry: &R,
    resource_id: ResourceId,
) -> Result<(Manifest, Vec<SwarmPeer>)> {
    let manifest = registry.fetch_manifest(resource_id).await?;
    manifest
        .validate()
        .context(ResourceNotFoundError(resource_id))?;
    let peers = match registry.fetch_swarm_peers(resource_id).await {
        Ok(peers) => peers,
        Err(e) => {
            log::warn!("could not fetch swarm peers of resource {resource_id}: {e:#}");
            Vec::new()
        }
    };
    Ok((manifest, peers))
}

async fn tracker_msg_handler(
    generation: u64,
    mut rx: Receiver<String>,
    tracker_to_manager_tx: Sender<TrackerToManagerMsg>,
) {
    loop {
        let received: Result<TrackerMessage> = rx.receive().await;
        match received {
            Ok(msg) => {
                if tracker_to_manager_tx
                    .send(TrackerToManagerMsg::Receive(generation, msg))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                if let Some(ProtocolError::Malformed(reason)) = e.downcast_ref::<ProtocolError>() {
                    log::warn!("dropping malformed tracker frame: {reason}");
                    continue;
                }
                log::debug!("tracker channel closed: {e}");
                let _ = tracker_to_manager_tx
                    .send(TrackerToManagerMsg::Disconnected(generation))
                    .await;
                return;
            }
        }
    }
}
