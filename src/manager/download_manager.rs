use std::{
    collections::{HashMap, HashSet, VecDeque},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    time::Instant,
};

use crate::{
    manager::{
        events::{EventBus, Failure, FailureKind, SwarmEvent},
        swarm_manager::{SwarmHandle, TransferSnapshot, TransferStatus},
    },
    metadata::manifest::ResourceId,
    protocol::ParticipantId,
    util::{pretty_size, start_tick},
};

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The part of the swarm the download manager drives.
#[trait_variant::make(Send)]
pub trait SwarmControl {
    async fn start_leeching(&self, resource_id: ResourceId) -> Result<(), Failure>;
    async fn snapshot(&self, resource_id: ResourceId) -> Option<TransferSnapshot>;
    async fn assembled_payload(&self, resource_id: ResourceId) -> Option<Arc<Vec<u8>>>;
    async fn cancel(&self, resource_id: ResourceId) -> bool;
}

impl SwarmControl for SwarmHandle {
    async fn start_leeching(&self, resource_id: ResourceId) -> Result<(), Failure> {
        SwarmHandle::start_leeching(self, resource_id).await
    }

    async fn snapshot(&self, resource_id: ResourceId) -> Option<TransferSnapshot> {
        SwarmHandle::snapshot(self, resource_id).await
    }

    async fn assembled_payload(&self, resource_id: ResourceId) -> Option<Arc<Vec<u8>>> {
        SwarmHandle::assembled_payload(self, resource_id).await
    }

    async fn cancel(&self, resource_id: ResourceId) -> bool {
        SwarmHandle::cancel(self, resource_id).await
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            max_concurrent: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub resource_id: ResourceId,
    pub title: String,
    pub file_name: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub piece_count: usize,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub speed: f64, // B/s since the download started
    pub peers: HashSet<ParticipantId>,
    pub error: Option<Failure>,
    pub started_at: Instant,
}

impl Download {
    fn new(resource_id: ResourceId) -> Self {
        Download {
            resource_id,
            title: String::new(),
            file_name: String::new(),
            status: DownloadStatus::Downloading,
            total_size: 0,
            piece_count: 0,
            progress: 0.,
            downloaded_bytes: 0,
            speed: 0.,
            peers: HashSet::new(),
            error: None,
            started_at: Instant::now(),
        }
    }

    fn update(&mut self, snapshot: &TransferSnapshot) {
        if self.title != snapshot.title || self.file_name.is_empty() {
            self.title = snapshot.title.clone();
            self.file_name = file_name(&snapshot.title, snapshot.resource_id);
        }
        self.total_size = snapshot.total_size;
        self.piece_count = snapshot.piece_count;
        self.progress = snapshot.progress();
        self.downloaded_bytes = snapshot.downloaded_bytes;
        self.peers = snapshot.peers.iter().copied().collect();
        let elapsed_s = self.started_at.elapsed().as_secs_f64();
        self.speed = if elapsed_s > 0. {
            snapshot.owned_bytes as f64 / elapsed_s
        } else {
            0.
        };
    }
}

fn file_name(title: &str, resource_id: ResourceId) -> String {
    let title = title.trim();
    if title.is_empty() {
        format!("resource-{resource_id}.file")
    } else {
        format!("{title}.file")
    }
}

/// A finished download, with its assembled payload.
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub resource_id: ResourceId,
    pub title: String,
    pub file_name: String,
    pub size: u64,
    pub payload: Arc<Vec<u8>>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Queued {
        resource_id: ResourceId,
        position: usize,
    },
    Started {
        resource_id: ResourceId,
    },
    Progress {
        resource_id: ResourceId,
        progress: f64,
        speed: f64,
    },
    Completed {
        resource_id: ResourceId,
        file_name: String,
        size: u64,
    },
    Failed {
        resource_id: ResourceId,
        failure: Failure,
    },
    Paused {
        resource_id: ResourceId,
    },
    Resumed {
        resource_id: ResourceId,
    },
    Cancelled {
        resource_id: ResourceId,
    },
}

impl DownloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DownloadEvent::Queued { .. } => "download-queued",
            DownloadEvent::Started { .. } => "download-started",
            DownloadEvent::Progress { .. } => "download-progress",
            DownloadEvent::Completed { .. } => "download-completed",
            DownloadEvent::Failed { .. } => "download-failed",
            DownloadEvent::Paused { .. } => "download-paused",
            DownloadEvent::Resumed { .. } => "download-resumed",
            DownloadEvent::Cancelled { .. } => "download-cancelled",
        }
    }
}

/// Requests accepted by a running `DownloadManager`, one per line of text:
/// `pause <id>`, `resume <id>`, `cancel <id>` or `status [<id>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadCommand {
    Pause(ResourceId),
    Resume(ResourceId),
    Cancel(ResourceId),
    Status(Option<ResourceId>),
}

impl FromStr for DownloadCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Self> {
        let mut words = line.split_whitespace();
        let (Some(verb), id, None) = (words.next(), words.next(), words.next()) else {
            bail!("expected a command and at most one resource id, got {line:?}");
        };
        let id = id
            .map(|id| id.parse::<ResourceId>())
            .transpose()
            .with_context(|| format!("invalid resource id in {line:?}"))?;
        match (verb, id) {
            ("pause", Some(id)) => Ok(DownloadCommand::Pause(id)),
            ("resume", Some(id)) => Ok(DownloadCommand::Resume(id)),
            ("cancel", Some(id)) => Ok(DownloadCommand::Cancel(id)),
            ("status", id) => Ok(DownloadCommand::Status(id)),
            _ => bail!("unknown command {line:?}, use pause|resume|cancel <id> or status [<id>]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadStats {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub downloaded_bytes: u64, // active downloads plus history
    pub average_speed: f64,    // B/s, mean over active downloads
}

/// Queues downloads and keeps at most `max_concurrent` of them leeching at once.
pub struct DownloadManager<S> {
    swarm: S,
    config: DownloadConfig,
    active: HashMap<ResourceId, Download>,
    queue: VecDeque<ResourceId>,
    history: Vec<CompletedDownload>,
    finished: HashMap<ResourceId, Download>, // failed or cancelled
    events: EventBus<DownloadEvent>,
    swarm_events_rx: UnboundedReceiver<SwarmEvent>,
}

impl<S: SwarmControl> DownloadManager<S> {
    /// `swarm_events_rx` should be subscribed to the same swarm as `swarm`.
    pub fn new(swarm: S, config: DownloadConfig, swarm_events_rx: UnboundedReceiver<SwarmEvent>) -> Self {
        DownloadManager {
            swarm,
            config,
            active: HashMap::new(),
            queue: VecDeque::new(),
            history: Vec::new(),
            finished: HashMap::new(),
            events: EventBus::new(),
            swarm_events_rx,
        }
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Drives polling, swarm events and commands until nothing is active or queued.
    pub async fn run(&mut self, mut commands_rx: UnboundedReceiver<DownloadCommand>) {
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        start_tick(tick_tx, self.config.poll_interval);

        while !self.is_idle() {
            tokio::select! {
                Some(()) = tick_rx.recv() => {
                    self.handle_tick().await;
                }
                Some(event) = self.swarm_events_rx.recv() => {
                    self.handle_swarm_event(event).await;
                }
                Some(command) = commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                else => break,
            }
        }
    }

    pub async fn handle_command(&mut self, command: DownloadCommand) {
        let applied = match command {
            DownloadCommand::Pause(resource_id) => self.pause(resource_id),
            DownloadCommand::Resume(resource_id) => self.resume(resource_id),
            DownloadCommand::Cancel(resource_id) => self.cancel(resource_id).await,
            DownloadCommand::Status(resource_id) => {
                self.log_status(resource_id);
                true
            }
        };
        if !applied {
            log::warn!("{command:?} does not apply to the current downloads");
        }
    }

    fn log_status(&self, resource_id: Option<ResourceId>) {
        if let Some(resource_id) = resource_id {
            match (self.status(resource_id), self.download(resource_id)) {
                (Some(status), Some(download)) => log::info!(
                    "resource {resource_id} {:?} [{status:?}]: {:.1}% of {} at {}/s, {} peers{}",
                    download.title,
                    download.progress,
                    pretty_size(download.total_size as f64),
                    pretty_size(download.speed),
                    download.peers.len(),
                    download
                        .error
                        .as_ref()
                        .map(|e| format!(", {e}"))
                        .unwrap_or_default()
                ),
                (Some(status), None) => log::info!("resource {resource_id}: {status:?}"),
                (None, _) => log::info!("resource {resource_id} is not a download"),
            }
            return;
        }
        let stats = self.statistics();
        log::info!(
            "{} active, {} queued {:?}, {} completed, {} failed, {} at {}/s on average",
            stats.active,
            stats.queued,
            self.queue(),
            stats.completed,
            stats.failed,
            pretty_size(stats.downloaded_bytes as f64),
            pretty_size(stats.average_speed)
        );
        for download in self.active_downloads() {
            self.log_status(Some(download.resource_id));
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }

    /// Returns false if the resource is already active or queued.
    pub async fn enqueue(&mut self, resource_id: ResourceId, priority: Priority) -> bool {
        if self.active.contains_key(&resource_id) || self.queue.contains(&resource_id) {
            log::debug!("resource {resource_id} is already active or queued");
            return false;
        }
        self.finished.remove(&resource_id);
        let position = match priority {
            Priority::High => {
                self.queue.push_front(resource_id);
                0
            }
            Priority::Normal => {
                self.queue.push_back(resource_id);
                self.queue.len() - 1
            }
        };
        log::info!("queued resource {resource_id} at position {position}");
        self.events.emit(DownloadEvent::Queued {
            resource_id,
            position,
        });
        self.admit().await;
        true
    }

    async fn admit(&mut self) {
        while self.active.len() < self.config.max_concurrent {
            let Some(resource_id) = self.queue.pop_front() else {
                return;
            };
            self.active.insert(resource_id, Download::new(resource_id));
            log::info!(
                "starting download of resource {resource_id} ({}/{} active)",
                self.active.len(),
                self.config.max_concurrent
            );
            self.events.emit(DownloadEvent::Started { resource_id });
            if let Err(failure) = self.swarm.start_leeching(resource_id).await {
                self.fail(resource_id, failure);
            }
        }
    }

    pub async fn handle_tick(&mut self) {
        let polled: Vec<ResourceId> = self
            .active
            .values()
            .filter(|d| d.status == DownloadStatus::Downloading)
            .map(|d| d.resource_id)
            .collect();
        for resource_id in polled {
            self.poll(resource_id).await;
        }
        self.admit().await;
    }

    async fn poll(&mut self, resource_id: ResourceId) {
        let Some(snapshot) = self.swarm.snapshot(resource_id).await else {
            self.fail(
                resource_id,
                Failure::new(FailureKind::Other, "the swarm no longer tracks this transfer"),
            );
            return;
        };
        let Some(download) = self.active.get_mut(&resource_id) else {
            return;
        };
        download.update(&snapshot);
        let (progress, speed) = (download.progress, download.speed);
        log::debug!(
            "download of resource {resource_id}: {progress:.1}% at {}/s",
            pretty_size(speed)
        );
        self.events.emit(DownloadEvent::Progress {
            resource_id,
            progress,
            speed,
        });

        match snapshot.status {
            TransferStatus::Leeching => {}
            TransferStatus::Completed | TransferStatus::Seeding => self.complete(resource_id).await,
            TransferStatus::Failed => self.fail(
                resource_id,
                Failure::new(FailureKind::Other, "the transfer failed"),
            ),
        }
    }

    async fn complete(&mut self, resource_id: ResourceId) {
        if !self.active.contains_key(&resource_id) {
            return;
        }
        let Some(payload) = self.swarm.assembled_payload(resource_id).await else {
            self.fail(
                resource_id,
                Failure::new(FailureKind::UploadOrAssembly, "no assembled payload for the transfer"),
            );
            return;
        };
        let Some(mut download) = self.active.remove(&resource_id) else {
            return;
        };
        if download.file_name.is_empty() {
            download.file_name = file_name(&download.title, resource_id);
        }
        let size = payload.len() as u64;
        log::info!(
            "download of resource {resource_id} completed: {} ({})",
            download.file_name,
            pretty_size(size as f64)
        );
        self.history.push(CompletedDownload {
            resource_id,
            title: download.title,
            file_name: download.file_name.clone(),
            size,
            payload,
            elapsed: download.started_at.elapsed(),
        });
        self.events.emit(DownloadEvent::Completed {
            resource_id,
            file_name: download.file_name,
            size,
        });
        self.admit().await;
    }

    /// Releases the slot. The caller admits the next queued download.
    fn fail(&mut self, resource_id: ResourceId, failure: Failure) {
        let Some(mut download) = self.active.remove(&resource_id) else {
            return;
        };
        log::error!("download of resource {resource_id} failed: {failure}");
        download.status = DownloadStatus::Failed;
        download.error = Some(failure.clone());
        self.finished.insert(resource_id, download);
        self.events.emit(DownloadEvent::Failed {
            resource_id,
            failure,
        });
    }

    pub async fn handle_swarm_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::PeerConnected {
                participant,
                resource_id,
            } => {
                if let Some(download) = self.active.get_mut(&resource_id) {
                    download.peers.insert(participant);
                }
            }
            SwarmEvent::PeerDisconnected {
                participant,
                resource_id,
            }
            | SwarmEvent::PeerFailed {
                participant,
                resource_id,
                ..
            } => {
                if let Some(download) = self.active.get_mut(&resource_id) {
                    download.peers.remove(&participant);
                }
            }
            SwarmEvent::DownloadComplete { resource_id, .. } => {
                self.complete(resource_id).await;
            }
            SwarmEvent::LeechError {
                resource_id,
                failure,
            }
            | SwarmEvent::DownloadCompleteError {
                resource_id,
                failure,
            }
            | SwarmEvent::TransferFailed {
                resource_id,
                failure,
            } => {
                self.fail(resource_id, failure);
                self.admit().await;
            }
            _ => {}
        }
    }

    pub fn pause(&mut self, resource_id: ResourceId) -> bool {
        match self.active.get_mut(&resource_id) {
            Some(download) if download.status == DownloadStatus::Downloading => {
                download.status = DownloadStatus::Paused;
                self.events.emit(DownloadEvent::Paused { resource_id });
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self, resource_id: ResourceId) -> bool {
        match self.active.get_mut(&resource_id) {
            Some(download) if download.status == DownloadStatus::Paused => {
                download.status = DownloadStatus::Downloading;
                self.events.emit(DownloadEvent::Resumed { resource_id });
                true
            }
            _ => false,
        }
    }

    pub async fn cancel(&mut self, resource_id: ResourceId) -> bool {
        if let Some(position) = self.queue.iter().position(|id| *id == resource_id) {
            self.queue.remove(position);
        } else if let Some(mut download) = self.active.remove(&resource_id) {
            self.swarm.cancel(resource_id).await;
            download.status = DownloadStatus::Cancelled;
            self.finished.insert(resource_id, download);
        } else {
            return false;
        }
        log::info!("cancelled download of resource {resource_id}");
        self.events.emit(DownloadEvent::Cancelled { resource_id });
        self.admit().await;
        true
    }

    /// Cancels every active download and empties the queue.
    pub async fn cleanup(&mut self) {
        self.queue.clear();
        let active: Vec<ResourceId> = self.active.keys().copied().collect();
        for resource_id in active {
            self.cancel(resource_id).await;
        }
    }

    pub fn status(&self, resource_id: ResourceId) -> Option<DownloadStatus> {
        if let Some(download) = self.active.get(&resource_id) {
            return Some(download.status);
        }
        if self.queue.contains(&resource_id) {
            return Some(DownloadStatus::Queued);
        }
        if self.history.iter().any(|c| c.resource_id == resource_id) {
            return Some(DownloadStatus::Completed);
        }
        self.finished.get(&resource_id).map(|d| d.status)
    }

    pub fn download(&self, resource_id: ResourceId) -> Option<&Download> {
        self.active
            .get(&resource_id)
            .or_else(|| self.finished.get(&resource_id))
    }

    pub fn active_downloads(&self) -> Vec<&Download> {
        let mut active: Vec<&Download> = self.active.values().collect();
        active.sort_by_key(|d| (d.started_at, d.resource_id));
        active
    }

    pub fn queue(&self) -> Vec<ResourceId> {
        self.queue.iter().copied().collect()
    }

    pub fn history(&self) -> &[CompletedDownload] {
        &self.history
    }

    pub fn statistics(&self) -> DownloadStats {
        let active_bytes: u64 = self.active.values().map(|d| d.downloaded_bytes).sum();
        let history_bytes: u64 = self.history.iter().map(|c| c.size).sum();
        let average_speed = if self.active.is_empty() {
            0.
        } else {
            self.active.values().map(|d| d.speed).sum::<f64>() / self.active.len() as f64
        };
        DownloadStats {
            active: self.active.len(),
            queued: self.queue.len(),
            completed: self.history.len(),
            failed: self
                .finished
                .values()
                .filter(|d| d.status == DownloadStatus::Failed)
                .count(),
            downloaded_bytes: active_bytes + history_bytes,
            average_speed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        snapshots: HashMap<ResourceId, TransferSnapshot>,
        refused: HashSet<ResourceId>,
        started: Vec<ResourceId>,
        cancelled: Vec<ResourceId>,
    }

    #[derive(Clone, Default)]
    struct FakeSwarm {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeSwarm {
        fn set_progress(&self, resource_id: ResourceId, owned_pieces: usize, status: TransferStatus) {
            let mut state = self.state.lock().unwrap();
            if let Some(snapshot) = state.snapshots.get_mut(&resource_id) {
                snapshot.owned_pieces = owned_pieces;
                snapshot.owned_bytes = owned_pieces as u64 * 1000;
                snapshot.downloaded_bytes = snapshot.owned_bytes;
                snapshot.status = status;
            }
        }

        fn started(&self) -> Vec<ResourceId> {
            self.state.lock().unwrap().started.clone()
        }
    }

    impl SwarmControl for FakeSwarm {
        async fn start_leeching(&self, resource_id: ResourceId) -> Result<(), Failure> {
            let mut state = self.state.lock().unwrap();
            if state.refused.contains(&resource_id) {
                return Err(Failure::new(FailureKind::ResourceNotFound, "no such resource"));
            }
            state.started.push(resource_id);
            state.snapshots.insert(
                resource_id,
                TransferSnapshot {
                    resource_id,
                    title: format!("lesson {resource_id}"),
                    status: TransferStatus::Leeching,
                    total_size: 4000,
                    piece_count: 4,
                    owned_pieces: 0,
                    owned_bytes: 0,
                    downloaded_bytes: 0,
                    uploaded_bytes: 0,
                    peers: Vec::new(),
                },
            );
            Ok(())
        }

        async fn snapshot(&self, resource_id: ResourceId) -> Option<TransferSnapshot> {
            self.state.lock().unwrap().snapshots.get(&resource_id).cloned()
        }

        async fn assembled_payload(&self, resource_id: ResourceId) -> Option<Arc<Vec<u8>>> {
            let state = self.state.lock().unwrap();
            let snapshot = state.snapshots.get(&resource_id)?;
            (snapshot.status == TransferStatus::Seeding)
                .then(|| Arc::new(vec![7; snapshot.total_size as usize]))
        }

        async fn cancel(&self, resource_id: ResourceId) -> bool {
            let mut state = self.state.lock().unwrap();
            state.cancelled.push(resource_id);
            state.snapshots.remove(&resource_id).is_some()
        }
    }

    fn new_manager(swarm: &FakeSwarm) -> DownloadManager<FakeSwarm> {
        let (_swarm_events_tx, swarm_events_rx) = mpsc::unbounded_channel();
        DownloadManager::new(swarm.clone(), DownloadConfig::default(), swarm_events_rx)
    }

    fn downloading(manager: &DownloadManager<FakeSwarm>) -> usize {
        manager
            .active_downloads()
            .iter()
            .filter(|d| d.status == DownloadStatus::Downloading)
            .count()
    }

    #[tokio::test]
    async fn at_most_three_downloads_are_admitted() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        for resource_id in 1..=5 {
            assert!(manager.enqueue(resource_id, Priority::Normal).await);
        }
        assert_eq!(downloading(&manager), 3);
        assert_eq!(manager.queue(), vec![4, 5]);
        assert_eq!(swarm.started(), vec![1, 2, 3]);

        swarm.set_progress(2, 4, TransferStatus::Seeding);
        manager.handle_tick().await;
        assert_eq!(downloading(&manager), 3);
        assert_eq!(manager.queue(), vec![5]);
        assert_eq!(manager.status(2), Some(DownloadStatus::Completed));
        assert_eq!(manager.status(4), Some(DownloadStatus::Downloading));

        assert!(manager.cancel(1).await);
        assert_eq!(downloading(&manager), 3);
        assert!(manager.queue().is_empty());
        assert_eq!(swarm.started(), vec![1, 2, 3, 4, 5]);
        assert_eq!(swarm.state.lock().unwrap().cancelled, vec![1]);
        assert_eq!(manager.status(1), Some(DownloadStatus::Cancelled));
    }

    #[tokio::test]
    async fn high_priority_jumps_the_queue() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        let mut events = manager.subscribe();
        for resource_id in 1..=4 {
            manager.enqueue(resource_id, Priority::Normal).await;
        }
        manager.enqueue(5, Priority::High).await;
        assert_eq!(manager.queue(), vec![5, 4]);

        // already active or queued
        assert!(!manager.enqueue(1, Priority::High).await);
        assert!(!manager.enqueue(4, Priority::High).await);
        assert_eq!(manager.queue(), vec![5, 4]);

        let queued: Vec<DownloadEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, DownloadEvent::Queued { .. }))
            .collect();
        assert_eq!(queued.len(), 5);
        assert_matches!(queued.last(), Some(DownloadEvent::Queued { resource_id: 5, position: 0 }));
    }

    #[tokio::test]
    async fn refused_start_fails_and_admits_the_next() {
        let swarm = FakeSwarm::default();
        swarm.state.lock().unwrap().refused.insert(2);
        let mut manager = new_manager(&swarm);
        let mut events = manager.subscribe();
        for resource_id in 1..=4 {
            manager.enqueue(resource_id, Priority::Normal).await;
        }
        assert_eq!(manager.status(2), Some(DownloadStatus::Failed));
        assert_eq!(downloading(&manager), 3);
        assert!(manager.queue().is_empty());
        assert_matches!(manager.download(2), Some(Download { error: Some(Failure { kind: FailureKind::ResourceNotFound, .. }), .. }));
        assert!(std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| e == DownloadEvent::Failed {
                resource_id: 2,
                failure: Failure::new(FailureKind::ResourceNotFound, "no such resource")
            }));
        assert_eq!(manager.statistics().failed, 1);
    }

    #[tokio::test]
    async fn swarm_errors_fail_active_downloads() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        for resource_id in 1..=4 {
            manager.enqueue(resource_id, Priority::Normal).await;
        }
        manager
            .handle_swarm_event(SwarmEvent::DownloadCompleteError {
                resource_id: 3,
                failure: Failure::new(FailureKind::UploadOrAssembly, "content digest mismatch"),
            })
            .await;
        assert_eq!(manager.status(3), Some(DownloadStatus::Failed));
        assert_eq!(manager.status(4), Some(DownloadStatus::Downloading));

        // errors about resources we do not download are ignored
        manager
            .handle_swarm_event(SwarmEvent::LeechError {
                resource_id: 42,
                failure: Failure::new(FailureKind::ResourceNotFound, "gone"),
            })
            .await;
        assert_eq!(manager.status(42), None);
    }

    #[tokio::test]
    async fn peers_are_tracked_from_swarm_events() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        manager.enqueue(1, Priority::Normal).await;
        for participant in [10, 11] {
            manager
                .handle_swarm_event(SwarmEvent::PeerConnected {
                    participant,
                    resource_id: 1,
                })
                .await;
        }
        manager
            .handle_swarm_event(SwarmEvent::PeerDisconnected {
                participant: 10,
                resource_id: 1,
            })
            .await;
        let peers = &manager.download(1).unwrap().peers;
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&11));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_and_speed_are_polled() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        let mut events = manager.subscribe();
        manager.enqueue(1, Priority::Normal).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        swarm.set_progress(1, 2, TransferStatus::Leeching);
        manager.handle_tick().await;
        let download = manager.download(1).unwrap();
        assert_eq!(download.progress, 50.);
        assert_eq!(download.downloaded_bytes, 2000);
        assert_eq!(download.speed, 1000.);
        assert_eq!(download.file_name, "lesson 1.file");
        assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|e| e
            == DownloadEvent::Progress {
                resource_id: 1,
                progress: 50.,
                speed: 1000.
            }));

        let stats = manager.statistics();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.downloaded_bytes, 2000);
        assert_eq!(stats.average_speed, 1000.);
    }

    #[tokio::test]
    async fn completion_records_history() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        let mut events = manager.subscribe();
        manager.enqueue(1, Priority::Normal).await;
        swarm.set_progress(1, 4, TransferStatus::Seeding);
        manager
            .handle_swarm_event(SwarmEvent::DownloadComplete {
                resource_id: 1,
                size: 4000,
            })
            .await;
        // a late poll does not complete it twice
        manager.handle_tick().await;

        assert_eq!(manager.history().len(), 1);
        let completed = &manager.history()[0];
        assert_eq!(completed.file_name, "resource-1.file");
        assert_eq!(completed.size, 4000);
        assert_eq!(completed.payload.len(), 4000);
        assert!(manager.is_idle());
        let completions = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.name() == "download-completed")
            .count();
        assert_eq!(completions, 1);
        assert_eq!(manager.statistics().completed, 1);
    }

    #[tokio::test]
    async fn pause_and_resume_only_change_status() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        manager.enqueue(1, Priority::Normal).await;
        assert!(manager.pause(1));
        assert!(!manager.pause(1));
        assert_eq!(manager.status(1), Some(DownloadStatus::Paused));

        // a paused download keeps its slot and is not polled
        swarm.set_progress(1, 4, TransferStatus::Seeding);
        manager.handle_tick().await;
        assert_eq!(manager.status(1), Some(DownloadStatus::Paused));
        assert_eq!(manager.statistics().active, 1);

        assert!(manager.resume(1));
        assert!(!manager.resume(1));
        manager.handle_tick().await;
        assert_eq!(manager.status(1), Some(DownloadStatus::Completed));
    }

    #[test]
    fn commands_are_parsed_from_lines() {
        assert_eq!("pause 4".parse::<DownloadCommand>().unwrap(), DownloadCommand::Pause(4));
        assert_eq!(" resume  12 ".parse::<DownloadCommand>().unwrap(), DownloadCommand::Resume(12));
        assert_eq!("cancel 1".parse::<DownloadCommand>().unwrap(), DownloadCommand::Cancel(1));
        assert_eq!("status".parse::<DownloadCommand>().unwrap(), DownloadCommand::Status(None));
        assert_eq!("status 3".parse::<DownloadCommand>().unwrap(), DownloadCommand::Status(Some(3)));
        for bad in ["", "pause", "pause x", "pause 1 2", "stop 1"] {
            assert!(bad.parse::<DownloadCommand>().is_err(), "{bad:?} should be refused");
        }
    }

    #[tokio::test]
    async fn commands_drive_pause_resume_and_cancel() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        let mut events = manager.subscribe();
        manager.enqueue(1, Priority::Normal).await;
        manager.enqueue(2, Priority::Normal).await;

        manager.handle_command(DownloadCommand::Pause(1)).await;
        assert_eq!(manager.status(1), Some(DownloadStatus::Paused));
        manager.handle_command(DownloadCommand::Status(None)).await;
        manager.handle_command(DownloadCommand::Status(Some(1))).await;
        manager.handle_command(DownloadCommand::Resume(1)).await;
        assert_eq!(manager.status(1), Some(DownloadStatus::Downloading));
        manager.handle_command(DownloadCommand::Cancel(2)).await;
        assert_eq!(manager.status(2), Some(DownloadStatus::Cancelled));
        // not a download: nothing changes
        manager.handle_command(DownloadCommand::Pause(9)).await;
        assert_eq!(manager.status(9), None);

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .filter(|name| !matches!(*name, "download-queued" | "download-started"))
            .collect();
        assert_eq!(names, vec!["download-paused", "download-resumed", "download-cancelled"]);
    }

    #[tokio::test]
    async fn polling_refreshes_the_peer_set() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        manager.enqueue(1, Priority::Normal).await;
        manager
            .handle_swarm_event(SwarmEvent::PeerConnected {
                participant: 10,
                resource_id: 1,
            })
            .await;
        // the disconnect event was missed, the snapshot knows better
        swarm
            .state
            .lock()
            .unwrap()
            .snapshots
            .get_mut(&1)
            .unwrap()
            .peers = vec![11, 12];
        manager.handle_tick().await;
        let mut peers: Vec<ParticipantId> = manager.download(1).unwrap().peers.iter().copied().collect();
        peers.sort();
        assert_eq!(peers, vec![11, 12]);
    }

    #[tokio::test]
    async fn cleanup_cancels_everything() {
        let swarm = FakeSwarm::default();
        let mut manager = new_manager(&swarm);
        for resource_id in 1..=5 {
            manager.enqueue(resource_id, Priority::Normal).await;
        }
        manager.cleanup().await;
        assert!(manager.is_idle());
        assert_eq!(swarm.started(), vec![1, 2, 3]);
        let mut cancelled = swarm.state.lock().unwrap().cancelled.clone();
        cancelled.sort();
        assert_eq!(cancelled, vec![1, 2, 3]);
        assert!(!manager.cancel(4).await);
    }
}
