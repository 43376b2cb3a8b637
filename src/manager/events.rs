use std::{fmt, time::Duration};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    metadata::manifest::ResourceId,
    persistence::{
        chunking::InvalidInputError,
        piece_store::{AssemblyError, PieceIntegrityError},
    },
    protocol::ParticipantId,
    registry::ResourceNotFoundError,
    rtc::NegotiationFailure,
    tracker::ConnectionError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Negotiation,
    PieceIntegrity,
    UploadOrAssembly,
    ResourceNotFound,
    InvalidInput,
    Other,
}

/// A classified error, cheap to clone into events and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn classify(error: &anyhow::Error) -> Self {
        let kind = if error.downcast_ref::<ConnectionError>().is_some() {
            FailureKind::Connection
        } else if error.downcast_ref::<NegotiationFailure>().is_some() {
            FailureKind::Negotiation
        } else if error.downcast_ref::<PieceIntegrityError>().is_some() {
            FailureKind::PieceIntegrity
        } else if error.downcast_ref::<AssemblyError>().is_some() {
            FailureKind::UploadOrAssembly
        } else if error.downcast_ref::<ResourceNotFoundError>().is_some() {
            FailureKind::ResourceNotFound
        } else if error.downcast_ref::<InvalidInputError>().is_some() {
            FailureKind::InvalidInput
        } else {
            FailureKind::Other
        };
        Failure {
            kind,
            message: format!("{error:#}"),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    CreateResourceStart {
        title: String,
    },
    CreateResourceSuccess {
        resource_id: ResourceId,
        title: String,
    },
    CreateResourceError {
        title: String,
        failure: Failure,
    },
    LeechStart {
        resource_id: ResourceId,
    },
    LeechStarted {
        resource_id: ResourceId,
        title: String,
        total_size: u64,
        piece_count: usize,
    },
    LeechError {
        resource_id: ResourceId,
        failure: Failure,
    },
    SeedingStarted {
        resource_id: ResourceId,
    },
    SeedingError {
        resource_id: ResourceId,
        failure: Failure,
    },
    PieceDownloaded {
        resource_id: ResourceId,
        piece_index: usize,
        progress: f64,
    },
    PieceIntegrityFailed {
        resource_id: ResourceId,
        piece_index: usize,
        participant: ParticipantId,
        failure: Failure,
    },
    PeerConnected {
        participant: ParticipantId,
        resource_id: ResourceId,
    },
    PeerDisconnected {
        participant: ParticipantId,
        resource_id: ResourceId,
    },
    PeerFailed {
        participant: ParticipantId,
        resource_id: ResourceId,
        failure: Failure,
    },
    DownloadComplete {
        resource_id: ResourceId,
        size: u64,
    },
    DownloadCompleteError {
        resource_id: ResourceId,
        failure: Failure,
    },
    TransferFailed {
        resource_id: ResourceId,
        failure: Failure,
    },
    TrackerConnected,
    TrackerDisconnected,
    TrackerReconnecting {
        attempt: u32,
        delay: Duration,
    },
    TrackerConnectionLost {
        failure: Failure,
    },
}

impl SwarmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SwarmEvent::CreateResourceStart { .. } => "create-resource-start",
            SwarmEvent::CreateResourceSuccess { .. } => "create-resource-success",
            SwarmEvent::CreateResourceError { .. } => "create-resource-error",
            SwarmEvent::LeechStart { .. } => "leech-start",
            SwarmEvent::LeechStarted { .. } => "leech-started",
            SwarmEvent::LeechError { .. } => "leech-error",
            SwarmEvent::SeedingStarted { .. } => "seeding-started",
            SwarmEvent::SeedingError { .. } => "seeding-error",
            SwarmEvent::PieceDownloaded { .. } => "piece-downloaded",
            SwarmEvent::PieceIntegrityFailed { .. } => "piece-integrity-failed",
            SwarmEvent::PeerConnected { .. } => "peer-connected",
            SwarmEvent::PeerDisconnected { .. } => "peer-disconnected",
            SwarmEvent::PeerFailed { .. } => "peer-failed",
            SwarmEvent::DownloadComplete { .. } => "download-complete",
            SwarmEvent::DownloadCompleteError { .. } => "download-complete-error",
            SwarmEvent::TransferFailed { .. } => "transfer-failed",
            SwarmEvent::TrackerConnected => "tracker-connected",
            SwarmEvent::TrackerDisconnected => "tracker-disconnected",
            SwarmEvent::TrackerReconnecting { .. } => "tracker-reconnecting",
            SwarmEvent::TrackerConnectionLost { .. } => "tracker-connection-lost",
        }
    }
}

/// Fan-out of events to any number of listeners, delivered in subscription order.
/// Listeners that dropped their receiver are forgotten on the next emit.
pub struct EventBus<E> {
    listeners: Vec<UnboundedSender<E>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    pub fn emit(&mut self, event: E) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn events_reach_every_listener_in_order() {
        let mut bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(SwarmEvent::TrackerConnected);
        bus.emit(SwarmEvent::LeechStart { resource_id: 3 });

        for rx in [&mut first, &mut second] {
            assert_matches!(rx.try_recv(), Ok(SwarmEvent::TrackerConnected));
            assert_matches!(rx.try_recv(), Ok(SwarmEvent::LeechStart { resource_id: 3 }));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_listener_is_forgotten() {
        let mut bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(SwarmEvent::TrackerDisconnected);
        assert_eq!(bus.listeners.len(), 1);
        drop(kept);
        bus.emit(SwarmEvent::TrackerDisconnected);
        assert_eq!(bus.listeners.len(), 0);
    }

    #[test]
    fn failures_are_classified_by_error_type() {
        let err = anyhow::Error::new(ResourceNotFoundError(4));
        assert_eq!(Failure::classify(&err).kind, FailureKind::ResourceNotFound);

        let err = anyhow::Error::new(PieceIntegrityError {
            piece_idx: 1,
            reason: "digest mismatch".to_string(),
        });
        assert_eq!(Failure::classify(&err).kind, FailureKind::PieceIntegrity);

        let err = anyhow::Error::new(ConnectionError("refused".to_string()))
            .context("reaching tracker");
        assert_eq!(Failure::classify(&err).kind, FailureKind::Connection);

        let err = anyhow!("something else");
        assert_matches!(Failure::classify(&err), Failure { kind: FailureKind::Other, message } => {
            assert_eq!(message, "something else");
        });
    }

    #[test]
    fn event_names_follow_wire_style() {
        assert_eq!(
            SwarmEvent::DownloadCompleteError {
                resource_id: 1,
                failure: Failure::new(FailureKind::UploadOrAssembly, "size")
            }
            .name(),
            "download-complete-error"
        );
        assert_eq!(
            SwarmEvent::TrackerReconnecting {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
            .name(),
            "tracker-reconnecting"
        );
    }
}
