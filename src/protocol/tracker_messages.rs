use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{metadata::manifest::ResourceId, protocol::ParticipantId};

/// Signalling payloads (session descriptions, ICE candidates) are opaque to the tracker.
pub type SignalPayload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceStatus {
    Leeching,
    Seeding,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceEvent {
    Started,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmPeer {
    pub user_id: ParticipantId,
    #[serde(default)]
    pub username: String,
    pub status: AnnounceStatus,
    #[serde(default)]
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmStats {
    pub seeders: u32,
    pub leechers: u32,
    pub completed: u32,
    pub total_size: u64,
}

/// Frames exchanged with the tracker, tagged by their `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerMessage {
    PeerAnnounce {
        user_id: ParticipantId,
        resource_id: ResourceId,
        // the tracker echoes announces without a status
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<AnnounceStatus>,
        #[serde(default)]
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<AnnounceEvent>,
        #[serde(default, alias = "peer_list", skip_serializing_if = "Vec::is_empty")]
        peers: Vec<SwarmPeer>,
    },
    SwarmUpdate {
        resource_id: ResourceId,
        #[serde(default, alias = "peer_list")]
        peers: Vec<SwarmPeer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        swarm_stats: Option<SwarmStats>,
    },
    PeerConnect {
        user_id: ParticipantId,
    },
    PeerDisconnect {
        user_id: ParticipantId,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(default)]
        user_id: ParticipantId,
        target_user_id: ParticipantId,
        resource_id: ResourceId,
        payload: SignalPayload,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(default)]
        user_id: ParticipantId,
        target_user_id: ParticipantId,
        resource_id: ResourceId,
        payload: SignalPayload,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(default)]
        user_id: ParticipantId,
        target_user_id: ParticipantId,
        resource_id: ResourceId,
        payload: SignalPayload,
    },
}

impl Display for TrackerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerMessage::PeerAnnounce {
                user_id,
                resource_id,
                status,
                progress,
                event,
                peers,
            } => write!(
                f,
                "peer_announce from {user_id} for resource {resource_id} (status: {status:?}, progress: {progress:.1}%, event: {event:?}, {} peers)",
                peers.len()
            ),
            TrackerMessage::SwarmUpdate {
                resource_id, peers, ..
            } => write!(
                f,
                "swarm_update for resource {resource_id} ({} peers)",
                peers.len()
            ),
            TrackerMessage::PeerConnect { user_id } => write!(f, "peer_connect {user_id}"),
            TrackerMessage::PeerDisconnect { user_id } => write!(f, "peer_disconnect {user_id}"),
            TrackerMessage::Offer {
                user_id,
                target_user_id,
                resource_id,
                ..
            } => write!(
                f,
                "offer {user_id} -> {target_user_id} for resource {resource_id}"
            ),
            TrackerMessage::Answer {
                user_id,
                target_user_id,
                resource_id,
                ..
            } => write!(
                f,
                "answer {user_id} -> {target_user_id} for resource {resource_id}"
            ),
            TrackerMessage::IceCandidate {
                user_id,
                target_user_id,
                ..
            } => write!(f, "ice-candidate {user_id} -> {target_user_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn announce_has_tracker_field_names() {
        let msg = TrackerMessage::PeerAnnounce {
            user_id: 7,
            resource_id: 42,
            status: Some(AnnounceStatus::Leeching),
            progress: 12.5,
            event: Some(AnnounceEvent::Started),
            peers: Vec::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "peer_announce",
                "user_id": 7,
                "resource_id": 42,
                "status": "leeching",
                "progress": 12.5,
                "event": "started"
            })
        );
    }

    #[test]
    fn tracker_echo_without_status_is_accepted() {
        let frame = r#"{"type":"peer_announce","user_id":3,"resource_id":9,"progress":0,
            "peer_list":[{"user_id":3,"username":"ann","status":"seeding","progress":100,
            "upload_speed":0,"download_speed":0,"pieces_have":[],"last_seen":"2024-01-01T00:00:00Z"}],
            "swarm_stats":{"resource_id":9,"seeders":1,"leechers":0,"completed":0,"total_size":10},
            "timestamp":"2024-01-01T00:00:00Z"}"#;
        let msg: TrackerMessage = serde_json::from_str(frame).unwrap();
        assert_matches!(msg, TrackerMessage::PeerAnnounce { user_id: 3, resource_id: 9, status: None, peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].status, AnnounceStatus::Seeding);
        });
    }

    #[test]
    fn swarm_update_carries_stats() {
        let frame = r#"{"type":"swarm_update","resource_id":9,"peer_list":[],
            "swarm_stats":{"resource_id":9,"seeders":2,"leechers":1,"completed":0,"total_size":10}}"#;
        let msg: TrackerMessage = serde_json::from_str(frame).unwrap();
        assert_matches!(msg, TrackerMessage::SwarmUpdate { swarm_stats: Some(stats), .. } => {
            assert_eq!(stats.seeders, 2);
            assert_eq!(stats.leechers, 1);
        });
    }

    #[test]
    fn signalling_frames_use_dashed_type_names() {
        let msg = TrackerMessage::IceCandidate {
            user_id: 1,
            target_user_id: 2,
            resource_id: 5,
            payload: json!({"candidate": "c"}),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["target_user_id"], 2);
    }

    #[test]
    fn unknown_status_does_not_reject_frame() {
        let frame = r#"{"type":"swarm_update","resource_id":1,"peers":[{"user_id":2,"status":"paused"}]}"#;
        let msg: TrackerMessage = serde_json::from_str(frame).unwrap();
        assert_matches!(msg, TrackerMessage::SwarmUpdate { peers, .. } => {
            assert_eq!(peers[0].status, AnnounceStatus::Other);
        });
    }
}
