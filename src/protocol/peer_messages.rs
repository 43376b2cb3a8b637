use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{metadata::manifest::ResourceId, protocol::tcp_frames::MAX_FRAME_SIZE_B};

// a piece response carries the piece hex encoded plus a few dozen bytes of JSON
const PIECE_RESPONSE_OVERHEAD_B: u64 = 1024;

/// Largest piece whose `piece-response` frame still fits in a single frame.
pub const MAX_PIECE_SIZE_B: u64 = (MAX_FRAME_SIZE_B as u64 - PIECE_RESPONSE_OVERHEAD_B) / 2;

/// Frames exchanged on a peer data channel, tagged by their `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    #[serde(rename_all = "camelCase")]
    PieceRequest {
        resource_id: ResourceId,
        piece_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    PieceResponse {
        resource_id: ResourceId,
        piece_index: usize,
        #[serde(with = "hex_bytes")]
        piece_data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Bitfield { indices: Vec<usize> },
    #[serde(rename_all = "camelCase")]
    Have { piece_index: usize },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::PieceRequest {
                resource_id,
                piece_index,
            } => write!(f, "piece-request {resource_id}/{piece_index}"),
            PeerMessage::PieceResponse {
                resource_id,
                piece_index,
                piece_data,
            } => write!(
                f,
                "piece-response {resource_id}/{piece_index} ({} bytes)",
                piece_data.len()
            ),
            PeerMessage::Bitfield { indices } => write!(f, "bitfield ({} pieces)", indices.len()),
            PeerMessage::Have { piece_index } => write!(f, "have {piece_index}"),
        }
    }
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}
