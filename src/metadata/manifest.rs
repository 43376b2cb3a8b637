use anyhow::{bail, Result};
use size::{Size, Style};
use std::fmt;

use crate::{
    persistence::chunking::{self, ContentDigest},
    protocol::peer_messages::MAX_PIECE_SIZE_B,
};

pub type ResourceId = u64;

pub const DEFAULT_PIECE_SIZE_B: u64 = 1024 * 1024;

/// Descriptive data attached to a resource. The swarm never interprets it, it only
/// forwards it to the registry and shows it in logs.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct ResourceMetadata {
    pub title: String,
    pub description: String,
    pub skill_category: String,
    pub tags: Vec<String>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct Manifest {
    pub content_digest: ContentDigest, // digest of the whole payload
    pub total_size: u64,               // payload size in bytes
    pub piece_size: u64,               // number of bytes in each piece but the last
    pub piece_hashes: Vec<ContentDigest>, // digest of each piece, in piece order
    pub mime_type: String,
    pub metadata: ResourceMetadata,
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "title: {:?}\ntags: {:?}\nmime type: {}\nsize: {}\npiece size: {}\nn. pieces: {}\ncontent digest: {}",
            self.metadata.title,
            self.metadata.tags,
            self.mime_type,
            Size::from_bytes(self.total_size)
                .format()
                .with_style(Style::Abbreviated),
            Size::from_bytes(self.piece_size)
                .format()
                .with_style(Style::Abbreviated),
            self.piece_count(),
            hex::encode(self.content_digest),
        )
    }
}

impl Manifest {
    pub fn from_payload(
        payload: &[u8],
        piece_size: u64,
        mime_type: String,
        metadata: ResourceMetadata,
    ) -> Result<Self> {
        Ok(Manifest {
            content_digest: chunking::digest(payload),
            total_size: payload.len() as u64,
            piece_size,
            piece_hashes: chunking::piece_digests(payload, piece_size)?,
            mime_type,
            metadata,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_length(&self, piece_idx: usize) -> u64 {
        if piece_idx + 1 == self.piece_count() {
            self.total_size - self.piece_size * (self.piece_count() as u64 - 1)
        } else {
            self.piece_size
        }
    }

    /// Checks that piece size, piece count and total size agree with each other.
    pub fn validate(&self) -> Result<()> {
        if self.piece_size == 0 {
            bail!("the manifest has a piece size of 0");
        }
        if self.piece_size > MAX_PIECE_SIZE_B {
            bail!(
                "the manifest has a piece size of {} bytes, pieces of more than {MAX_PIECE_SIZE_B} bytes cannot be exchanged",
                self.piece_size
            );
        }
        let expected_pieces = self.total_size.div_ceil(self.piece_size);
        if expected_pieces != self.piece_count() as u64 {
            bail!(
                "the manifest lists {} piece digests but {} bytes in pieces of {} bytes need {}",
                self.piece_count(),
                self.total_size,
                self.piece_size,
                expected_pieces
            );
        }
        Ok(())
    }

    /// Comma separated hex digests, the representation used by the registry.
    pub fn pieces_hash_string(&self) -> String {
        self.piece_hashes
            .iter()
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn parse_digest(hex_digest: &str) -> Result<ContentDigest> {
    let bytes = hex::decode(hex_digest.trim())?;
    match bytes.try_into() {
        Ok(digest) => Ok(digest),
        Err(bytes) => bail!("digest has {} bytes, expected 32", bytes.len()),
    }
}

pub fn parse_pieces_hash(pieces_hash: &str) -> Result<Vec<ContentDigest>> {
    if pieces_hash.trim().is_empty() {
        return Ok(Vec::new());
    }
    pieces_hash.split(',').map(parse_digest).collect()
}
