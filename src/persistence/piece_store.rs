use anyhow::{bail, Result};
use thiserror::Error;

use crate::persistence::chunking::{self, ContentDigest};

#[derive(Debug, Error)]
#[error("piece {piece_idx} failed verification: {reason}")]
pub struct PieceIntegrityError {
    pub piece_idx: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("could not assemble payload: {0}")]
pub struct AssemblyError(pub String);

/// In-memory storage of the pieces of one resource. A slot is filled only with bytes
/// whose digest matches the expected one, so every owned piece is a verified piece.
pub struct PieceStore {
    piece_size: u64,
    total_size: u64,
    piece_hashes: Vec<ContentDigest>, // piece identified by position in array -> digest
    slots: Vec<Option<Vec<u8>>>,      // piece identified by position in array -> verified bytes
    owned_count: usize,
    owned_bytes: u64,
    pub wasted_bytes: u64, // bytes received that failed verification
}

impl PieceStore {
    pub fn new(total_size: u64, piece_size: u64, piece_hashes: Vec<ContentDigest>) -> Self {
        let expected_pieces = if piece_size == 0 {
            0
        } else {
            total_size.div_ceil(piece_size) as usize
        };
        if expected_pieces != piece_hashes.len() {
            log::warn!(
                "piece store created with {} digests but {} pieces are needed for {} bytes",
                piece_hashes.len(),
                expected_pieces,
                total_size
            );
        }
        let slots = vec![None; piece_hashes.len()];
        PieceStore {
            piece_size,
            total_size,
            piece_hashes,
            slots,
            owned_count: 0,
            owned_bytes: 0,
            wasted_bytes: 0,
        }
    }

    /// Store pre-filled with every piece of `payload`, used when seeding a local resource.
    pub fn from_payload(payload: &[u8], piece_size: u64) -> Result<Self> {
        let ranges = chunking::chunk(payload.len(), piece_size)?;
        let piece_hashes = ranges
            .iter()
            .map(|r| chunking::digest(&payload[r.clone()]))
            .collect();
        let mut store = PieceStore::new(payload.len() as u64, piece_size, piece_hashes);
        for (idx, range) in ranges.into_iter().enumerate() {
            store.write_piece(idx, payload[range].to_vec())?;
        }
        Ok(store)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_length(&self, piece_idx: usize) -> u64 {
        if piece_idx + 1 == self.num_pieces() {
            self.total_size - self.piece_size * (self.num_pieces() as u64 - 1)
        } else {
            self.piece_size
        }
    }

    pub fn piece_completion_status(&self, piece_idx: usize) -> bool {
        self.slots.get(piece_idx).is_some_and(|s| s.is_some())
    }

    pub fn completed_pieces(&self) -> usize {
        self.owned_count
    }

    pub fn completed(&self) -> bool {
        self.owned_count == self.num_pieces()
    }

    pub fn owned_bytes(&self) -> u64 {
        self.owned_bytes
    }

    pub fn owned_pieces(&self) -> Vec<usize> {
        (0..self.num_pieces())
            .filter(|idx| self.piece_completion_status(*idx))
            .collect()
    }

    pub fn missing_pieces(&self) -> Vec<usize> {
        (0..self.num_pieces())
            .filter(|idx| !self.piece_completion_status(*idx))
            .collect()
    }

    /// Verifies and stores a piece. Returns `Ok(false)` when the piece was already owned,
    /// in which case the stored bytes are left untouched.
    pub fn write_piece(&mut self, piece_idx: usize, data: Vec<u8>) -> Result<bool> {
        if piece_idx >= self.num_pieces() {
            bail!(PieceIntegrityError {
                piece_idx,
                reason: format!("index out of range (total pieces: {})", self.num_pieces()),
            });
        }
        if self.piece_completion_status(piece_idx) {
            log::debug!("we already have the piece {piece_idx}, will avoid to write it again");
            return Ok(false);
        }
        let expected_len = self.piece_length(piece_idx);
        if data.len() as u64 != expected_len {
            self.wasted_bytes += data.len() as u64;
            bail!(PieceIntegrityError {
                piece_idx,
                reason: format!("length {} differs from expected {expected_len}", data.len()),
            });
        }
        if chunking::digest(&data) != self.piece_hashes[piece_idx] {
            self.wasted_bytes += data.len() as u64;
            bail!(PieceIntegrityError {
                piece_idx,
                reason: "digest mismatch".to_string(),
            });
        }

        self.owned_bytes += expected_len;
        self.owned_count += 1;
        self.slots[piece_idx] = Some(data);
        Ok(true)
    }

    pub fn read_piece(&self, piece_idx: usize) -> Result<&[u8]> {
        match self.slots.get(piece_idx) {
            None => bail!(
                "requested to read piece idx {piece_idx} that is not in range (total pieces: {})",
                self.num_pieces()
            ),
            Some(None) => bail!("requested to read piece idx {piece_idx} that we don't have"),
            Some(Some(data)) => Ok(data),
        }
    }

    /// Concatenates all pieces in index order and checks the result against the
    /// expected total size and whole-payload digest.
    pub fn assemble(&self, content_digest: &ContentDigest) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.total_size as usize);
        for (idx, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(data) => payload.extend_from_slice(data),
                None => bail!(AssemblyError(format!("piece {idx} is missing"))),
            }
        }
        if payload.len() as u64 != self.total_size {
            bail!(AssemblyError(format!(
                "assembled {} bytes but {} were expected",
                payload.len(),
                self.total_size
            )));
        }
        if chunking::digest(&payload) != *content_digest {
            bail!(AssemblyError("content digest mismatch".to_string()));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::chunking::{digest, piece_digests};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn piece_lengths_follow_manifest_invariant() {
        let data = payload(25);
        let store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        assert_eq!(store.num_pieces(), 3);
        assert_eq!(store.piece_length(0), 10);
        assert_eq!(store.piece_length(1), 10);
        assert_eq!(store.piece_length(2), 5);
    }

    #[test]
    fn write_verified_piece() {
        let data = payload(25);
        let mut store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        assert_matches!(store.write_piece(1, data[10..20].to_vec()), Ok(true));
        assert!(store.piece_completion_status(1));
        assert_eq!(store.owned_bytes(), 10);
        assert_eq!(store.missing_pieces(), vec![0, 2]);
        assert_eq!(store.read_piece(1).unwrap(), &data[10..20]);
    }

    #[test]
    fn tampered_piece_is_never_stored() {
        let data = payload(25);
        let mut store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        let mut tampered = data[0..10].to_vec();
        tampered[3] ^= 0xff;
        for _ in 0..5 {
            let err = store.write_piece(0, tampered.clone()).unwrap_err();
            assert_matches!(err.downcast_ref::<PieceIntegrityError>(), Some(e) => {
                assert_eq!(e.piece_idx, 0);
            });
        }
        assert!(!store.piece_completion_status(0));
        assert_eq!(store.completed_pieces(), 0);
        assert_eq!(store.wasted_bytes, 50);
    }

    #[test]
    fn duplicate_piece_is_a_no_op() {
        let data = payload(25);
        let mut store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        assert_matches!(store.write_piece(2, data[20..25].to_vec()), Ok(true));
        assert_matches!(store.write_piece(2, data[20..25].to_vec()), Ok(false));
        assert_eq!(store.completed_pieces(), 1);
        assert_eq!(store.owned_bytes(), 5);
    }

    #[test]
    fn out_of_range_piece_is_rejected() {
        let data = payload(25);
        let mut store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        assert!(store.write_piece(3, vec![0; 5]).is_err());
        assert!(store.read_piece(3).is_err());
    }

    #[test]
    fn assemble_complete_store() {
        let data = payload(25);
        let store = PieceStore::from_payload(&data, 10).unwrap();
        assert!(store.completed());
        assert_eq!(store.assemble(&digest(&data)).unwrap(), data);
    }

    #[test]
    fn assemble_fails_when_incomplete_or_corrupted() {
        let data = payload(25);
        let mut store = PieceStore::new(25, 10, piece_digests(&data, 10).unwrap());
        store.write_piece(0, data[0..10].to_vec()).unwrap();
        let err = store.assemble(&digest(&data)).unwrap_err();
        assert_matches!(err.downcast_ref::<AssemblyError>(), Some(_));

        let complete = PieceStore::from_payload(&data, 10).unwrap();
        let err = complete.assemble(&digest(b"something else")).unwrap_err();
        assert_matches!(err.downcast_ref::<AssemblyError>(), Some(_));
    }
}
