use std::ops::Range;

use anyhow::Result;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type ContentDigest = [u8; 32];

#[derive(Debug, Error)]
#[error("invalid input: {0}")]
pub struct InvalidInputError(pub String);

/// Splits `payload_len` bytes into consecutive ranges of `piece_size` bytes, the last one
/// possibly shorter. An empty payload yields no ranges.
pub fn chunk(payload_len: usize, piece_size: u64) -> Result<Vec<Range<usize>>> {
    if piece_size == 0 {
        return Err(InvalidInputError("piece size must be greater than 0".to_string()).into());
    }
    let piece_size = usize::try_from(piece_size)
        .map_err(|_| InvalidInputError(format!("piece size {piece_size} does not fit memory")))?;

    let mut ranges = Vec::with_capacity(payload_len.div_ceil(piece_size));
    let mut begin = 0;
    while begin < payload_len {
        let end = payload_len.min(begin + piece_size);
        ranges.push(begin..end);
        begin = end;
    }
    Ok(ranges)
}

pub fn digest(bytes: &[u8]) -> ContentDigest {
    Sha256::digest(bytes).into()
}

/// Returns the digest of every piece of `payload`, in piece order.
pub fn piece_digests(payload: &[u8], piece_size: u64) -> Result<Vec<ContentDigest>> {
    Ok(chunk(payload.len(), piece_size)?
        .into_iter()
        .map(|range| digest(&payload[range]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_splits_in_fixed_size_pieces_with_shorter_tail() {
        let ranges = chunk(25, 10).unwrap();
        assert_eq!(ranges, vec![0..10, 10..20, 20..25]);
    }

    #[test]
    fn chunk_exact_multiple_has_no_short_tail() {
        let ranges = chunk(30, 10).unwrap();
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| r.len() == 10));
    }

    #[test]
    fn chunk_concatenation_rebuilds_payload() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for piece_size in [1u64, 7, 64, 999, 1000, 4096] {
            let ranges = chunk(payload.len(), piece_size).unwrap();
            assert_eq!(
                ranges.len(),
                payload.len().div_ceil(piece_size as usize),
                "piece size {piece_size}"
            );
            let rebuilt: Vec<u8> = ranges
                .iter()
                .flat_map(|r| payload[r.clone()].iter().copied())
                .collect();
            assert_eq!(rebuilt, payload);
        }
    }

    #[test]
    fn chunk_empty_payload() {
        assert_eq!(chunk(0, 10).unwrap(), Vec::<Range<usize>>::new());
    }

    #[test]
    fn chunk_rejects_zero_piece_size() {
        let err = chunk(10, 0).unwrap_err();
        assert_matches!(err.downcast_ref::<InvalidInputError>(), Some(_));
    }

    #[test]
    fn digest_is_stable_and_discriminating() {
        assert_eq!(digest(b"hello"), digest(b"hello"));
        assert_ne!(digest(b"hello"), digest(b"hello!"));
        assert_ne!(digest(b""), digest(b"\0"));
        assert_eq!(
            hex::encode(digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
