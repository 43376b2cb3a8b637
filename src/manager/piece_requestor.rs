use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::protocol::ParticipantId;

pub struct OutstandingRequest {
    pub participant: ParticipantId,
    pub issued_at: Instant,
}

/// Keeps track of which piece is requested to which peer, and of the pieces that failed
/// to arrive (timeout or integrity mismatch) so that they are retried elsewhere.
pub struct PieceRequestor {
    outstanding_piece_requests: HashMap<usize, OutstandingRequest>, // piece idx -> request
    failed_attempts: HashMap<usize, u32>,                           // piece idx -> failed attempts
    last_failed_participant: HashMap<usize, ParticipantId>,         // piece idx -> who failed it last
    max_attempts: u32,
    max_outstanding_per_peer: usize,
}

impl PieceRequestor {
    pub fn new(max_attempts: u32, max_outstanding_per_peer: usize) -> Self {
        PieceRequestor {
            outstanding_piece_requests: HashMap::new(),
            failed_attempts: HashMap::new(),
            last_failed_participant: HashMap::new(),
            max_attempts,
            max_outstanding_per_peer,
        }
    }

    pub fn is_requested(&self, piece_idx: usize) -> bool {
        self.outstanding_piece_requests.contains_key(&piece_idx)
    }

    /// The peer an outstanding request for `piece_idx` was sent to.
    pub fn assigned_to(&self, piece_idx: usize) -> Option<ParticipantId> {
        self.outstanding_piece_requests
            .get(&piece_idx)
            .map(|r| r.participant)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding_piece_requests.len()
    }

    pub fn outstanding_count_for_peer(&self, participant: ParticipantId) -> usize {
        self.outstanding_piece_requests
            .values()
            .filter(|r| r.participant == participant)
            .count()
    }

    /// Flat split of the missing, not yet requested pieces over `peers` (in connection order):
    /// peer `i` gets the `i`-th contiguous block of `ceil(unrequested / peers)` pieces.
    /// A piece whose last attempt failed on its block owner goes to the next peer holding it,
    /// back to the same peer only when nobody else does. A piece the block owner is known not
    /// to hold goes to the next peer holding it.
    /// No peer gets more than the per-peer outstanding limit.
    pub fn generate_requests_to_send<F: Fn(ParticipantId, usize) -> bool>(
        &mut self,
        missing_pieces: &[usize],
        peers: &[ParticipantId],
        have_piece: F,
    ) -> Vec<(ParticipantId, usize)> {
        if peers.is_empty() {
            return Vec::new();
        }
        let unrequested: Vec<usize> = missing_pieces
            .iter()
            .copied()
            .filter(|idx| !self.is_requested(*idx))
            .collect();
        if unrequested.is_empty() {
            return Vec::new();
        }

        let mut capacity: Vec<usize> = peers
            .iter()
            .map(|p| {
                self.max_outstanding_per_peer
                    .saturating_sub(self.outstanding_count_for_peer(*p))
            })
            .collect();
        let block_len = unrequested.len().div_ceil(peers.len());
        let now = Instant::now();
        let mut requests = Vec::new();

        for (position, piece_idx) in unrequested.into_iter().enumerate() {
            let block_owner = position / block_len;
            let avoid = self.last_failed_participant.get(&piece_idx).copied();
            let holders: Vec<usize> = (0..peers.len())
                .map(|offset| (block_owner + offset) % peers.len())
                .filter(|i| have_piece(peers[*i], piece_idx))
                .collect();
            let candidate = holders
                .iter()
                .copied()
                .find(|i| Some(peers[*i]) != avoid)
                .or_else(|| holders.first().copied());
            let Some(peer_pos) = candidate else {
                continue; // nobody can serve this piece now
            };
            if capacity[peer_pos] == 0 {
                continue;
            }
            capacity[peer_pos] -= 1;
            self.outstanding_piece_requests.insert(
                piece_idx,
                OutstandingRequest {
                    participant: peers[peer_pos],
                    issued_at: now,
                },
            );
            requests.push((peers[peer_pos], piece_idx));
        }
        requests
    }

    pub fn piece_request_completed(&mut self, piece_idx: usize) -> Option<ParticipantId> {
        self.failed_attempts.remove(&piece_idx);
        self.last_failed_participant.remove(&piece_idx);
        self.outstanding_piece_requests
            .remove(&piece_idx)
            .map(|r| r.participant)
    }

    /// Releases the piece for a new request. Returns true when the piece exhausted its attempts.
    pub fn piece_request_failed(&mut self, piece_idx: usize, participant: ParticipantId) -> bool {
        self.outstanding_piece_requests.remove(&piece_idx);
        self.last_failed_participant.insert(piece_idx, participant);
        let attempts = self.failed_attempts.entry(piece_idx).or_insert(0);
        *attempts += 1;
        *attempts >= self.max_attempts
    }

    pub fn failed_attempts(&self, piece_idx: usize) -> u32 {
        self.failed_attempts.get(&piece_idx).copied().unwrap_or(0)
    }

    /// Forgets the requests assigned to a peer without charging an attempt.
    pub fn remove_assignments_to_peer(&mut self, participant: ParticipantId) -> Vec<usize> {
        let mut released = Vec::new();
        self.outstanding_piece_requests.retain(|piece_idx, r| {
            if r.participant == participant {
                released.push(*piece_idx);
                false
            } else {
                true
            }
        });
        released
    }

    /// Requests older than `request_timeout`, as (piece idx, peer). They stay outstanding
    /// until failed with `piece_request_failed`.
    pub fn stale_requests(&self, request_timeout: Duration) -> Vec<(usize, ParticipantId)> {
        let now = Instant::now();
        let stale: Vec<(usize, ParticipantId)> = self
            .outstanding_piece_requests
            .iter()
            .filter(|(_, r)| now.duration_since(r.issued_at) >= request_timeout)
            .map(|(piece_idx, r)| (*piece_idx, r.participant))
            .collect();
        for (piece_idx, participant) in stale.iter() {
            log::debug!("stale request to participant {participant} for piece {piece_idx}");
        }
        stale
    }

    pub fn clear(&mut self) {
        self.outstanding_piece_requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut reqs: Vec<(ParticipantId, usize)>) -> Vec<(ParticipantId, usize)> {
        reqs.sort_by_key(|(_, idx)| *idx);
        reqs
    }

    #[tokio::test]
    async fn missing_pieces_are_split_in_contiguous_blocks() {
        let mut requestor = PieceRequestor::new(5, 100);
        let reqs = requestor.generate_requests_to_send(&[0, 1, 2, 3, 4, 5, 6], &[10, 20, 30], |_, _| true);
        // ceil(7 / 3) = 3 pieces per block
        assert_eq!(
            sorted(reqs),
            vec![(10, 0), (10, 1), (10, 2), (20, 3), (20, 4), (20, 5), (30, 6)]
        );
        assert_eq!(requestor.outstanding_count(), 7);
        assert_eq!(requestor.assigned_to(4), Some(20));
        assert_eq!(requestor.assigned_to(9), None);
        // nothing left to assign
        assert!(requestor
            .generate_requests_to_send(&[0, 1, 2, 3, 4, 5, 6], &[10, 20, 30], |_, _| true)
            .is_empty());
    }

    #[tokio::test]
    async fn per_peer_limit_is_respected() {
        let mut requestor = PieceRequestor::new(5, 2);
        let reqs = requestor.generate_requests_to_send(&[0, 1, 2, 3], &[10], |_, _| true);
        assert_eq!(sorted(reqs), vec![(10, 0), (10, 1)]);
        requestor.piece_request_completed(0);
        let reqs = requestor.generate_requests_to_send(&[1, 2, 3], &[10], |_, _| true);
        assert_eq!(reqs, vec![(10, 2)]);
    }

    #[tokio::test]
    async fn failed_piece_is_retried_on_another_peer() {
        let mut requestor = PieceRequestor::new(5, 100);
        requestor.generate_requests_to_send(&[0, 1], &[10, 20], |_, _| true);
        assert!(!requestor.piece_request_failed(0, 10));
        let reqs = requestor.generate_requests_to_send(&[0, 1], &[10, 20], |_, _| true);
        assert_eq!(reqs, vec![(20, 0)]);
        assert_eq!(requestor.failed_attempts(0), 1);
    }

    #[tokio::test]
    async fn single_peer_gets_retries_too() {
        let mut requestor = PieceRequestor::new(5, 100);
        requestor.generate_requests_to_send(&[0], &[10], |_, _| true);
        requestor.piece_request_failed(0, 10);
        assert_eq!(
            requestor.generate_requests_to_send(&[0], &[10], |_, _| true),
            vec![(10, 0)]
        );
    }

    #[tokio::test]
    async fn failed_peer_is_asked_again_when_it_is_the_only_holder() {
        let mut requestor = PieceRequestor::new(5, 100);
        let only_10_has_piece_0 = |p: ParticipantId, idx: usize| idx != 0 || p == 10;
        assert_eq!(
            requestor.generate_requests_to_send(&[0], &[10, 20], only_10_has_piece_0),
            vec![(10, 0)]
        );
        assert!(!requestor.piece_request_failed(0, 10));
        for attempt in 2..=3 {
            assert_eq!(
                requestor.generate_requests_to_send(&[0], &[10, 20], only_10_has_piece_0),
                vec![(10, 0)]
            );
            assert!(!requestor.piece_request_failed(0, 10));
            assert_eq!(requestor.failed_attempts(0), attempt);
        }
        // once another holder shows up it is preferred
        assert_eq!(
            requestor.generate_requests_to_send(&[0], &[10, 20], |_, _| true),
            vec![(20, 0)]
        );
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let mut requestor = PieceRequestor::new(3, 100);
        for _ in 0..2 {
            requestor.generate_requests_to_send(&[0], &[10], |_, _| true);
            assert!(!requestor.piece_request_failed(0, 10));
        }
        requestor.generate_requests_to_send(&[0], &[10], |_, _| true);
        assert!(requestor.piece_request_failed(0, 10));
    }

    #[tokio::test]
    async fn pieces_go_to_peers_holding_them() {
        let mut requestor = PieceRequestor::new(5, 100);
        // peer 10 only has piece 1, peer 20 has everything
        let reqs = requestor.generate_requests_to_send(&[0, 1, 2, 3], &[10, 20], |p, idx| {
            p == 20 || idx == 1
        });
        assert_eq!(sorted(reqs), vec![(20, 0), (10, 1), (20, 2), (20, 3)]);
    }

    #[tokio::test]
    async fn disconnected_peer_releases_its_requests() {
        let mut requestor = PieceRequestor::new(5, 100);
        requestor.generate_requests_to_send(&[0, 1, 2, 3], &[10, 20], |_, _| true);
        let mut released = requestor.remove_assignments_to_peer(10);
        released.sort();
        assert_eq!(released, vec![0, 1]);
        assert_eq!(requestor.failed_attempts(0), 0);
        let reqs = requestor.generate_requests_to_send(&[0, 1, 2, 3], &[20], |_, _| true);
        assert_eq!(sorted(reqs), vec![(20, 0), (20, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_are_reported() {
        let mut requestor = PieceRequestor::new(5, 100);
        requestor.generate_requests_to_send(&[0], &[10], |_, _| true);
        tokio::time::advance(Duration::from_secs(10)).await;
        requestor.generate_requests_to_send(&[0, 1], &[10], |_, _| true);
        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(
            requestor.stale_requests(Duration::from_secs(30)),
            vec![(0, 10)]
        );
    }
}
