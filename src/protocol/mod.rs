pub mod peer_messages;
pub mod tcp_frames;
pub mod tracker_messages;
pub mod wire_protocol;

/// Identifier of a participant (a user) in the swarm, as assigned by the platform.
pub type ParticipantId = u64;
