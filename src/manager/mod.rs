pub mod bandwidth_tracker;
pub mod download_manager;
pub mod events;
pub mod peer;
pub mod piece_requestor;
pub mod swarm_manager;
