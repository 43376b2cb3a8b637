pub mod chunking;
pub mod piece_store;
