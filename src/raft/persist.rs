//! Encoding helpers for the persist-before-reply boundary (spec.md
//! 4.3). Kept as free functions, separate from `RaftNode`, so the wire
//! format can be unit tested without spinning up a node.

use super::state::PersistentState;

pub fn encode_persistent_state(state: &PersistentState) -> Vec<u8> {
    bincode::serialize(state).expect("PersistentState is always serializable")
}

pub fn decode_persistent_state(bytes: &[u8]) -> Result<PersistentState, bincode::Error> {
    bincode::deserialize(bytes)
}
