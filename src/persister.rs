//! Durable storage port for a raft node (spec.md 4.3).
//!
//! Mirrors the original's `Persister`: two named byte blobs, `raft_state`
//! (term/vote/log) and `snapshot` (compacted state-machine state), saved
//! either independently or atomically as a pair so a crash can never
//! observe a snapshot without the raft metadata that makes it valid.

use std::sync::Mutex;

/// A storage port a `RaftNode` writes through on every persist-before-reply
/// boundary. `MemoryPersister` is the only implementation needed here
/// (there is no on-disk persistence in scope); a real deployment would
/// swap in a file- or object-store-backed implementation without
/// touching raft itself.
pub trait Persister: Send + Sync {
    fn save_raft_state(&self, state: Vec<u8>);
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>);
    fn raft_state(&self) -> Vec<u8>;
    fn snapshot(&self) -> Vec<u8>;
    fn raft_state_size(&self) -> usize;
}

#[derive(Default)]
struct Blobs {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

pub struct MemoryPersister {
    blobs: Mutex<Blobs>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister { blobs: Mutex::new(Blobs::default()) }
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl Persister for MemoryPersister {
    fn save_raft_state(&self, state: Vec<u8>) {
        self.blobs.lock().unwrap().raft_state = state;
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.raft_state = state;
        blobs.snapshot = snapshot;
    }

    fn raft_state(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().raft_state.clone()
    }

    fn snapshot(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().snapshot.clone()
    }

    fn raft_state_size(&self) -> usize {
        self.blobs.lock().unwrap().raft_state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_saves_do_not_clobber_each_other() {
        let p = MemoryPersister::new();
        p.save_raft_state(vec![1, 2, 3]);
        assert_eq!(p.raft_state(), vec![1, 2, 3]);
        assert!(p.snapshot().is_empty());
    }

    #[test]
    fn paired_save_replaces_both_atomically() {
        let p = MemoryPersister::new();
        p.save_raft_state(vec![1]);
        p.save_state_and_snapshot(vec![2], vec![9, 9]);
        assert_eq!(p.raft_state(), vec![2]);
        assert_eq!(p.snapshot(), vec![9, 9]);
    }

    #[test]
    fn raft_state_size_tracks_latest_save() {
        let p = MemoryPersister::new();
        p.save_raft_state(vec![0; 42]);
        assert_eq!(p.raft_state_size(), 42);
    }
}
