//! Process-wide IMEI → active-socket map (§4.4): an explicitly-owned
//! singleton created at startup and handed to every session, backed by a
//! `DashMap` so concurrent lookups never block each other while a
//! register/unregister is in flight.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

/// Monotonic id distinguishing sessions so a late `unregister` from a
/// superseded session can never evict a newer one's entry, even though the
/// socket itself isn't `Eq`.
pub type SessionId = u64;

pub fn next_session_id() -> SessionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Serial numbers stamped on server-originated command frames (§4.5). Wraps
/// at `u16::MAX` like the wire field itself; a GT06 terminal correlates by
/// serial alone, so collisions across a full wraparound are the downlink
/// controller's problem (bounded by `T_cmd`), not the registry's.
pub fn next_command_serial() -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a live session's writable half, shared between the session's
/// own reply writes and the downlink controller. Serialized by `write`
/// (§4.2's per-session write mutex).
pub struct SessionHandle {
    pub session_id: SessionId,
    pub remote_addr: std::net::SocketAddr,
    pub connected_since: DateTime<Utc>,
    pub write: Arc<Mutex<WriteHalf<TcpStream>>>,
    pub pending_replies: Arc<DashMap<u16, oneshot::Sender<Vec<u8>>>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, SessionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersede any prior entry for this IMEI. The displaced session is
    /// expected to tear itself down on its next read/write error.
    pub fn register(&self, imei: String, handle: SessionHandle) {
        self.entries.insert(imei, handle);
    }

    /// No-op unless the current entry's session is still `session_id`
    /// (prevents a late unregister from a superseded session removing a
    /// newer one's entry).
    pub fn unregister(&self, imei: &str, session_id: SessionId) {
        if let Some(entry) = self.entries.get(imei) {
            if entry.session_id != session_id {
                return;
            }
        } else {
            return;
        }
        self.entries.remove_if(imei, |_, v| v.session_id == session_id);
    }

    pub fn get(&self, imei: &str) -> Option<Arc<Mutex<WriteHalf<TcpStream>>>> {
        self.entries.get(imei).map(|e| e.write.clone())
    }

    pub fn get_pending_replies(&self, imei: &str) -> Option<Arc<DashMap<u16, oneshot::Sender<Vec<u8>>>>> {
        self.entries.get(imei).map(|e| e.pending_replies.clone())
    }

    pub fn is_registered(&self, imei: &str) -> bool {
        self.entries.contains_key(imei)
    }

    pub fn list_registered(&self) -> HashSet<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_entries() {
        let registry = ConnectionRegistry::new();
        assert!(registry.list_registered().is_empty());
        assert!(!registry.is_registered("0351091334802439"));
    }

    #[test]
    fn session_ids_are_monotonic_and_unique() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }
}
