//! In-flight request tracking
//!
//! Every routed request gets an entry keyed by its id, holding the
//! originating connection and the handle of its timeout task. Whichever of
//! the reply or the timeout arrives first removes the entry; the other finds
//! nothing and does nothing. Each entry carries a sequence number so that a
//! timer left over from an earlier request with the same id cannot evict a
//! newer one.

use std::collections::HashMap;
use tokio::task::AbortHandle;

use super::connection::ConnId;

#[derive(Debug)]
struct PendingRequest {
    origin: ConnId,
    seq: u64,
    timer: Option<AbortHandle>,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<u64, PendingRequest>,
    next_seq: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Start tracking `id`. If the id was already in flight, the previous
    /// entry is replaced, its timer cancelled, and its origin returned.
    pub fn track(&mut self, id: u64, origin: ConnId, seq: u64) -> Option<ConnId> {
        let previous = self.entries.insert(
            id,
            PendingRequest {
                origin,
                seq,
                timer: None,
            },
        );
        previous.map(|p| {
            if let Some(timer) = p.timer {
                timer.abort();
            }
            p.origin
        })
    }

    /// Attach the timeout task to the entry created by [`track`](Self::track).
    ///
    /// If the entry is already gone or belongs to another request the timer
    /// is aborted right away.
    pub fn arm(&mut self, id: u64, seq: u64, timer: AbortHandle) {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.seq == seq => entry.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// A reply arrived: remove the entry, cancel its timer, return the origin.
    pub fn resolve(&mut self, id: u64) -> Option<ConnId> {
        let entry = self.entries.remove(&id)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        Some(entry.origin)
    }

    /// The timer for `(id, seq)` fired. Returns the origin if that request was
    /// still pending.
    pub fn expire(&mut self, id: u64, seq: u64) -> Option<ConnId> {
        match self.entries.get(&id) {
            Some(entry) if entry.seq == seq => self.entries.remove(&id).map(|e| e.origin),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
