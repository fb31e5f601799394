//! Connection identity and outbound queue

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::registry::ServiceKey;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one accepted client connection, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Frames queued for one connection before further frames are dropped
pub const OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutboundError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Sending half of a connection's writer task.
///
/// Frames are queued without blocking; the writer task drains them to the
/// socket in order. A peer that stops reading fills its queue, after which
/// frames for it are refused instead of buffered.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue an envelope without waiting.
    pub fn send(&self, frame: Bytes) -> Result<(), OutboundError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => OutboundError::Full,
            TrySendError::Closed(_) => OutboundError::Closed,
        })
    }
}

/// Everything the broker knows about a live connection
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnId,
    pub addr: SocketAddr,
    /// Set by `describe-conn`
    pub name: Option<String>,
    pub outbound: Outbound,
    /// Services this connection spies on
    pub spying: Vec<ServiceKey>,
}

impl ConnectionEntry {
    pub fn new(id: ConnId, addr: SocketAddr, outbound: Outbound) -> Self {
        Self {
            id,
            addr,
            name: None,
            outbound,
            spying: Vec::new(),
        }
    }
}

/// JSON shape of a connection in `list-connections` and rename notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "Addr")]
    pub address: String,
    #[serde(rename = "Name")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_refuses_frames() {
        let (outbound, mut rx) = Outbound::with_capacity(2);
        assert_eq!(outbound.send(Bytes::from_static(b"1")), Ok(()));
        assert_eq!(outbound.send(Bytes::from_static(b"2")), Ok(()));
        assert_eq!(
            outbound.send(Bytes::from_static(b"3")),
            Err(OutboundError::Full)
        );

        // Draining makes room again
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"1"));
        assert_eq!(outbound.send(Bytes::from_static(b"4")), Ok(()));

        drop(rx);
        assert_eq!(
            outbound.send(Bytes::from_static(b"5")),
            Err(OutboundError::Closed)
        );
    }
}
