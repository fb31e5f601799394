//! Packet capture of broker traffic
//!
//! When enabled, every frame read from or written to a client is appended to
//! a libpcap file as an encoded [`LogMessage`] whose sender is the peer
//! address (incoming) or `cellaserv` (outgoing). The link type is a private
//! one so dissectors can recognise the payload.

use bytes::{BufMut, Bytes};
use chrono::Utc;
use parking_lot::Mutex;
use prost::Message as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{error, info};

use crate::protocol::LogMessage;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_LINK_TYPE: u32 = 4200;

pub const PCAP_GLOBAL_HEADER_LEN: usize = 24;
pub const PCAP_RECORD_HEADER_LEN: usize = 16;

/// Room for the `LogMessage` fields around a frame: tags, length varints and
/// the sender address
const LOG_MESSAGE_OVERHEAD: usize = 128;

/// Sender recorded for frames written by the broker
pub const OUTGOING_SENDER: &str = "cellaserv";

#[derive(Debug)]
pub struct PcapDumper {
    out: Mutex<BufWriter<File>>,
    snaplen: u32,
}

impl PcapDumper {
    /// Create (truncate) `path` and write the pcap global header.
    ///
    /// The snapshot length covers a whole frame of `max_frame_size` bytes;
    /// anything longer is truncated in the capture.
    pub fn create(path: &Path, max_frame_size: usize) -> io::Result<Self> {
        let snaplen = u32::try_from(max_frame_size.saturating_add(LOG_MESSAGE_OVERHEAD))
            .unwrap_or(u32::MAX);
        let mut out = BufWriter::new(File::create(path)?);

        let mut header = Vec::with_capacity(PCAP_GLOBAL_HEADER_LEN);
        header.put_u32_le(PCAP_MAGIC);
        header.put_u16_le(PCAP_VERSION_MAJOR);
        header.put_u16_le(PCAP_VERSION_MINOR);
        header.put_i32_le(0); // thiszone
        header.put_u32_le(0); // sigfigs
        header.put_u32_le(snaplen);
        header.put_u32_le(PCAP_LINK_TYPE);
        out.write_all(&header)?;

        info!("[Dump] Capturing traffic to {}", path.display());
        Ok(Self {
            out: Mutex::new(out),
            snaplen,
        })
    }

    pub fn record_incoming(&self, peer: SocketAddr, frame: &Bytes) {
        self.record(peer.to_string(), frame.clone());
    }

    pub fn record_outgoing(&self, frame: &Bytes) {
        self.record(OUTGOING_SENDER.to_string(), frame.clone());
    }

    pub fn flush(&self) {
        if let Err(e) = self.out.lock().flush() {
            error!("[Dump] Could not flush capture: {}", e);
        }
    }

    fn record(&self, sender: String, content: Bytes) {
        let payload = LogMessage { sender, content }.encode_to_vec();
        let now = Utc::now();
        let orig_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        let incl_len = orig_len.min(self.snaplen);
        let included = &payload[..incl_len as usize];

        let mut record = Vec::with_capacity(PCAP_RECORD_HEADER_LEN + included.len());
        record.put_u32_le(now.timestamp() as u32);
        record.put_u32_le(now.timestamp_subsec_micros());
        record.put_u32_le(incl_len);
        record.put_u32_le(orig_len);
        record.extend_from_slice(included);

        if let Err(e) = self.out.lock().write_all(&record) {
            error!("[Dump] Could not write capture record: {}", e);
        }
    }
}

impl Drop for PcapDumper {
    fn drop(&mut self) {
        let _ = self.out.get_mut().flush();
    }
}


/// `(incl_len, orig_len, payload)` of every record in a capture file
#[cfg(test)]
pub(crate) fn read_records(path: &Path) -> Vec<(u32, u32, Bytes)> {
    use bytes::Buf;

    let data = Bytes::from(std::fs::read(path).unwrap());
    let mut buf = data.slice(PCAP_GLOBAL_HEADER_LEN..);
    let mut records = Vec::new();
    while buf.has_remaining() {
        let _sec = buf.get_u32_le();
        let usec = buf.get_u32_le();
        assert!(usec < 1_000_000);
        let incl = buf.get_u32_le();
        let orig = buf.get_u32_le();
        records.push((incl, orig, buf.split_to(incl as usize)));
    }
    records
}
