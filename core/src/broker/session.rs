//! Per-connection session
//!
//! A session owns one client socket. Its read half is consumed frame by frame
//! in arrival order and each message is dispatched to the [`Broker`]. Its
//! write half belongs to a separate writer task fed by the connection's
//! [`Outbound`] queue, so routing never waits on a slow peer.
//!
//! Whatever ends the read loop (EOF, I/O error, oversized frame, undecodable
//! envelope), the connection is torn down exactly once before returning.

use bytes::Bytes;
use futures::SinkExt;
use prost::Message as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::connection::{ConnId, Outbound};
use super::state::Broker;
use crate::protocol::{
    CellaservFrameCodec, Frame, MessageType, Publish, Register, Reply, Request, Subscribe,
};
use crate::Result;

/// Serve one client until its stream ends.
pub async fn serve_connection<IO>(
    broker: Arc<Broker>,
    stream: IO,
    peer: SocketAddr,
    max_frame_size: usize,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let codec = CellaservFrameCodec::with_max_frame_size(max_frame_size);
    let (reader, writer) = tokio::io::split(stream);

    let (outbound, rx) = Outbound::channel();
    tokio::spawn(write_loop(FramedWrite::new(writer, codec.clone()), rx, peer));

    let conn = broker.connect(peer, outbound);
    let mut frames = FramedRead::new(reader, codec);
    let result = read_loop(&broker, conn, peer, &mut frames).await;

    // Dropping the connection entry closes the outbound queue, which lets the
    // writer task finish once it has flushed what is left.
    broker.disconnect(conn);
    result
}

async fn read_loop<R>(
    broker: &Arc<Broker>,
    conn: ConnId,
    peer: SocketAddr,
    frames: &mut FramedRead<R, CellaservFrameCodec>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(item) = frames.next().await {
        let raw = item?;
        debug!("[Net] {} bytes from {}", raw.len(), peer);
        broker.record_incoming(peer, &raw);

        let frame = Frame::decode(raw)?;
        dispatch(broker, conn, peer, &frame);
    }
    Ok(())
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, CellaservFrameCodec>,
    mut rx: mpsc::Receiver<Bytes>,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("[Net] Write to {} failed: {}", peer, e);
            break;
        }
    }
}

fn decode_body<M>(kind: MessageType, content: &Bytes, peer: SocketAddr) -> Option<M>
where
    M: prost::Message + Default,
{
    match M::decode(content.clone()) {
        Ok(body) => Some(body),
        Err(e) => {
            warn!("[Net] Could not unmarshal {} from {}: {}", kind.as_str(), peer, e);
            None
        }
    }
}

/// Route one message. Malformed bodies and unknown types only drop that message.
fn dispatch(broker: &Arc<Broker>, conn: ConnId, peer: SocketAddr, frame: &Frame) {
    let Some(kind) = frame.message_type() else {
        warn!(
            "[Net] Unknown message type {} from {}",
            frame.message.r#type, peer
        );
        return;
    };
    let content = &frame.message.content;

    match kind {
        MessageType::Register => {
            if let Some(body) = decode_body::<Register>(kind, content, peer) {
                broker.register(conn, body);
            }
        }
        MessageType::Request => {
            if let Some(body) = decode_body::<Request>(kind, content, peer) {
                broker.route_request(conn, frame, body);
            }
        }
        MessageType::Reply => {
            if let Some(body) = decode_body::<Reply>(kind, content, peer) {
                broker.route_reply(conn, frame, body);
            }
        }
        MessageType::Subscribe => {
            if let Some(body) = decode_body::<Subscribe>(kind, content, peer) {
                broker.subscribe(conn, &body.event);
            }
        }
        MessageType::Publish => {
            if let Some(body) = decode_body::<Publish>(kind, content, peer) {
                broker.publish(conn, frame, body);
            }
        }
    }
}
