//! Connection to a cellaserv broker
//!
//! One background task owns the framed socket. Outgoing frames reach it
//! through an unbounded queue; incoming replies are matched to waiting
//! requests by id, while published events and requests addressed to our
//! services are handed to the [`Incoming`] receivers.

use crate::config::ClientConfig;
use crate::error::CellaservClientError;
use crate::Result;
use bytes::Bytes;
use cellaserv::protocol::{
    encode_body, CellaservFrameCodec, ErrorType, Frame, MessageType, Publish, Reply, Request,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<Reply>>>;

/// Receivers for traffic the broker pushes to us
#[derive(Debug)]
pub struct Incoming {
    /// Events matching our subscriptions
    pub events: mpsc::UnboundedReceiver<Publish>,
    /// Requests routed to services we registered
    pub requests: mpsc::UnboundedReceiver<Request>,
}

#[derive(Debug)]
pub struct Connection {
    pub address: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Bytes>,
    pending: PendingReplies,
    request_timeout: Duration,
    _handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open a TCP connection to the broker named in `config`.
    pub async fn connect(config: &ClientConfig) -> Result<(Self, Incoming)> {
        debug!("Connecting to cellaserv at {}", config.address);

        let stream = timeout(config.connect_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| {
                CellaservClientError::timeout(config.connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                CellaservClientError::connection(format!(
                    "Failed to connect to {}: {}",
                    config.address, e
                ))
            })?;
        stream.set_nodelay(true)?;

        info!("Connected to cellaserv at {}", config.address);
        Ok(Self::from_stream(config.address.clone(), stream, config))
    }

    /// Run the protocol over an already established stream.
    pub fn from_stream<IO>(address: String, stream: IO, config: &ClientConfig) -> (Self, Incoming)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(
            stream,
            CellaservFrameCodec::with_max_frame_size(config.max_frame_size),
        );
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(DashMap::new());

        let loop_address = address.clone();
        let loop_pending = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            let result =
                connection_loop(framed, outgoing_rx, &loop_pending, events_tx, requests_tx).await;
            match result {
                Ok(()) => debug!("Connection to {} closed", loop_address),
                Err(e) => warn!("Connection to {} failed: {}", loop_address, e),
            }
            // Wake every waiting request with a closed channel
            loop_pending.clear();
        });

        // The broker tracks in-flight requests by id across all clients
        let connection = Self {
            address,
            next_id: AtomicU64::new(rand::random()),
            outgoing,
            pending,
            request_timeout: config.request_timeout,
            _handle: handle,
        };
        (connection, Incoming { events, requests })
    }

    /// Queue a raw frame for the broker.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| CellaservClientError::Closed)
    }

    /// Call `method` on a service and wait for its answer.
    pub async fn request(
        &self,
        service: &str,
        identification: Option<&str>,
        method: &str,
        data: Option<Bytes>,
    ) -> Result<Option<Bytes>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        let request = Request {
            service_name: service.to_string(),
            service_identification: identification.map(str::to_string),
            method: method.to_string(),
            data,
            id,
        };
        if let Err(e) = self.send(encode_body(MessageType::Request, &request)) {
            self.pending.remove(&id);
            return Err(e);
        }

        let reply = match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(CellaservClientError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                return Err(CellaservClientError::timeout(
                    self.request_timeout.as_millis() as u64,
                ));
            }
        };
        reply_result(reply)
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

fn reply_result(reply: Reply) -> Result<Option<Bytes>> {
    match reply.error {
        None => Ok(reply.data),
        Some(error) => Err(CellaservClientError::Reply {
            kind: ErrorType::try_from(error.r#type).unwrap_or(ErrorType::Custom),
            what: error.what,
        }),
    }
}

async fn connection_loop<IO>(
    mut framed: Framed<IO, CellaservFrameCodec>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Bytes>,
    pending: &PendingReplies,
    events_tx: mpsc::UnboundedSender<Publish>,
    requests_tx: mpsc::UnboundedSender<Request>,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = outgoing_rx.recv() => {
                match frame {
                    Some(frame) => framed.send(frame).await?,
                    // Every handle on the connection is gone
                    None => return Ok(()),
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(raw) => {
                        let frame = Frame::decode(raw?)?;
                        handle_incoming(frame, pending, &events_tx, &requests_tx);
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

fn handle_incoming(
    frame: Frame,
    pending: &PendingReplies,
    events_tx: &mpsc::UnboundedSender<Publish>,
    requests_tx: &mpsc::UnboundedSender<Request>,
) {
    let content = frame.message.content;
    match MessageType::try_from(frame.message.r#type) {
        Ok(MessageType::Reply) => match Reply::decode(content) {
            Ok(reply) => match pending.remove(&reply.id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(reply);
                }
                None => debug!("Dropping reply {} nobody waits for", reply.id),
            },
            Err(e) => warn!("Could not decode reply: {}", e),
        },
        Ok(MessageType::Publish) => match Publish::decode(content) {
            Ok(publish) => {
                let _ = events_tx.send(publish);
            }
            Err(e) => warn!("Could not decode publish: {}", e),
        },
        Ok(MessageType::Request) => match Request::decode(content) {
            Ok(request) => {
                if requests_tx.send(request).is_err() {
                    debug!("Request received but nobody serves it");
                }
            }
            Err(e) => warn!("Could not decode request: {}", e),
        },
        Ok(other) => warn!("Unexpected {} from the broker", other.as_str()),
        Err(_) => warn!("Unknown message type {}", frame.message.r#type),
    }
}
