//! High-level cellaserv client

use crate::admin::AdminClient;
use crate::config::ClientConfig;
use crate::connection::{Connection, Incoming};
use crate::Result;
use bytes::Bytes;
use cellaserv::broker::LOG_PREFIX;
use cellaserv::protocol::{
    encode_body, ErrorType, MessageType, Publish, Register, Reply, ReplyError, Request, Subscribe,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A client connected to one broker.
///
/// Requests can be issued concurrently through shared references. Events
/// and requests for registered services are read from the client itself,
/// so those need `&mut self`.
#[derive(Debug)]
pub struct CellaservClient {
    connection: Arc<Connection>,
    events: mpsc::UnboundedReceiver<Publish>,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl CellaservClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (connection, incoming) = Connection::connect(&config).await?;
        Ok(Self::from_connection(connection, incoming))
    }

    /// Connect with default settings to `address` (`host:port`).
    pub async fn connect_to(address: &str) -> Result<Self> {
        Self::connect(ClientConfig::new(address)).await
    }

    pub fn from_connection(connection: Connection, incoming: Incoming) -> Self {
        Self {
            connection: Arc::new(connection),
            events: incoming.events,
            requests: incoming.requests,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Client for the broker's built-in `cellaserv` service
    pub fn admin(&self) -> AdminClient {
        AdminClient::new(Arc::clone(&self.connection))
    }

    /// Register a service. Requests for it arrive on [`next_request`](Self::next_request).
    pub fn register(&self, name: &str, identification: Option<&str>) -> Result<()> {
        debug!("Registering {} {:?}", name, identification);
        let body = Register {
            name: name.to_string(),
            identification: identification.map(str::to_string),
        };
        self.connection
            .send(encode_body(MessageType::Register, &body))
    }

    /// Call `method` on a service with raw bytes.
    pub async fn request(
        &self,
        service: &str,
        identification: Option<&str>,
        method: &str,
        data: Option<Bytes>,
    ) -> Result<Option<Bytes>> {
        self.connection
            .request(service, identification, method, data)
            .await
    }

    /// Call `method` with JSON arguments and decode the JSON answer.
    pub async fn request_json<T, R>(
        &self,
        service: &str,
        identification: Option<&str>,
        method: &str,
        args: &T,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = Bytes::from(serde_json::to_vec(args)?);
        let answer = self
            .request(service, identification, method, Some(data))
            .await?;
        decode_json(answer)
    }

    /// Answer a request received on [`next_request`](Self::next_request).
    pub fn reply(&self, request: &Request, data: Option<Bytes>) -> Result<()> {
        self.send_reply(Reply {
            error: None,
            id: request.id,
            data,
        })
    }

    pub fn reply_json<T: Serialize + ?Sized>(&self, request: &Request, value: &T) -> Result<()> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        self.reply(request, Some(data))
    }

    pub fn reply_error(&self, request: &Request, kind: ErrorType, what: Option<String>) -> Result<()> {
        self.send_reply(Reply {
            error: Some(ReplyError {
                r#type: kind as i32,
                what,
            }),
            id: request.id,
            data: None,
        })
    }

    fn send_reply(&self, reply: Reply) -> Result<()> {
        self.connection
            .send(encode_body(MessageType::Reply, &reply))
    }

    /// Subscribe to an event name or a glob pattern such as `robot.*`.
    pub fn subscribe(&self, event: &str) -> Result<()> {
        let body = Subscribe {
            event: event.to_string(),
        };
        self.connection
            .send(encode_body(MessageType::Subscribe, &body))
    }

    pub fn publish(&self, event: &str, data: Option<Bytes>) -> Result<()> {
        let body = Publish {
            event: event.to_string(),
            data,
        };
        self.connection
            .send(encode_body(MessageType::Publish, &body))
    }

    pub fn publish_json<T: Serialize + ?Sized>(&self, event: &str, value: &T) -> Result<()> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        self.publish(event, Some(data))
    }

    /// Append `value` to the broker's `channel` log file.
    pub fn log<T: Serialize + ?Sized>(&self, channel: &str, value: &T) -> Result<()> {
        self.publish_json(&format!("{LOG_PREFIX}{channel}"), value)
    }

    /// Next event matching one of our subscriptions, `None` once disconnected
    pub async fn next_event(&mut self) -> Option<Publish> {
        self.events.recv().await
    }

    /// Next request for one of our services, `None` once disconnected
    pub async fn next_request(&mut self) -> Option<Request> {
        self.requests.recv().await
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<Publish> {
        &mut self.events
    }

    pub fn incoming_requests(&mut self) -> &mut mpsc::UnboundedReceiver<Request> {
        &mut self.requests
    }
}

/// Decode a JSON payload. A missing or empty payload reads as `null`.
pub(crate) fn decode_json<R: DeserializeOwned>(data: Option<Bytes>) -> Result<R> {
    match data {
        Some(data) if !data.is_empty() => Ok(serde_json::from_slice(&data)?),
        _ => Ok(serde_json::from_slice(b"null")?),
    }
}
