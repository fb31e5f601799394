//! Shared broker state and routing operations
//!
//! All routing tables live in one [`BrokerState`] behind a single mutex.
//! Every operation below takes the lock once and never awaits while holding
//! it: frames for other connections are queued on their outbound channels,
//! which never blocks. Teardown of a connection therefore happens in one
//! critical section and can never be observed half done by a router.
//!
//! Log-sink writes and capture records are collected while locked and
//! performed after the lock is released.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::admin;
use super::connection::{ConnId, ConnectionEntry, ConnectionInfo, Outbound, OutboundError};
use super::pending::PendingRequests;
use super::registry::{LookupError, ServiceInfo, ServiceKey, ServiceRegistry};
use super::subscriptions::SubscriptionTable;
use crate::config::BrokerConfig;
use crate::dump::PcapDumper;
use crate::log_sink::{session_name_now, LogSink, LogSinkError};
use crate::metrics::BrokerMetrics;
use crate::protocol::{
    encode_error_reply, encode_publish, encode_reply, ErrorType, Frame, Publish, Register, Reply,
    Request,
};

/// Name of the built-in administrative service
pub const ADMIN_SERVICE: &str = "cellaserv";

/// Events starting with this prefix are also written to the log sink
pub const LOG_PREFIX: &str = "log.";

/// Events published by the broker itself
pub mod events {
    pub const NEW_CONNECTION: &str = "log.cellaserv.new-connection";
    pub const CLOSE_CONNECTION: &str = "log.cellaserv.close-connection";
    pub const NEW_SERVICE: &str = "log.cellaserv.new-service";
    pub const LOST_SERVICE: &str = "log.cellaserv.lost-service";
    pub const NEW_SUBSCRIBER: &str = "log.cellaserv.new-subscriber";
    pub const LOST_SUBSCRIBER: &str = "log.cellaserv.lost-subscriber";
    pub const CONNECTION_RENAME: &str = "log.cellaserv.connection-rename";
    pub const NEW_LOG_SESSION: &str = "log.cellaserv.new-log-session";
}

#[derive(Debug, Default)]
struct BrokerState {
    connections: HashMap<ConnId, ConnectionEntry>,
    registry: ServiceRegistry,
    subscriptions: SubscriptionTable,
    pending: PendingRequests,
}

impl BrokerState {
    /// `{name at addr}` if named, else the services it provides, else its address
    fn describe(&self, conn: ConnId) -> String {
        let Some(entry) = self.connections.get(&conn) else {
            return conn.to_string();
        };
        if let Some(name) = &entry.name {
            return format!("{{{} at {}}}", name, entry.addr);
        }
        let services: Vec<String> = self
            .registry
            .services_of(conn)
            .map(|s| s.to_string())
            .collect();
        if services.is_empty() {
            entry.addr.to_string()
        } else {
            services.join(", ")
        }
    }
}

/// File I/O gathered under the state lock, performed once it is released
#[derive(Debug, Default)]
struct Deferred {
    logs: Vec<(String, Bytes)>,
    outgoing: Vec<Bytes>,
}

#[derive(Debug)]
pub struct Broker {
    state: Mutex<BrokerState>,
    request_timeout: Duration,
    log_sink: Arc<dyn LogSink>,
    dumper: Option<Arc<PcapDumper>>,
    metrics: Arc<BrokerMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: &BrokerConfig, log_sink: Arc<dyn LogSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Mutex::new(BrokerState::default()),
            request_timeout: config.request_timeout,
            log_sink,
            dumper: None,
            metrics: Arc::new(BrokerMetrics::new()),
            shutdown_tx,
        }
    }

    pub fn with_dumper(mut self, dumper: Arc<PcapDumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&self, addr: SocketAddr, outbound: Outbound) -> ConnId {
        let id = ConnId::next();
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            state
                .connections
                .insert(id, ConnectionEntry::new(id, addr, outbound));
            self.notify(
                &state,
                events::NEW_CONNECTION,
                json!({ "Addr": addr.to_string() }),
                &mut deferred,
            );
        }
        self.metrics.connection_opened();
        info!("[Net] New connection: {}", addr);
        self.complete(deferred);
        id
    }

    /// Remove everything `conn` owns: its services, subscriptions and spy links.
    ///
    /// Calling it for an unknown or already removed connection does nothing.
    pub fn disconnect(&self, conn: ConnId) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            let description = state.describe(conn);
            let Some(entry) = state.connections.remove(&conn) else {
                return;
            };

            let services = state.registry.remove_all(conn);
            for service in services {
                info!("[Services] Remove {}", service);
                for spy in &service.spies {
                    if let Some(spy_entry) = state.connections.get_mut(spy) {
                        spy_entry.spying.retain(|k| *k != service.key);
                    }
                }
                self.notify(
                    &state,
                    events::LOST_SERVICE,
                    serde_json::to_value(service.info()).unwrap_or_default(),
                    &mut deferred,
                );
            }

            for key in &entry.spying {
                if let Some(service) = state.registry.get_mut(key) {
                    service.spies.retain(|c| *c != conn);
                }
            }

            let patterns = state.subscriptions.remove_conn(conn);
            for pattern in patterns {
                info!("[Subscribe] Remove {} from {}", description, pattern);
                self.notify(
                    &state,
                    events::LOST_SUBSCRIBER,
                    json!({ "Event": pattern, "Subscriber": description }),
                    &mut deferred,
                );
            }

            self.notify(
                &state,
                events::CLOSE_CONNECTION,
                json!({ "Addr": entry.addr.to_string() }),
                &mut deferred,
            );
            info!("[Net] Connection closed: {}", description);
        }
        self.metrics.connection_closed();
        self.complete(deferred);
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub fn register(&self, conn: ConnId, register: Register) {
        let key = ServiceKey::new(register.name, register.identification.unwrap_or_default());
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            let Some(addr) = state.connections.get(&conn).map(|e| e.addr) else {
                debug!("[Services] Ignoring registration of {} from closed connection", key);
                return;
            };

            info!("[Services] New {} at {}", key, addr);
            let replaced = state.registry.register(conn, addr, key.clone());
            match replaced {
                Some(old) => {
                    warn!("[Services] Replace {} by {} at {}", old, key, addr);
                    for spy in &old.spies {
                        if let Some(spy_entry) = state.connections.get_mut(spy) {
                            spy_entry.spying.retain(|k| *k != key);
                        }
                    }
                }
                None => {
                    let info = state.registry.get(&key).map(|s| s.info());
                    if let Some(info) = info {
                        self.notify(
                            &state,
                            events::NEW_SERVICE,
                            serde_json::to_value(info).unwrap_or_default(),
                            &mut deferred,
                        );
                    }
                }
            }
        }
        self.complete(deferred);
    }

    /// Forward a request to the service owning it, or answer it directly.
    pub fn route_request(self: &Arc<Self>, conn: ConnId, frame: &Frame, request: Request) {
        if request.service_name == ADMIN_SERVICE {
            admin::handle(self, conn, &request);
            return;
        }

        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            self.route_request_locked(&mut state, conn, frame, &request, &mut deferred);
        }
        self.complete(deferred);
    }

    fn route_request_locked(
        self: &Arc<Self>,
        state: &mut BrokerState,
        conn: ConnId,
        frame: &Frame,
        request: &Request,
        deferred: &mut Deferred,
    ) {
        let id = request.id;
        let target = match state
            .registry
            .lookup(&request.service_name, request.service_identification.as_deref())
        {
            Ok(service) => service.owner,
            Err(e) => {
                warn!(
                    "[Request] id:{} {}[{}].{}: {}",
                    id,
                    request.service_name,
                    request.service_identification.as_deref().unwrap_or(""),
                    request.method,
                    e
                );
                self.metrics.request_error();
                self.send_locked(state, conn, encode_error_reply(id, e.into()), deferred);
                return;
            }
        };

        debug!(
            "[Request] id:{} {}[{}].{} from {}",
            id,
            request.service_name,
            request.service_identification.as_deref().unwrap_or(""),
            request.method,
            state.describe(conn)
        );

        let seq = state.pending.next_seq();
        if let Some(previous) = state.pending.track(id, conn, seq) {
            warn!(
                "[Request] id:{} reused while in flight (previous origin {})",
                id, previous
            );
        }
        self.send_locked(state, target, frame.raw.clone(), deferred);
        self.metrics.request_routed();

        let broker = Arc::clone(self);
        let timeout = self.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            broker.expire_request(id, seq);
        });
        state.pending.arm(id, seq, timer.abort_handle());
    }

    pub fn route_reply(&self, conn: ConnId, frame: &Frame, reply: Reply) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            let Some(origin) = state.pending.resolve(reply.id) else {
                drop(state);
                warn!("[Reply] Unknown id:{} from {}", reply.id, conn);
                self.metrics.reply_dropped();
                return;
            };

            debug!("[Reply] id:{} to {}", reply.id, state.describe(origin));
            if self.send_locked(&state, origin, frame.raw.clone(), &mut deferred) {
                self.metrics.reply_forwarded();
            } else {
                debug!("[Reply] Could not deliver id:{}, dropping reply", reply.id);
                self.metrics.reply_dropped();
            }
        }
        self.complete(deferred);
    }

    /// Timer callback of a routed request. No-op if the request was answered.
    pub fn expire_request(&self, id: u64, seq: u64) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            let Some(origin) = state.pending.expire(id, seq) else {
                return;
            };
            warn!("[Request] id:{} timed out", id);
            self.metrics.request_timed_out();
            let frame = encode_error_reply(id, ErrorType::Timeout);
            self.send_locked(&state, origin, frame, &mut deferred);
        }
        self.complete(deferred);
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn subscribe(&self, conn: ConnId, pattern: &str) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            if !state.connections.contains_key(&conn) {
                return;
            }
            if !state.subscriptions.subscribe(pattern, conn) {
                debug!("[Subscribe] {} already subscribed to {}", conn, pattern);
                return;
            }
            let description = state.describe(conn);
            info!("[Subscribe] {} subscribes to {}", description, pattern);
            self.notify(
                &state,
                events::NEW_SUBSCRIBER,
                json!({ "Event": pattern, "Subscriber": description }),
                &mut deferred,
            );
        }
        self.complete(deferred);
    }

    /// Fan the publish frame out verbatim; `log.*` events are also logged.
    pub fn publish(&self, conn: ConnId, frame: &Frame, publish: Publish) {
        let mut deferred = Deferred::default();
        {
            let state = self.state.lock();
            debug!(
                "[Publish] {} from {}",
                publish.event,
                state.describe(conn)
            );
            self.fan_out(&state, &publish.event, &frame.raw, &mut deferred);
        }
        self.complete(deferred);

        if let Some(channel) = publish.event.strip_prefix(LOG_PREFIX) {
            match &publish.data {
                Some(data) => self.log_sink.log_event(channel, data),
                None => warn!("[Log] {} does not have data", publish.event),
            }
        }
    }

    // ------------------------------------------------------------------
    // Administrative queries
    // ------------------------------------------------------------------

    pub fn send_reply(&self, conn: ConnId, id: u64, data: Option<Bytes>) {
        self.send(conn, encode_reply(id, data));
    }

    pub fn send_error(&self, conn: ConnId, id: u64, kind: ErrorType) {
        self.send(conn, encode_error_reply(id, kind));
    }

    fn send(&self, conn: ConnId, frame: Bytes) {
        let mut deferred = Deferred::default();
        {
            let state = self.state.lock();
            self.send_locked(&state, conn, frame, &mut deferred);
        }
        self.complete(deferred);
    }

    pub fn describe(&self, conn: ConnId) -> String {
        self.state.lock().describe(conn)
    }

    pub fn set_display_name(&self, conn: ConnId, name: &str) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.connections.get_mut(&conn) else {
                return;
            };
            entry.name = Some(name.to_string());
            let addr = entry.addr;
            let description = state.describe(conn);
            debug!("[Cellaserv] Describe {} as {}", addr, name);
            self.notify(
                &state,
                events::CONNECTION_RENAME,
                serde_json::to_value(ConnectionInfo {
                    address: addr.to_string(),
                    name: description,
                })
                .unwrap_or_default(),
                &mut deferred,
            );
        }
        self.complete(deferred);
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let state = self.state.lock();
        let mut services: Vec<ServiceInfo> = state.registry.iter().map(|s| s.info()).collect();
        services.sort_by(|a, b| {
            (&a.name, &a.identification).cmp(&(&b.name, &b.identification))
        });
        services
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let state = self.state.lock();
        let mut ids: Vec<ConnId> = state.connections.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                state.connections.get(&id).map(|entry| ConnectionInfo {
                    address: entry.addr.to_string(),
                    name: state.describe(id),
                })
            })
            .collect()
    }

    /// Pattern to subscriber addresses
    pub fn list_events(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock();
        state
            .subscriptions
            .snapshot()
            .into_iter()
            .map(|(pattern, conns)| {
                let addrs = conns
                    .into_iter()
                    .filter_map(|c| state.connections.get(&c).map(|e| e.addr.to_string()))
                    .collect();
                (pattern, addrs)
            })
            .collect()
    }

    /// Record `conn` as a spy of the service instance `key`.
    pub fn spy(&self, conn: ConnId, key: &ServiceKey) -> Result<(), LookupError> {
        let mut state = self.state.lock();
        let service = state
            .registry
            .get_mut(key)
            .ok_or(LookupError::NoSuchService)?;
        if !service.spies.contains(&conn) {
            service.spies.push(conn);
        }
        if let Some(entry) = state.connections.get_mut(&conn) {
            if !entry.spying.contains(key) {
                entry.spying.push(key.clone());
            }
        }
        info!("[Cellaserv] {} spies on {}", state.describe(conn), key);
        Ok(())
    }

    pub fn get_logs(&self, pattern: &str) -> Result<Vec<u8>, LogSinkError> {
        self.log_sink.read_logs(pattern)
    }

    /// Start a new log session, named after the current time if `session` is `None`.
    pub fn rotate_logs(&self, session: Option<&str>) -> Result<String, LogSinkError> {
        let session = session.map(str::to_string).unwrap_or_else(session_name_now);
        self.log_sink.rotate(&session)?;

        let mut deferred = Deferred::default();
        {
            let state = self.state.lock();
            self.notify(&state, events::NEW_LOG_SESSION, json!(session), &mut deferred);
        }
        self.complete(deferred);
        Ok(session)
    }

    /// Ask the server to stop accepting connections and exit.
    pub fn shutdown(&self) {
        info!("[Cellaserv] Shutdown requested");
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    pub fn record_incoming(&self, peer: SocketAddr, frame: &Bytes) {
        if let Some(dumper) = &self.dumper {
            dumper.record_incoming(peer, frame);
        }
    }

    pub fn flush_dump(&self) {
        if let Some(dumper) = &self.dumper {
            dumper.flush();
        }
    }

    // ------------------------------------------------------------------
    // Internals, called with the state lock held
    // ------------------------------------------------------------------

    fn send_locked(
        &self,
        state: &BrokerState,
        conn: ConnId,
        frame: Bytes,
        deferred: &mut Deferred,
    ) -> bool {
        let Some(entry) = state.connections.get(&conn) else {
            debug!("[Net] Dropping frame for closed connection {}", conn);
            return false;
        };
        let captured = self.dumper.as_ref().map(|_| frame.clone());
        match entry.outbound.send(frame) {
            Ok(()) => {
                deferred.outgoing.extend(captured);
                true
            }
            Err(OutboundError::Full) => {
                warn!(
                    "[Net] {} is not reading, dropping frame",
                    state.describe(conn)
                );
                self.metrics.frame_dropped();
                false
            }
            Err(OutboundError::Closed) => {
                debug!("[Net] Writer of {} is gone", entry.addr);
                false
            }
        }
    }

    fn fan_out(
        &self,
        state: &BrokerState,
        event: &str,
        frame: &Bytes,
        deferred: &mut Deferred,
    ) -> usize {
        let delivered = state
            .subscriptions
            .recipients(event)
            .into_iter()
            .filter(|conn| self.send_locked(state, *conn, frame.clone(), deferred))
            .count();
        self.metrics.published(delivered);
        delivered
    }

    fn notify(
        &self,
        state: &BrokerState,
        event: &str,
        payload: serde_json::Value,
        deferred: &mut Deferred,
    ) {
        let data = Bytes::from(payload.to_string());
        let frame = encode_publish(event, Some(data.clone()));
        self.fan_out(state, event, &frame, deferred);
        deferred.logs.push((event.to_string(), data));
    }

    /// Sink writes and capture records, after the state lock is released.
    fn complete(&self, deferred: Deferred) {
        for (event, data) in deferred.logs {
            if let Some(channel) = event.strip_prefix(LOG_PREFIX) {
                self.log_sink.log_event(channel, &data);
            }
        }
        if let Some(dumper) = &self.dumper {
            for frame in &deferred.outgoing {
                dumper.record_outgoing(frame);
            }
        }
    }
}
