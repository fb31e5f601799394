//! The `cellaserv` administrative service
//!
//! Requests addressed to the reserved service name are answered by the broker
//! itself. Payloads are JSON in both directions. Method names may be written
//! with dashes or underscores, and argument keys may be lower-case or
//! capitalised.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, warn};

use super::connection::ConnId;
use super::registry::ServiceKey;
use super::state::Broker;
use crate::protocol::{ErrorType, Request};
use crate::VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminCommand {
    DescribeConn,
    GetLogs,
    ListConnections,
    ListEvents,
    ListServices,
    LogRotate,
    Spy,
    Shutdown,
    Version,
}

impl AdminCommand {
    pub const ALL: [AdminCommand; 9] = [
        AdminCommand::DescribeConn,
        AdminCommand::GetLogs,
        AdminCommand::ListConnections,
        AdminCommand::ListEvents,
        AdminCommand::ListServices,
        AdminCommand::LogRotate,
        AdminCommand::Spy,
        AdminCommand::Shutdown,
        AdminCommand::Version,
    ];

    /// Canonical, dashed method name
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminCommand::DescribeConn => "describe-conn",
            AdminCommand::GetLogs => "get-logs",
            AdminCommand::ListConnections => "list-connections",
            AdminCommand::ListEvents => "list-events",
            AdminCommand::ListServices => "list-services",
            AdminCommand::LogRotate => "log-rotate",
            AdminCommand::Spy => "spy",
            AdminCommand::Shutdown => "shutdown",
            AdminCommand::Version => "version",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        let normalized = method.replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == normalized)
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeConnArgs {
    #[serde(alias = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpyArgs {
    #[serde(alias = "Service")]
    pub service: String,
    #[serde(default, alias = "Identification")]
    pub identification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRotateArgs {
    #[serde(rename = "where", alias = "Where")]
    pub session: String,
}

type AdminResult = Result<Option<Bytes>, ErrorType>;

/// Answer an administrative request on behalf of `conn`.
pub fn handle(broker: &Broker, conn: ConnId, request: &Request) {
    let Some(command) = AdminCommand::parse(&request.method) else {
        warn!("[Cellaserv] Unknown method: {}", request.method);
        broker.send_error(conn, request.id, ErrorType::NoSuchMethod);
        return;
    };
    debug!("[Cellaserv] {} from {}", command, conn);

    let data = request.data.as_ref();
    let result = match command {
        AdminCommand::DescribeConn => describe_conn(broker, conn, data),
        AdminCommand::GetLogs => get_logs(broker, data),
        AdminCommand::ListConnections => to_json(&broker.list_connections()),
        AdminCommand::ListEvents => to_json(&broker.list_events()),
        AdminCommand::ListServices => to_json(&broker.list_services()),
        AdminCommand::LogRotate => log_rotate(broker, data),
        AdminCommand::Spy => spy(broker, conn, data),
        AdminCommand::Shutdown => Ok(None),
        AdminCommand::Version => to_json(&VERSION),
    };

    match result {
        Ok(data) => broker.send_reply(conn, request.id, data),
        Err(kind) => broker.send_error(conn, request.id, kind),
    }

    if command == AdminCommand::Shutdown {
        broker.shutdown();
    }
}

fn parse_args<T: DeserializeOwned>(command: AdminCommand, data: Option<&Bytes>) -> Result<T, ErrorType> {
    let data = data.ok_or_else(|| {
        warn!("[Cellaserv] {} without arguments", command);
        ErrorType::BadArguments
    })?;
    serde_json::from_slice(data).map_err(|e| {
        warn!(
            "[Cellaserv] Could not unmarshal {}: {}, {}",
            command,
            String::from_utf8_lossy(data),
            e
        );
        ErrorType::BadArguments
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> AdminResult {
    match serde_json::to_vec(value) {
        Ok(json) => Ok(Some(Bytes::from(json))),
        Err(e) => {
            error!("[Cellaserv] Could not marshal reply: {}", e);
            Err(ErrorType::BadArguments)
        }
    }
}

fn describe_conn(broker: &Broker, conn: ConnId, data: Option<&Bytes>) -> AdminResult {
    let args: DescribeConnArgs = parse_args(AdminCommand::DescribeConn, data)?;
    broker.set_display_name(conn, &args.name);
    Ok(None)
}

fn get_logs(broker: &Broker, data: Option<&Bytes>) -> AdminResult {
    let Some(data) = data else {
        warn!("[Cellaserv] Log request does not specify event");
        return Err(ErrorType::BadArguments);
    };
    let pattern = std::str::from_utf8(data).map_err(|_| ErrorType::BadArguments)?;

    match broker.get_logs(pattern) {
        Ok(content) => Ok(Some(Bytes::from(content))),
        Err(e) => {
            warn!("[Cellaserv] {}", e);
            Err(ErrorType::BadArguments)
        }
    }
}

fn log_rotate(broker: &Broker, data: Option<&Bytes>) -> AdminResult {
    let session = match data {
        Some(data) if !data.is_empty() => {
            let args: LogRotateArgs = parse_args(AdminCommand::LogRotate, Some(data))?;
            Some(args.session)
        }
        _ => None,
    };

    match broker.rotate_logs(session.as_deref()) {
        Ok(_) => Ok(None),
        Err(e) => {
            warn!("[Cellaserv] Could not rotate logs: {}", e);
            Err(ErrorType::BadArguments)
        }
    }
}

fn spy(broker: &Broker, conn: ConnId, data: Option<&Bytes>) -> AdminResult {
    let args: SpyArgs = parse_args(AdminCommand::Spy, data)?;
    let key = ServiceKey::new(args.service, args.identification);
    broker.spy(conn, &key).map_err(|e| {
        warn!("[Cellaserv] Cannot spy on {}: {}", key, e);
        ErrorType::BadArguments
    })?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::Outbound;
    use crate::config::BrokerConfig;
    use crate::log_sink::FileLogSink;
    use crate::protocol::{Message, MessageType, Register, Reply};
    use prost::Message as _;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;

    fn setup(dir: &tempfile::TempDir) -> (Arc<Broker>, ConnId, Receiver<Bytes>) {
        let sink = Arc::new(FileLogSink::with_session(dir.path(), "start"));
        let broker = Arc::new(Broker::new(&BrokerConfig::default(), sink));
        let (outbound, rx) = Outbound::channel();
        let conn = broker.connect(SocketAddr::from(([127, 0, 0, 1], 2000)), outbound);
        (broker, conn, rx)
    }

    fn call(broker: &Broker, conn: ConnId, method: &str, data: Option<&[u8]>) {
        let request = Request {
            service_name: "cellaserv".to_string(),
            service_identification: None,
            method: method.to_string(),
            data: data.map(Bytes::copy_from_slice),
            id: 99,
        };
        handle(broker, conn, &request);
    }

    fn answer(rx: &mut Receiver<Bytes>) -> Result<Option<Bytes>, ErrorType> {
        let message = Message::decode(rx.try_recv().unwrap()).unwrap();
        assert_eq!(message.r#type, MessageType::Reply as i32);
        let reply = Reply::decode(message.content).unwrap();
        assert_eq!(reply.id, 99);
        match reply.error {
            Some(error) => Err(ErrorType::try_from(error.r#type).unwrap()),
            None => Ok(reply.data),
        }
    }

    #[test]
    fn test_command_spellings() {
        assert_eq!(
            AdminCommand::parse("list-services"),
            Some(AdminCommand::ListServices)
        );
        assert_eq!(
            AdminCommand::parse("list_services"),
            Some(AdminCommand::ListServices)
        );
        assert_eq!(
            AdminCommand::parse("describe_conn"),
            Some(AdminCommand::DescribeConn)
        );
        assert_eq!(AdminCommand::parse("reboot"), None);
        for command in AdminCommand::ALL {
            assert_eq!(AdminCommand::parse(command.as_str()), Some(command));
        }
    }

    #[test]
    fn test_argument_keys_accept_both_cases() {
        let lower: DescribeConnArgs = serde_json::from_str(r#"{"name":"pal"}"#).unwrap();
        let upper: DescribeConnArgs = serde_json::from_str(r#"{"Name":"pal"}"#).unwrap();
        assert_eq!(lower, upper);

        let spy: SpyArgs = serde_json::from_str(r#"{"Service":"date"}"#).unwrap();
        assert_eq!(spy.service, "date");
        assert_eq!(spy.identification, "");

        let rotate: LogRotateArgs = serde_json::from_str(r#"{"Where":"match-1"}"#).unwrap();
        assert_eq!(rotate.session, "match-1");
    }

    #[test]
    fn test_version_is_json_string() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);
        call(&broker, conn, "version", None);

        let data = answer(&mut rx).unwrap().unwrap();
        let version: String = serde_json::from_slice(&data).unwrap();
        assert_eq!(version, VERSION);
    }

    #[test]
    fn test_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);
        call(&broker, conn, "reboot", None);
        assert_eq!(answer(&mut rx), Err(ErrorType::NoSuchMethod));
    }

    #[test]
    fn test_describe_conn() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);

        call(&broker, conn, "describe-conn", Some(b"not json"));
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));
        call(&broker, conn, "describe-conn", None);
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));

        call(&broker, conn, "describe_conn", Some(br#"{"name":"monitor"}"#));
        assert_eq!(answer(&mut rx), Ok(None));
        assert_eq!(broker.describe(conn), "{monitor at 127.0.0.1:2000}");
    }

    #[test]
    fn test_list_services_json() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);

        call(&broker, conn, "list-services", None);
        assert_eq!(answer(&mut rx).unwrap().unwrap(), Bytes::from_static(b"[]"));

        broker.register(
            conn,
            Register {
                name: "robot".to_string(),
                identification: Some("pal".to_string()),
            },
        );
        call(&broker, conn, "list-services", None);
        let data = answer(&mut rx).unwrap().unwrap();
        let services: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(
            services,
            serde_json::json!([{
                "Addr": "127.0.0.1:2000",
                "Name": "robot",
                "Identification": "pal"
            }])
        );
    }

    #[test]
    fn test_list_connections_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);
        broker.subscribe(conn, "foo.*");

        call(&broker, conn, "list-connections", None);
        let data = answer(&mut rx).unwrap().unwrap();
        let conns: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(
            conns,
            serde_json::json!([{ "Addr": "127.0.0.1:2000", "Name": "127.0.0.1:2000" }])
        );

        call(&broker, conn, "list-events", None);
        let data = answer(&mut rx).unwrap().unwrap();
        let events: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(events, serde_json::json!({ "foo.*": ["127.0.0.1:2000"] }));
    }

    #[test]
    fn test_spy_unknown_service_is_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);

        call(&broker, conn, "spy", Some(br#"{"service":"date"}"#));
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));

        broker.register(
            conn,
            Register {
                name: "date".to_string(),
                identification: None,
            },
        );
        call(&broker, conn, "spy", Some(br#"{"service":"date","identification":""}"#));
        assert_eq!(answer(&mut rx), Ok(None));
    }

    #[test]
    fn test_get_logs_and_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);

        call(&broker, conn, "get-logs", None);
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));

        // The connection itself was logged when it was accepted
        call(&broker, conn, "get-logs", Some(b"cellaserv.*"));
        let content = answer(&mut rx).unwrap().unwrap();
        assert!(String::from_utf8_lossy(&content).contains("127.0.0.1:2000"));

        call(&broker, conn, "get-logs", Some(b"../start/cellaserv.new-connection"));
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));

        call(&broker, conn, "log-rotate", Some(br#"{"Where":"second"}"#));
        assert_eq!(answer(&mut rx), Ok(None));
        assert!(dir.path().join("second").is_dir());
        assert!(dir
            .path()
            .join("second")
            .join("cellaserv.new-log-session.log")
            .exists());

        call(&broker, conn, "get-logs", Some(b"cellaserv.new-connection"));
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));

        call(&broker, conn, "log-rotate", Some(b"{"));
        assert_eq!(answer(&mut rx), Err(ErrorType::BadArguments));
    }

    #[test]
    fn test_shutdown_replies_then_signals() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, conn, mut rx) = setup(&dir);
        let mut signal = broker.shutdown_signal();

        call(&broker, conn, "shutdown", None);
        assert_eq!(answer(&mut rx), Ok(None));
        assert!(signal.try_recv().is_ok());
    }
}
