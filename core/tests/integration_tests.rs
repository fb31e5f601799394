use bytes::Bytes;
use cellaserv::{
    broker::{events, BrokerServer},
    config::BrokerConfig,
    log_sink::{FileLogSink, LogSink},
    protocol::{
        encode_body, CellaservFrameCodec, ErrorType, Message, MessageType, Publish, Register,
        Reply, Request, Subscribe,
    },
};
use futures::SinkExt;
use prost::Message as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, CellaservFrameCodec>;

struct TestBroker {
    server: Arc<BrokerServer>,
    addr: SocketAddr,
    run: JoinHandle<cellaserv::Result<()>>,
    _dir: tempfile::TempDir,
}

async fn start_broker(request_timeout: Duration) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout,
        ..Default::default()
    };
    let sink: Arc<dyn LogSink> = Arc::new(FileLogSink::with_session(dir.path(), "it"));
    let server = Arc::new(BrokerServer::bind_with_sink(config, sink).await.unwrap());
    let addr = server.local_addr().unwrap();

    let running = Arc::clone(&server);
    let run = tokio::spawn(async move { running.run().await });

    TestBroker {
        server,
        addr,
        run,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    Framed::new(
        TcpStream::connect(addr).await.unwrap(),
        CellaservFrameCodec::new(),
    )
}

async fn recv(client: &mut Client) -> Message {
    let raw = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .unwrap();
    Message::decode(raw).unwrap()
}

async fn register(client: &mut Client, name: &str, ident: Option<&str>) {
    let body = Register {
        name: name.to_string(),
        identification: ident.map(str::to_string),
    };
    client
        .send(encode_body(MessageType::Register, &body))
        .await
        .unwrap();
}

fn request(service: &str, method: &str, id: u64, data: Option<&[u8]>) -> Bytes {
    encode_body(
        MessageType::Request,
        &Request {
            service_name: service.to_string(),
            service_identification: None,
            method: method.to_string(),
            data: data.map(Bytes::copy_from_slice),
            id,
        },
    )
}

/// Poll until the broker state satisfies `check`
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_request_reply_over_tcp() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let mut service = connect(broker.addr).await;
    let mut caller = connect(broker.addr).await;

    register(&mut service, "date", None).await;
    let b = broker.server.broker();
    eventually(|| b.list_services().len() == 1).await;

    let sent = request("date", "time", 17, Some(b"{}"));
    caller.send(sent.clone()).await.unwrap();

    // The service receives the request bytes unchanged
    let forwarded = recv(&mut service).await;
    assert_eq!(Bytes::from(forwarded.encode_to_vec()), sent);
    let req = Request::decode(forwarded.content).unwrap();
    assert_eq!(req.method, "time");

    let reply = encode_body(
        MessageType::Reply,
        &Reply {
            error: None,
            id: req.id,
            data: Some(Bytes::from_static(b"\"noon\"")),
        },
    );
    service.send(reply.clone()).await.unwrap();

    let answered = recv(&mut caller).await;
    assert_eq!(Bytes::from(answered.encode_to_vec()), reply);
}

#[tokio::test]
async fn test_unknown_service_over_tcp() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let mut caller = connect(broker.addr).await;

    caller
        .send(request("nothing", "m", 3, None))
        .await
        .unwrap();
    let message = recv(&mut caller).await;
    let reply = Reply::decode(message.content).unwrap();
    assert_eq!(reply.id, 3);
    assert_eq!(
        ErrorType::try_from(reply.error.unwrap().r#type).unwrap(),
        ErrorType::NoSuchService
    );
}

#[tokio::test]
async fn test_timeout_over_tcp() {
    let broker = start_broker(Duration::from_millis(200)).await;
    let mut service = connect(broker.addr).await;
    let mut caller = connect(broker.addr).await;

    register(&mut service, "slow", None).await;
    let b = broker.server.broker();
    eventually(|| b.list_services().len() == 1).await;

    caller.send(request("slow", "m", 9, None)).await.unwrap();
    recv(&mut service).await;

    let message = recv(&mut caller).await;
    let reply = Reply::decode(message.content).unwrap();
    assert_eq!(reply.id, 9);
    assert_eq!(
        ErrorType::try_from(reply.error.unwrap().r#type).unwrap(),
        ErrorType::Timeout
    );
    assert_eq!(b.pending_requests(), 0);
}

#[tokio::test]
async fn test_publish_glob_over_tcp() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let mut subscriber = connect(broker.addr).await;
    let mut publisher = connect(broker.addr).await;

    for event in ["foo.bar", "foo.*"] {
        subscriber
            .send(encode_body(
                MessageType::Subscribe,
                &Subscribe {
                    event: event.to_string(),
                },
            ))
            .await
            .unwrap();
    }
    let b = broker.server.broker();
    eventually(|| b.list_events().len() == 2).await;

    let publish = encode_body(
        MessageType::Publish,
        &Publish {
            event: "foo.bar".to_string(),
            data: Some(Bytes::from_static(b"1")),
        },
    );
    publisher.send(publish.clone()).await.unwrap();
    let marker = encode_body(
        MessageType::Publish,
        &Publish {
            event: "foo.end".to_string(),
            data: None,
        },
    );
    publisher.send(marker).await.unwrap();

    // One copy of foo.bar, then the marker: no duplicate in between
    let first = recv(&mut subscriber).await;
    assert_eq!(Bytes::from(first.encode_to_vec()), publish);
    let second = Publish::decode(recv(&mut subscriber).await.content).unwrap();
    assert_eq!(second.event, "foo.end");
}

#[tokio::test]
async fn test_disconnect_removes_services_and_notifies() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let mut watcher = connect(broker.addr).await;
    watcher
        .send(encode_body(
            MessageType::Subscribe,
            &Subscribe {
                event: events::LOST_SERVICE.to_string(),
            },
        ))
        .await
        .unwrap();

    let mut service = connect(broker.addr).await;
    register(&mut service, "robot", Some("pal")).await;
    let b = broker.server.broker();
    eventually(|| b.list_services().len() == 1 && !b.list_events().is_empty()).await;

    drop(service);

    let lost = Publish::decode(recv(&mut watcher).await.content).unwrap();
    assert_eq!(lost.event, events::LOST_SERVICE);
    let info: serde_json::Value = serde_json::from_slice(&lost.data.unwrap()).unwrap();
    assert_eq!(info["Name"], "robot");
    assert_eq!(info["Identification"], "pal");
    assert!(b.list_services().is_empty());
}

#[tokio::test]
async fn test_admin_over_tcp_and_shutdown() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let mut admin = connect(broker.addr).await;
    register(&mut admin, "date", None).await;

    admin
        .send(request("cellaserv", "list_services", 1, None))
        .await
        .unwrap();
    let reply = Reply::decode(recv(&mut admin).await.content).unwrap();
    let services: serde_json::Value = serde_json::from_slice(&reply.data.unwrap()).unwrap();
    assert_eq!(services[0]["Name"], "date");

    admin
        .send(request("cellaserv", "version", 2, None))
        .await
        .unwrap();
    let reply = Reply::decode(recv(&mut admin).await.content).unwrap();
    let version: String = serde_json::from_slice(&reply.data.unwrap()).unwrap();
    assert_eq!(version, cellaserv::VERSION);

    admin
        .send(request("cellaserv", "shutdown", 3, None))
        .await
        .unwrap();
    let reply = Reply::decode(recv(&mut admin).await.content).unwrap();
    assert_eq!(reply.id, 3);
    assert!(reply.error.is_none());

    // The accept loop stops
    tokio::time::timeout(Duration::from_secs(5), broker.run)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
