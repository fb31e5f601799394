use bytes::Bytes;
use cellaserv::broker::events;
use cellaserv::config::BrokerConfig;
use cellaserv::log_sink::{FileLogSink, LogSink};
use cellaserv::BrokerServer;
use cellaserv_client::{CellaservClient, CellaservClientError, ClientConfig, ErrorType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct TestBroker {
    address: String,
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
    let sink: Arc<dyn LogSink> = Arc::new(FileLogSink::with_session(dir.path(), "e2e"));
    let server = BrokerServer::bind_with_sink(config, sink).await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    let run = tokio::spawn(async move { server.run().await });

    TestBroker {
        address,
        run,
        _dir: dir,
    }
}

async fn client(broker: &TestBroker) -> CellaservClient {
    CellaservClient::connect_to(&broker.address).await.unwrap()
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    a: i64,
    b: i64,
}

#[tokio::test]
async fn test_service_answers_json_requests() {
    let broker = start_broker(Duration::from_secs(5)).await;

    let mut service = client(&broker).await;
    service.register("calc", Some("left")).unwrap();
    // Same connection: the registration is processed before this request
    within(service.admin().list_services()).await.unwrap();

    let server = tokio::spawn(async move {
        while let Some(request) = service.next_request().await {
            match request.method.as_str() {
                "add" => {
                    let args: Sum = serde_json::from_slice(&request.data.clone().unwrap()).unwrap();
                    service.reply_json(&request, &(args.a + args.b)).unwrap();
                }
                _ => service
                    .reply_error(&request, ErrorType::NoSuchMethod, None)
                    .unwrap(),
            }
        }
    });

    let caller = client(&broker).await;
    let total: i64 = within(caller.request_json("calc", Some("left"), "add", &Sum { a: 40, b: 2 }))
        .await
        .unwrap();
    assert_eq!(total, 42);

    let err = within(caller.request("calc", Some("left"), "divide", None))
        .await
        .unwrap_err();
    assert_eq!(err.reply_kind(), Some(ErrorType::NoSuchMethod));

    let err = within(caller.request("calc", Some("right"), "add", None))
        .await
        .unwrap_err();
    assert_eq!(err.reply_kind(), Some(ErrorType::InvalidIdentification));

    server.abort();
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_replies() {
    let broker = start_broker(Duration::from_secs(2)).await;

    let mut service = client(&broker).await;
    service.register("echo", None).unwrap();
    within(service.admin().list_services()).await.unwrap();

    // Answer only once both requests are in flight
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while held.len() < 2 {
            held.push(service.next_request().await.unwrap());
        }
        for request in &held {
            service.reply(request, request.data.clone()).unwrap();
        }
        service
    });

    let a = client(&broker).await;
    let b = client(&broker).await;
    let (from_a, from_b) = within(async {
        tokio::join!(
            a.request("echo", None, "say", Some(Bytes::from_static(b"from-a"))),
            b.request("echo", None, "say", Some(Bytes::from_static(b"from-b"))),
        )
    })
    .await;

    assert_eq!(from_a.unwrap(), Some(Bytes::from_static(b"from-a")));
    assert_eq!(from_b.unwrap(), Some(Bytes::from_static(b"from-b")));
    within(server).await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_is_reported() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let caller = client(&broker).await;

    let err = within(caller.request("nobody", None, "hello", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CellaservClientError::Reply {
            kind: ErrorType::NoSuchService,
            ..
        }
    ));
}

#[tokio::test]
async fn test_silent_service_times_out() {
    let broker = start_broker(Duration::from_millis(200)).await;

    let service = client(&broker).await;
    service.register("mute", None).unwrap();
    within(service.admin().list_services()).await.unwrap();

    let caller = client(&broker).await;
    let err = within(caller.request("mute", None, "speak", None))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.reply_kind(), Some(ErrorType::Timeout));
}

#[tokio::test]
async fn test_glob_subscription_receives_events() {
    let broker = start_broker(Duration::from_secs(5)).await;

    let mut subscriber = client(&broker).await;
    subscriber.subscribe("robot.*").unwrap();
    let patterns = within(subscriber.admin().list_events()).await.unwrap();
    assert!(patterns.contains_key("robot.*"));

    let publisher = client(&broker).await;
    publisher
        .publish_json("robot.moved", &serde_json::json!({"x": 1}))
        .unwrap();
    publisher.publish("other.moved", None).unwrap();
    publisher
        .publish("robot.stopped", Some(Bytes::from_static(b"{}")))
        .unwrap();

    let first = within(subscriber.next_event()).await.unwrap();
    assert_eq!(first.event, "robot.moved");
    let position: serde_json::Value = serde_json::from_slice(&first.data.unwrap()).unwrap();
    assert_eq!(position["x"], 1);

    let second = within(subscriber.next_event()).await.unwrap();
    assert_eq!(second.event, "robot.stopped");
}

#[tokio::test]
async fn test_lost_service_notification() {
    let broker = start_broker(Duration::from_secs(5)).await;

    let mut watcher = client(&broker).await;
    watcher.subscribe(events::LOST_SERVICE).unwrap();
    within(watcher.admin().list_events()).await.unwrap();

    let service = client(&broker).await;
    service.register("camera", Some("front")).unwrap();
    within(service.admin().list_services()).await.unwrap();
    drop(service);

    let lost = within(watcher.next_event()).await.unwrap();
    assert_eq!(lost.event, events::LOST_SERVICE);
    let info: serde_json::Value = serde_json::from_slice(&lost.data.unwrap()).unwrap();
    assert_eq!(info["Name"], "camera");
    assert_eq!(info["Identification"], "front");

    assert!(within(watcher.admin().list_services())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_admin_commands() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let client = client(&broker).await;
    let admin = client.admin();

    assert_eq!(within(admin.version()).await.unwrap(), cellaserv::VERSION);

    within(admin.describe_conn("dashboard")).await.unwrap();
    let connections = within(admin.list_connections()).await.unwrap();
    assert_eq!(connections.len(), 1);
    assert!(connections[0].name.contains("dashboard"));

    let err = within(admin.spy("ghost", None)).await.unwrap_err();
    assert_eq!(err.reply_kind(), Some(ErrorType::BadArguments));

    client.register("date", None).unwrap();
    within(admin.spy("date", None)).await.unwrap();

    client
        .log("match", &serde_json::json!({"score": 12}))
        .unwrap();
    let logs = within(admin.get_logs("match")).await.unwrap();
    let logs = String::from_utf8(logs.to_vec()).unwrap();
    assert!(logs.contains(r#"{"score":12}"#));

    within(admin.log_rotate(Some("second-half"))).await.unwrap();
    let err = within(admin.get_logs("match")).await.unwrap_err();
    assert_eq!(err.reply_kind(), Some(ErrorType::BadArguments));

    let err = within(client.request("cellaserv", None, "reboot", None))
        .await
        .unwrap_err();
    assert_eq!(err.reply_kind(), Some(ErrorType::NoSuchMethod));
}

#[tokio::test]
async fn test_shutdown_stops_the_broker() {
    let broker = start_broker(Duration::from_secs(5)).await;
    let client = client(&broker).await;

    within(client.admin().shutdown()).await.unwrap();
    within(broker.run).await.unwrap().unwrap();

    let config = ClientConfig::new(broker.address.clone())
        .with_connect_timeout(Duration::from_secs(1));
    assert!(CellaservClient::connect(config).await.is_err());
}
