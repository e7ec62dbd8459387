use std::time::Duration;

use ozone_core::PeerDescriptor;
use ozone_transport::{Acceptor, Connector};
use ozone_transport_websocket::{
    WebSocketConnector, WebSocketConnectorConfig, WebSocketListener, WebSocketListenerConfig,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connector_and_listener_exchange_text() {
    let mut listener = WebSocketListener::bind(WebSocketListenerConfig::new("127.0.0.1:0"))
        .await
        .expect("bind");
    let addr = listener.local_addr();
    let connector = WebSocketConnector::default();

    let link = connector
        .connect(&PeerDescriptor::new("svc", addr.to_string()))
        .await
        .expect("connect");
    assert_eq!(link.peer(), "svc");

    let accepted = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("accept in time")
        .expect("accepted link");

    let (core_tx, mut core_rx) = link.into_parts();
    let (svc_tx, mut svc_rx) = accepted.into_parts();

    core_tx.send("hello".to_string()).expect("core send");
    let got = tokio::time::timeout(WAIT, svc_rx.recv()).await.expect("recv in time");
    assert_eq!(got.as_deref(), Some("hello"));

    svc_tx.send("world".to_string()).expect("svc send");
    let got = tokio::time::timeout(WAIT, core_rx.recv()).await.expect("recv in time");
    assert_eq!(got.as_deref(), Some("world"));

    let metrics = connector.metrics_snapshot();
    assert_eq!(metrics.connect_attempts, 1);
    assert_eq!(metrics.connect_failures, 0);
    assert_eq!(listener.metrics_snapshot().handshakes_accepted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_to_closed_port_is_connection_loss() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let addr = probe.local_addr().expect("probe addr");
    drop(probe);

    let connector = WebSocketConnector::new(WebSocketConnectorConfig {
        connect_timeout: Duration::from_secs(2),
        ..WebSocketConnectorConfig::default()
    });
    let err = connector
        .connect(&PeerDescriptor::new("gone", addr.to_string()))
        .await
        .expect_err("nothing listens there");

    assert!(err.is_connection_loss());
    assert_eq!(connector.metrics_snapshot().connect_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_dialer_link_closes_the_service_side() {
    let mut listener = WebSocketListener::bind(WebSocketListenerConfig::new("127.0.0.1:0"))
        .await
        .expect("bind");
    let addr = listener.local_addr();

    let link = WebSocketConnector::default()
        .connect(&PeerDescriptor::new("svc", addr.to_string()))
        .await
        .expect("connect");
    let accepted = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("accept in time")
        .expect("accepted link");
    let (svc_tx, mut svc_rx) = accepted.into_parts();

    drop(link);

    let end = tokio::time::timeout(WAIT, svc_rx.recv()).await.expect("closed in time");
    assert!(end.is_none());
    assert!(!svc_tx.is_open());
}
