//! Transport behaviour over real TCP sockets.

use std::time::Duration;

use flex_daq::instrument::{CommandSet, InstrumentClient, Kh7008};
use flex_daq::sim::{self, SimulatedAmplifier, SimulatedCryostat};
use flex_daq::transport::{no_params, TransportClient};
use flex_daq::FlexError;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_round_trip_against_simulator() {
    let (addr, server) = sim::spawn_server("127.0.0.1:0", SimulatedAmplifier::new())
        .await
        .unwrap();
    let transport = TransportClient::connect(&format!("tcp://{addr}"), TIMEOUT)
        .await
        .unwrap();

    let client = InstrumentClient::new(&transport, Kh7008::NAME);
    client.ack().await.unwrap();
    assert!(client.missing_commands::<Kh7008>().await.unwrap().is_empty());

    let amplifier = Kh7008::new(&transport);
    let channel = amplifier.channel(4).await.unwrap();
    assert_eq!(channel.channel, 4);
    assert_eq!(channel.gain, 1);

    transport.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_remote_error_passes_through() {
    let (addr, server) = sim::spawn_server("127.0.0.1:0", SimulatedCryostat::new())
        .await
        .unwrap();
    let transport = TransportClient::connect(&addr.to_string(), TIMEOUT).await.unwrap();

    match transport.call("Set Warp Drive", json!({"Factor": 9})).await {
        Err(FlexError::Remote { message }) => assert!(message.contains("Set Warp Drive")),
        other => panic!("expected Remote, got {other:?}"),
    }

    // The connection stays usable after a remote error.
    let reply = transport.call("Get Temperature", no_params()).await.unwrap();
    assert_eq!(reply["Temperature (K)"], json!(300.0));
    server.abort();
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let transport = TransportClient::connect(&addr.to_string(), Duration::from_millis(200))
        .await
        .unwrap();
    let err = transport.call("getState", no_params()).await.unwrap_err();
    assert!(matches!(err, FlexError::Timeout { .. }));
    assert!(err.is_retryable());
    peer.abort();
}

#[tokio::test]
async fn test_garbage_reply_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(_request)) = lines.next_line().await {
            write.write_all(b"this is not json\n").await.unwrap();
        }
    });

    let transport = TransportClient::connect(&addr.to_string(), TIMEOUT).await.unwrap();
    let err = transport.call("getState", no_params()).await.unwrap_err();
    assert!(matches!(err, FlexError::Protocol(_)));
    peer.abort();
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (addr, server) = sim::spawn_server("127.0.0.1:0", SimulatedAmplifier::new())
        .await
        .unwrap();
    let transport = TransportClient::connect(&addr.to_string(), TIMEOUT).await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert!(transport.is_closed().await);
    assert!(matches!(
        transport.call("ACK", no_params()).await,
        Err(FlexError::Connection(_))
    ));
    server.abort();
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = TransportClient::connect(&format!("tcp://{addr}"), TIMEOUT).await;
    assert!(matches!(result, Err(FlexError::Connection(_))));
}

#[tokio::test]
async fn test_unsupported_scheme_is_connection_error() {
    let result = TransportClient::connect("zmq://localhost:29160", TIMEOUT).await;
    assert!(matches!(result, Err(FlexError::Connection(_))));
}
