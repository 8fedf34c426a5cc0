use super::message::{ClientMessage, NO_MSG, ServerMessage};
use super::server::serve;
use crate::broker::{Broker, Message};
use crate::config::BrokerSettings;
use crate::utils::error::ProtocolError;

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

#[test]
fn test_parse_produce() {
    let msg = Message::request("orders", "{\"a\":\"b:c\"}", "corr", "reply.temp.1");
    let line = format!("PRODUCE:{}", msg.encode());
    assert_eq!(
        ClientMessage::parse(&line).unwrap(),
        ClientMessage::Produce(msg)
    );
}

#[test]
fn test_parse_consume_and_ack() {
    assert_eq!(
        ClientMessage::parse("CONSUME:orders").unwrap(),
        ClientMessage::Consume {
            topic: "orders".to_string()
        }
    );
    assert_eq!(
        ClientMessage::parse("ACK:m-1\r").unwrap(),
        ClientMessage::Ack {
            message_id: "m-1".to_string()
        }
    );
    assert!(!ClientMessage::parse("ACK:m-1").unwrap().expects_reply());
}

#[test]
fn test_parse_rejects_malformed_lines() {
    assert!(matches!(
        ClientMessage::parse("garbage"),
        Err(ProtocolError::MissingSeparator(_))
    ));
    assert!(matches!(
        ClientMessage::parse("PUBLISH:orders"),
        Err(ProtocolError::UnknownCommand(cmd)) if cmd == "PUBLISH"
    ));
    assert!(matches!(
        ClientMessage::parse("PRODUCE:only-an-id"),
        Err(ProtocolError::BadPayload { command: "PRODUCE", .. })
    ));
}

#[test]
fn test_encode_matches_parse() {
    let requests = [
        ClientMessage::Produce(Message::new("orders", "x")),
        ClientMessage::Consume {
            topic: "orders".to_string(),
        },
        ClientMessage::Ack {
            message_id: "m-1".to_string(),
        },
    ];
    for request in requests {
        assert_eq!(ClientMessage::parse(&request.encode()).unwrap(), request);
    }
}

#[test]
fn test_parse_consume_reply() {
    assert_eq!(ServerMessage::parse_consume(NO_MSG).unwrap(), None);
    let msg = Message::new("orders", "x");
    assert_eq!(
        ServerMessage::parse_consume(&ServerMessage::Message(msg.clone()).encode()).unwrap(),
        Some(msg)
    );
    assert!(ServerMessage::parse_consume("not a record").is_err());
}

struct TestServer {
    addr: std::net::SocketAddr,
    broker: Arc<Broker>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
    _dir: TempDir,
}

async fn start_test_server() -> TestServer {
    let dir = tempdir().unwrap();
    let settings = BrokerSettings {
        log_path: dir.path().join("broker.log").display().to_string(),
        poll_wait_ms: 20,
        ..BrokerSettings::default()
    };
    let broker = Arc::new(Broker::open(&settings).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let handle = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { serve(listener, broker, &settings, cancel).await })
    };
    TestServer {
        addr,
        broker,
        cancel,
        handle,
        _dir: dir,
    }
}

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, LinesCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new())
}

async fn round_trip(conn: &mut Framed<TcpStream, LinesCodec>, line: String) -> String {
    conn.send(line).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), conn.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_server_produce_consume_ack_over_tcp() {
    let server = start_test_server().await;
    let mut conn = connect(server.addr).await;

    let msg = Message::new("orders", "{\"qty\":1}");
    let reply = round_trip(&mut conn, format!("PRODUCE:{}", msg.encode())).await;
    assert_eq!(reply, msg.id);

    let reply = round_trip(&mut conn, "CONSUME:orders".to_string()).await;
    assert_eq!(Message::decode(&reply).unwrap(), msg);

    conn.send(format!("ACK:{}", msg.id)).await.unwrap();
    let reply = round_trip(&mut conn, "CONSUME:orders".to_string()).await;
    assert_eq!(reply, NO_MSG);
    assert_eq!(server.broker.stats().acknowledged, 1);

    server.cancel.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_ignores_malformed_lines_and_keeps_connection() {
    let server = start_test_server().await;
    let mut conn = connect(server.addr).await;

    conn.send("nonsense".to_string()).await.unwrap();
    conn.send("FLY:away".to_string()).await.unwrap();
    conn.send("PRODUCE:broken".to_string()).await.unwrap();

    let reply = round_trip(&mut conn, "CONSUME:".to_string()).await;
    assert_eq!(reply, NO_MSG);
    assert_eq!(server.broker.stats().produced, 0);

    server.cancel.cancel();
}

#[tokio::test]
async fn test_server_closes_connections_on_cancel() {
    let server = start_test_server().await;
    let mut conn = connect(server.addr).await;
    assert_eq!(round_trip(&mut conn, "CONSUME:idle".to_string()).await, NO_MSG);

    server.cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(2), conn.next())
        .await
        .unwrap();
    assert!(next.is_none() || matches!(next, Some(Err(_))));
}

#[tokio::test]
async fn test_server_connection_error_does_not_affect_others() {
    let server = start_test_server().await;
    let mut healthy = connect(server.addr).await;

    {
        let mut broken = connect(server.addr).await;
        broken.send("CONSUME:orders".to_string()).await.unwrap();
        // dropped mid-request
    }

    let msg = Message::new("orders", "still-works");
    let reply = round_trip(&mut healthy, format!("PRODUCE:{}", msg.encode())).await;
    assert_eq!(reply, msg.id);

    server.cancel.cancel();
}
