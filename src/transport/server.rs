//! TCP transport
//!
//! Accepts connections and runs one command loop per connection, turning
//! protocol lines into broker operations. Responsibilities:
//! - Frame the byte stream into lines (bounded by `max_line_length`)
//! - Parse each line and call the `Broker`
//! - Write the reply, if the command has one
//!
//! A malformed line is logged and skipped; the connection stays open. A
//! framing or socket error ends that connection only. Every exit path drops
//! the socket so the peer observes EOF.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::Broker;
use crate::config::{BrokerSettings, ServerSettings};
use crate::transport::message::{ClientMessage, ServerMessage};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub async fn bind(settings: &ServerSettings) -> io::Result<TcpListener> {
    TcpListener::bind(settings.bind_addr()).await
}

/// Accept connections on `listener` until `cancel` fires.
///
/// Cancelling also closes every connection accepted so far.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: &BrokerSettings,
    cancel: CancellationToken,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    let max_line_length = settings.max_line_length;
    info!("MiniMQ broker listening on tcp://{addr}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopped accepting connections on {addr}");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let broker = Arc::clone(&broker);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, broker, max_line_length, cancel).await;
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    max_line_length: usize,
    cancel: CancellationToken,
) {
    info!("Client connected: {peer}");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {peer}: {e}");
    }
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(max_line_length));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!("Dropping connection {peer}: {e}");
                    break;
                }
                None => break,
            },
        };
        trace!("{peer} -> {line}");

        let request = match ClientMessage::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring line from {peer}: {e}");
                continue;
            }
        };

        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = dispatch(&broker, request) => reply,
        };

        if let Some(reply) = reply {
            trace!("{peer} <- {reply}");
            if let Err(e) = framed.send(reply.encode()).await {
                warn!("Failed to reply to {peer}: {e}");
                break;
            }
        }
    }

    info!("Client disconnected: {peer}");
}

async fn dispatch(broker: &Broker, request: ClientMessage) -> Option<ServerMessage> {
    match request {
        ClientMessage::Produce(message) => Some(ServerMessage::MessageId(broker.produce(message))),
        ClientMessage::Consume { topic } => Some(match broker.consume(&topic).await {
            Some(message) => ServerMessage::Message(message),
            None => ServerMessage::NoMessage,
        }),
        ClientMessage::Ack { message_id } => {
            broker.acknowledge(&message_id);
            None
        }
    }
}
