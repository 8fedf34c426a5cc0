//! Line protocol messages
//!
//! Every request is one UTF-8 line of the form `COMMAND:payload`:
//!
//! ```text
//! PRODUCE:<encoded message>   -> "<id>"
//! CONSUME:<topic>             -> "<encoded message>" | "NO_MSG"
//! ACK:<message id>            -> (no reply)
//! ```
//!
//! The command is everything before the first `:`, so payloads are free to
//! contain colons.

use std::fmt;

use crate::broker::message::Message;
use crate::utils::error::{CodecError, ProtocolError};

pub const PRODUCE: &str = "PRODUCE";
pub const CONSUME: &str = "CONSUME";
pub const ACK: &str = "ACK";
pub const NO_MSG: &str = "NO_MSG";

/// Longest line either side accepts before treating the peer as broken.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A request sent by a producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Produce(Message),
    Consume { topic: String },
    Ack { message_id: String },
}

impl ClientMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches('\r');
        let Some((command, payload)) = line.split_once(':') else {
            return Err(ProtocolError::MissingSeparator(truncate(line)));
        };

        match command {
            PRODUCE => Message::decode(payload)
                .map(ClientMessage::Produce)
                .map_err(|source| ProtocolError::BadPayload {
                    command: PRODUCE,
                    source,
                }),
            CONSUME => Ok(ClientMessage::Consume {
                topic: payload.to_string(),
            }),
            ACK => Ok(ClientMessage::Ack {
                message_id: payload.to_string(),
            }),
            other => Err(ProtocolError::UnknownCommand(truncate(other))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Produce(message) => format!("{PRODUCE}:{}", message.encode()),
            ClientMessage::Consume { topic } => format!("{CONSUME}:{topic}"),
            ClientMessage::Ack { message_id } => format!("{ACK}:{message_id}"),
        }
    }

    /// Whether the broker answers this request.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, ClientMessage::Ack { .. })
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A reply written by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    MessageId(String),
    Message(Message),
    NoMessage,
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        match self {
            ServerMessage::MessageId(id) => id.clone(),
            ServerMessage::Message(message) => message.encode(),
            ServerMessage::NoMessage => NO_MSG.to_string(),
        }
    }

    /// Interpret the reply to a CONSUME request.
    pub fn parse_consume(line: &str) -> Result<Option<Message>, CodecError> {
        match line.trim_end_matches('\r') {
            NO_MSG => Ok(None),
            record => Message::decode(record).map(Some),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(100).collect()
}
