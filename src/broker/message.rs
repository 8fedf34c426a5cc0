//! Message definitions for the broker
//!
//! `Message` is the unit of transport shared by the broker, the persistence
//! log and the client runtime. On the wire and on disk a message is a single
//! line: its fields joined by [`FIELD_DELIMITER`] in the order
//! `id, topic, content, correlation_id, reply_to`.
//!
//! Notes on fields:
//! - `id`: assigned by the producer when the message is created, never by
//!   the broker
//! - `topic`: destination queue name
//! - `content`: the already-serialized payload, opaque to the broker
//! - `correlation_id` / `reply_to`: set only on request-reply requests; an
//!   absent value is written as an empty segment, never as the text "null"
//!
//! Decoding also accepts the legacy 3-field record (`id, topic, content`).
//! The leading two fields and trailing two fields are split off from their
//! respective ends, so `content` may itself contain the delimiter as long as
//! the record carries all five fields. For the same reason a colon may not
//! sit next to a delimiter inside the split-off fields; see
//! [`Message::check_wire_safe`].

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::utils::error::CodecError;

pub const FIELD_DELIMITER: &str = ":::";

const MIN_FIELDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub content: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Message {
    /// Create a fire-and-forget message with a fresh random id.
    pub fn new(topic: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            content: content.into(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Create a request message that expects a reply on `reply_to`.
    pub fn request(
        topic: impl Into<String>,
        content: impl Into<String>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            ..Self::new(topic, content)
        }
    }

    /// Encode into the single-line record format.
    pub fn encode(&self) -> String {
        [
            self.id.as_str(),
            self.topic.as_str(),
            self.content.as_str(),
            self.correlation_id.as_deref().unwrap_or_default(),
            self.reply_to.as_deref().unwrap_or_default(),
        ]
        .join(FIELD_DELIMITER)
    }

    /// Decode a record produced by [`Message::encode`] or a legacy 3-field
    /// record. Never returns a partially populated message.
    pub fn decode(record: &str) -> Result<Self, CodecError> {
        let mut head = record.splitn(MIN_FIELDS, FIELD_DELIMITER);
        let (Some(id), Some(topic), Some(rest)) = (head.next(), head.next(), head.next()) else {
            return Err(CodecError::Malformed {
                fields: record.split(FIELD_DELIMITER).count(),
            });
        };
        if id.is_empty() {
            return Err(CodecError::EmptyField("id"));
        }
        if topic.is_empty() {
            return Err(CodecError::EmptyField("topic"));
        }

        // rsplitn yields the trailing fields first: reply_to, correlation_id, content
        let mut tail: Vec<&str> = rest.rsplitn(3, FIELD_DELIMITER).collect();
        tail.reverse();
        let (content, correlation_id, reply_to) = match tail.as_slice() {
            [content, correlation_id, reply_to] => {
                (*content, non_empty(correlation_id), non_empty(reply_to))
            }
            [content, correlation_id] => (*content, non_empty(correlation_id), None),
            _ => (rest, None, None),
        };

        Ok(Self {
            id: id.to_string(),
            topic: topic.to_string(),
            content: content.to_string(),
            correlation_id,
            reply_to,
        })
    }

    /// Reject values that would not survive the line protocol.
    ///
    /// Besides newlines anywhere and the field delimiter outside of
    /// `content`, a colon must not touch the delimiter from the side the
    /// decoder splits on: `id` and `topic` may not end with `:`, and
    /// `correlation_id` and `reply_to` may not start with one. Present but
    /// empty optional fields are rejected too, since they decode as absent.
    pub fn check_wire_safe(&self) -> Result<(), CodecError> {
        for (field, value) in [("id", &self.id), ("topic", &self.topic)] {
            if value.is_empty() {
                return Err(CodecError::EmptyField(field));
            }
            check_field(field, value)?;
            if value.ends_with(':') {
                return Err(CodecError::ReservedSequence {
                    field,
                    reserved: "trailing ':'",
                });
            }
        }
        if self.content.contains(['\n', '\r']) {
            return Err(CodecError::ReservedSequence {
                field: "content",
                reserved: "newline",
            });
        }
        let optional = [
            ("correlation_id", self.correlation_id.as_deref()),
            ("reply_to", self.reply_to.as_deref()),
        ];
        for (field, value) in optional {
            let Some(value) = value else { continue };
            if value.is_empty() {
                return Err(CodecError::EmptyField(field));
            }
            check_field(field, value)?;
            if value.starts_with(':') {
                return Err(CodecError::ReservedSequence {
                    field,
                    reserved: "leading ':'",
                });
            }
        }
        Ok(())
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.contains(FIELD_DELIMITER) {
        return Err(CodecError::ReservedSequence {
            field,
            reserved: FIELD_DELIMITER,
        });
    }
    if value.contains(['\n', '\r']) {
        return Err(CodecError::ReservedSequence {
            field,
            reserved: "newline",
        });
    }
    Ok(())
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Message {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Extract the id of an encoded record without decoding the rest of it.
pub(crate) fn record_id(record: &str) -> Option<&str> {
    record
        .split_once(FIELD_DELIMITER)
        .map(|(id, _)| id)
        .filter(|id| !id.is_empty())
}
