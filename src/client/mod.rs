//! The `client` module is the application side of MiniMQ.
//!
//! `Producer` sends messages and performs request-reply, `Consumer` runs
//! registered listeners, and both borrow broker connections from a
//! `ConnectionPool`.

pub mod connection;
pub mod consumer;
pub mod producer;

pub use connection::{ConnectionPool, LineConnection, TcpConnection, TcpConnectionPool};
pub use consumer::{Consumer, DeliveryContext};
pub use producer::{Producer, REPLY_TOPIC_PREFIX};
