//! # MiniMQ
//!
//! `minimq` is a small point-to-point message broker and its client runtime.
//! Producers push messages onto named topics over a line-based TCP protocol,
//! consumers poll them off one at a time and acknowledge them. Every message
//! is journaled until acknowledged, so a restart redelivers whatever was still
//! pending (at-least-once delivery).
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The message record, topic queues, in-flight tracking and the engine that ties them together.
//! - `client`: Producer, consumer and the connection pool they share.
//! - `config`: Handles loading broker and client settings from files and the environment.
//! - `persistence`: The append-only journal of unacknowledged messages.
//! - `transport`: The line protocol and the TCP server speaking it.
//! - `utils`: Shared utilities, such as error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
