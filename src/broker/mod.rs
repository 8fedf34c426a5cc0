pub mod engine;
pub mod message;
pub mod topic;
pub mod tracker;

pub use engine::{Broker, BrokerStats};
pub use message::Message;

#[cfg(test)]
mod tests;
