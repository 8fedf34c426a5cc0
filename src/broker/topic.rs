//! Topic management
//!
//! A `Topic` holds the FIFO queue of messages waiting to be consumed from one
//! topic name, plus a `Notify` that wakes consumers blocked on the topic.
//! `TopicQueues` maps names to topics and creates them lazily.
//!
//! Concurrency note: callers must synchronize access (the broker keeps
//! `TopicQueues` behind its state lock). Waiting for a message happens
//! outside that lock: callers clone the topic's notifier, release the lock
//! and await it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::broker::message::Message;

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub messages: VecDeque<Message>,
    available: Arc<Notify>,
}

impl Topic {
    /// Create an empty topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: VecDeque::new(),
            available: Arc::new(Notify::new()),
        }
    }

    /// Append at the tail and wake every consumer waiting on this topic.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        self.available.notify_waiters();
    }

    /// Remove the head of the queue.
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// A topic can be dropped once it is empty and nobody is waiting on it.
    fn is_idle(&self) -> bool {
        self.messages.is_empty() && Arc::strong_count(&self.available) == 1
    }
}

#[derive(Debug, Default)]
pub struct TopicQueues {
    topics: HashMap<String, Topic>,
}

impl TopicQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_mut(&mut self, name: &str) -> &mut Topic {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name))
    }

    /// Append a message to the tail of its topic, creating the topic if needed.
    pub fn enqueue(&mut self, message: Message) {
        let topic = self.topic_mut(&message.topic);
        topic.push(message);
    }

    /// Take the head message of `topic` without waiting.
    pub fn dequeue(&mut self, topic: &str) -> Option<Message> {
        self.topics.get_mut(topic).and_then(Topic::pop)
    }

    /// Handle used to wait for the next enqueue on `topic`.
    pub fn notifier(&mut self, topic: &str) -> Arc<Notify> {
        Arc::clone(&self.topic_mut(topic).available)
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.messages.len())
    }

    pub fn total_len(&self) -> usize {
        self.topics.values().map(|t| t.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn contains(&self, topic: &str, message_id: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.messages.iter().any(|m| m.id == message_id))
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Drop empty topics nobody is waiting on (e.g. spent reply topics).
    /// Returns how many were removed.
    pub fn prune_idle(&mut self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, topic| !topic.is_idle());
        before - self.topics.len()
    }
}
