//! Broker engine
//!
//! This module composes the topic queues, the delivery tracker and the
//! message log into the broker's three operations:
//! - `produce`: log the message durably, then make it visible in its topic
//! - `consume`: hand the head of a topic to one consumer and start tracking it
//! - `acknowledge`: stop tracking a dispatched message and erase its record
//!
//! A background scanner moves dispatched messages whose ACK is overdue back
//! to the tail of their topic.
//!
//! Concurrency and usage notes:
//! - All three structures live behind one lock, so every per-message move
//!   (log / queue / tracker) is applied as a unit. No observer can see a
//!   message in both the queue and the tracker, or in neither.
//! - `consume` never waits while holding the lock. It registers interest in
//!   the topic's notifier, releases the lock and sleeps until a producer
//!   wakes it or the bounded wait runs out.
//! - Log I/O runs under the lock. That keeps the log consistent with memory
//!   at the cost of serializing disk writes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::message::Message;
use crate::broker::topic::TopicQueues;
use crate::broker::tracker::DeliveryTracker;
use crate::config::BrokerSettings;
use crate::persistence::MessageLog;
use crate::utils::error::PersistenceError;

#[derive(Debug)]
struct BrokerState {
    queues: TopicQueues,
    tracker: DeliveryTracker,
    log: MessageLog,
    /// Ids currently queued or in flight.
    live: HashSet<String>,
}

#[derive(Debug, Default)]
struct Counters {
    produced: AtomicU64,
    dispatched: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
    durability_failures: AtomicU64,
}

/// Point-in-time view of the broker's counters and sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub produced: u64,
    pub dispatched: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
    pub durability_failures: u64,
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct Broker {
    state: Mutex<BrokerState>,
    counters: Counters,
    ack_timeout: Duration,
    scan_interval: Duration,
    poll_wait: Duration,
}

impl Broker {
    /// Build an empty broker over `log` without replaying it.
    pub fn new(log: MessageLog, settings: &BrokerSettings) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                queues: TopicQueues::new(),
                tracker: DeliveryTracker::new(),
                log,
                live: HashSet::new(),
            }),
            counters: Counters::default(),
            ack_timeout: settings.ack_timeout(),
            scan_interval: settings.scan_interval(),
            poll_wait: settings.poll_wait(),
        }
    }

    /// Open the log at `settings.log_path` and requeue everything in it.
    ///
    /// Replayed messages go back to their topic queues, not to the tracker:
    /// whatever was in flight at shutdown is delivered again.
    pub fn open(settings: &BrokerSettings) -> Result<Self, PersistenceError> {
        let broker = Self::new(MessageLog::new(&settings.log_path), settings);
        let recovered = broker.recover()?;
        info!(
            "Recovered {recovered} unacknowledged message(s) from {}",
            settings.log_path
        );
        Ok(broker)
    }

    fn recover(&self) -> Result<usize, PersistenceError> {
        let mut state = self.lock();
        let messages = state.log.replay()?;
        let mut recovered = 0;
        for message in messages {
            if !state.live.insert(message.id.clone()) {
                warn!("Duplicate log record for message [{}] skipped", message.id);
                continue;
            }
            state.queues.enqueue(message);
            recovered += 1;
        }
        Ok(recovered)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn poll_wait(&self) -> Duration {
        self.poll_wait
    }

    /// Accept a message and return its id.
    ///
    /// The record is appended to the log before the message is enqueued. A
    /// failed append is logged and counted, and the message is queued anyway.
    /// Producing an id that is still queued or in flight changes nothing.
    pub fn produce(&self, message: Message) -> String {
        let id = message.id.clone();
        let mut state = self.lock();

        if state.live.contains(&id) {
            debug!("Message [{id}] is already held; duplicate produce ignored");
            return id;
        }

        if let Err(e) = state.log.append(&message) {
            error!("FATAL: message [{id}] could not be persisted and is held only in memory: {e}");
            self.counters
                .durability_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        debug!("Queued message [{id}] on topic [{}]", message.topic);
        state.live.insert(id.clone());
        state.queues.enqueue(message);
        self.counters.produced.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Dispatch the head of `topic`, waiting up to the configured poll wait.
    pub async fn consume(&self, topic: &str) -> Option<Message> {
        self.consume_within(topic, self.poll_wait).await
    }

    /// Dispatch the head of `topic`, waiting at most `max_wait` for one to
    /// arrive. Returns `None` when the topic stays empty.
    pub async fn consume_within(&self, topic: &str, max_wait: Duration) -> Option<Message> {
        if topic.is_empty() {
            return None;
        }
        let deadline = Instant::now() + max_wait;

        loop {
            let notify = self.lock().queues.notifier(topic);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before checking so a produce in between still wakes us
            notified.as_mut().enable();

            if let Some(message) = self.try_dispatch(topic) {
                return Some(message);
            }

            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                return self.try_dispatch(topic);
            }
        }
    }

    /// Move the head of `topic` into the tracker without waiting.
    pub fn try_dispatch(&self, topic: &str) -> Option<Message> {
        let mut state = self.lock();
        let message = state.queues.dequeue(topic)?;
        state.tracker.track(message.clone(), now_ms());
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!("Dispatched message [{}] from topic [{topic}]", message.id);
        Some(message)
    }

    /// Settle a dispatched message. Returns `false` for ids that are not in
    /// flight, including repeated ACKs.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let mut state = self.lock();

        if state.tracker.untrack(message_id).is_none() {
            debug!("ACK for unknown or settled message [{message_id}] ignored");
            return false;
        }
        state.live.remove(message_id);

        match state.log.remove_by_id(message_id) {
            Ok(true) => {}
            Ok(false) => warn!("Acknowledged message [{message_id}] had no log record"),
            Err(e) => {
                error!("FATAL: record of acknowledged message [{message_id}] was not erased: {e}");
                self.counters
                    .durability_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        debug!("Acknowledged message [{message_id}]");
        true
    }

    /// One scan pass at the current time.
    pub fn redeliver_expired(&self) -> usize {
        self.redeliver_expired_at(now_ms())
    }

    /// Requeue every in-flight message dispatched more than the ACK timeout
    /// before `now_ms`. Returns how many were requeued.
    pub fn redeliver_expired_at(&self, now_ms: i64) -> usize {
        let mut state = self.lock();
        let expired = state.tracker.scan_expired(now_ms, self.ack_timeout);
        let count = expired.len();

        for message in expired {
            warn!(
                "Message [{}] on topic [{}] was not acknowledged within {:?}; requeued",
                message.id, message.topic, self.ack_timeout
            );
            state.queues.enqueue(message);
        }

        let pruned = state.queues.prune_idle();
        if pruned > 0 {
            debug!("Dropped {pruned} idle topic(s)");
        }

        self.counters
            .redelivered
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Run `redeliver_expired` every scan interval until `cancel` fires.
    pub fn spawn_redelivery_scanner(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Redelivery scanner stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let requeued = broker.redeliver_expired();
                        if requeued > 0 {
                            info!("Redelivery scan requeued {requeued} message(s)");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            produced: self.counters.produced.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            redelivered: self.counters.redelivered.load(Ordering::Relaxed),
            durability_failures: self.counters.durability_failures.load(Ordering::Relaxed),
            queued: state.queues.total_len(),
            in_flight: state.tracker.len(),
        }
    }

    pub fn queued_len(&self, topic: &str) -> usize {
        self.lock().queues.len(topic)
    }

    pub fn is_queued(&self, topic: &str, message_id: &str) -> bool {
        self.lock().queues.contains(topic, message_id)
    }

    pub fn is_in_flight(&self, message_id: &str) -> bool {
        self.lock().tracker.contains(message_id)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
