// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory broker implementing the `mats-core` broker port.
//!
//! Bypasses any wire transport and keeps queues and topics in process
//! memory, suitable for embedded deployments and tests. Semantics follow
//! the port contract:
//!
//! - sends buffer in the session transaction and become visible on commit;
//! - a received message is redelivered when the session rolls back or
//!   closes without committing;
//! - topics fan out to the subscribers that are live at commit time; with
//!   none, the message is gone;
//! - interactive messages take a fast lane past ordinary ones.
//!
//! Fault injection (`fail_next_commits`, `fail_next_receives`) and depth /
//! commit counters exist for exercising the engine's failure paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use mats_core::broker::{
    Broker, BrokerConnection, BrokerError, BrokerSession, Destination, DestinationKind,
    MatsMessage,
};

struct QueueDeques {
    high: VecDeque<MatsMessage>,
    normal: VecDeque<MatsMessage>,
}

struct QueueState {
    deques: Mutex<QueueDeques>,
    notify: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            deques: Mutex::new(QueueDeques {
                high: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: MatsMessage) {
        {
            let mut deques = self.deques.lock().expect("queue lock poisoned");
            if message.interactive {
                deques.high.push_back(message);
            } else {
                deques.normal.push_back(message);
            }
        }
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: MatsMessage) {
        {
            let mut deques = self.deques.lock().expect("queue lock poisoned");
            if message.interactive {
                deques.high.push_front(message);
            } else {
                deques.normal.push_front(message);
            }
        }
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<MatsMessage> {
        let mut deques = self.deques.lock().expect("queue lock poisoned");
        deques
            .high
            .pop_front()
            .or_else(|| deques.normal.pop_front())
    }

    fn depth(&self) -> usize {
        let deques = self.deques.lock().expect("queue lock poisoned");
        deques.high.len() + deques.normal.len()
    }
}

struct BrokerShared {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<MatsMessage>>>>,
    fail_commits: AtomicUsize,
    fail_receives: AtomicUsize,
    committed_messages: AtomicU64,
}

impl BrokerShared {
    fn queue(&self, name: &str) -> Arc<QueueState> {
        Arc::clone(
            self.queues
                .lock()
                .expect("queue map lock poisoned")
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(QueueState::new())),
        )
    }

    fn route(&self, destination: &Destination, message: MatsMessage) {
        match destination.kind {
            DestinationKind::Queue => {
                trace!(destination = %destination, "delivering to queue");
                self.queue(&destination.name).push_back(message);
            }
            DestinationKind::Topic => {
                let mut topics = self.topics.lock().expect("topic map lock poisoned");
                if let Some(subscribers) = topics.get_mut(&destination.name) {
                    subscribers.retain(|tx| tx.send(message.clone()).is_ok());
                    trace!(
                        destination = %destination,
                        subscribers = subscribers.len(),
                        "fanned out to topic"
                    );
                }
                // With no live subscribers, the message is simply gone.
            }
        }
    }
}

/// Take one unit off an injected-failure counter, if any remain.
fn consume_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

/// The in-memory broker. Clone-cheap via [`Arc`]; share one instance
/// between factories to let them communicate.
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(BrokerShared {
                queues: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                fail_commits: AtomicUsize::new(0),
                fail_receives: AtomicUsize::new(0),
                committed_messages: AtomicU64::new(0),
            }),
        })
    }

    /// Make the next `count` session commits fail, for exercising the
    /// inter-commit failure window.
    pub fn fail_next_commits(&self, count: usize) {
        self.shared.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail, for exercising the session
    /// crash-and-reacquire path.
    pub fn fail_next_receives(&self, count: usize) {
        self.shared.fail_receives.store(count, Ordering::SeqCst);
    }

    /// Total messages made visible by committed sends.
    pub fn committed_message_count(&self) -> u64 {
        self.shared.committed_messages.load(Ordering::SeqCst)
    }

    /// Depth of a queue by full destination name (prefix included).
    pub fn queue_depth(&self, name: &str) -> usize {
        self.shared
            .queues
            .lock()
            .expect("queue map lock poisoned")
            .get(name)
            .map(|q| q.depth())
            .unwrap_or(0)
    }

    /// Messages currently sitting in any queue.
    pub fn total_queued(&self) -> usize {
        self.shared
            .queues
            .lock()
            .expect("queue map lock poisoned")
            .values()
            .map(|q| q.depth())
            .sum()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct InMemoryConnection {
    shared: Arc<BrokerShared>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connection is closed".to_string()));
        }
        Ok(Box::new(InMemorySession {
            shared: Arc::clone(&self.shared),
            connection_closed: Arc::clone(&self.closed),
            consumer: None,
            pending_sends: Vec::new(),
            inflight: Vec::new(),
            closed: false,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

enum Consumer {
    Queue(Arc<QueueState>),
    Topic(mpsc::UnboundedReceiver<MatsMessage>),
}

struct InMemorySession {
    shared: Arc<BrokerShared>,
    connection_closed: Arc<AtomicBool>,
    consumer: Option<Consumer>,
    pending_sends: Vec<(Destination, MatsMessage)>,
    /// Received but unacknowledged messages, with their home queue for
    /// redelivery on rollback.
    inflight: Vec<(Arc<QueueState>, MatsMessage)>,
    closed: bool,
}

impl InMemorySession {
    fn requeue_inflight(&mut self) {
        for (queue, message) in self.inflight.drain(..).rev() {
            queue.push_front(message);
        }
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn subscribe(&mut self, destination: &Destination) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::SessionClosed);
        }
        match destination.kind {
            DestinationKind::Queue => {
                self.consumer = Some(Consumer::Queue(self.shared.queue(&destination.name)));
            }
            DestinationKind::Topic => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.shared
                    .topics
                    .lock()
                    .expect("topic map lock poisoned")
                    .entry(destination.name.clone())
                    .or_default()
                    .push(tx);
                self.consumer = Some(Consumer::Topic(rx));
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<MatsMessage>, BrokerError> {
        if self.closed || self.connection_closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if consume_failure(&self.shared.fail_receives) {
            return Err(BrokerError::Receive("injected receive failure".to_string()));
        }
        match &mut self.consumer {
            None => Err(BrokerError::Receive(
                "no consumer bound; call subscribe first".to_string(),
            )),
            Some(Consumer::Topic(rx)) => match rx.recv().await {
                // Topic messages are not redelivered: loss during downtime
                // is accepted pub-sub semantics.
                Some(message) => Ok(Some(message)),
                None => Ok(None),
            },
            Some(Consumer::Queue(queue)) => {
                let queue = Arc::clone(queue);
                loop {
                    let notified = queue.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if let Some(message) = queue.pop() {
                        self.inflight.push((Arc::clone(&queue), message.clone()));
                        return Ok(Some(message));
                    }
                    if self.connection_closed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    notified.await;
                }
            }
        }
    }

    async fn send(
        &mut self,
        destination: &Destination,
        message: MatsMessage,
    ) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::SessionClosed);
        }
        self.pending_sends.push((destination.clone(), message));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::SessionClosed);
        }
        if consume_failure(&self.shared.fail_commits) {
            return Err(BrokerError::Commit("injected commit failure".to_string()));
        }
        let committed = self.pending_sends.len() as u64;
        for (destination, message) in self.pending_sends.drain(..) {
            self.shared.route(&destination, message);
        }
        self.inflight.clear();
        self.shared
            .committed_messages
            .fetch_add(committed, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BrokerError> {
        self.pending_sends.clear();
        self.requeue_inflight();
        Ok(())
    }

    async fn is_active(&self) -> bool {
        !self.closed && !self.connection_closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        // Uncommitted work rolls back.
        self.pending_sends.clear();
        self.requeue_inflight();
        self.consumer = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tag: &str) -> MatsMessage {
        let mut m = MatsMessage::new();
        m.put_string("tag", tag);
        m
    }

    fn tag(m: &MatsMessage) -> &str {
        m.string("tag").unwrap()
    }

    async fn session(broker: &InMemoryBroker) -> Box<dyn BrokerSession> {
        broker
            .connect()
            .await
            .unwrap()
            .open_session()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_invisible_until_commit() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        producer.commit().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.committed_message_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_sends() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        producer.rollback().await.unwrap();
        producer.commit().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_receive_and_commit_acknowledges() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        producer.commit().await.unwrap();

        let mut consumer = session(&broker).await;
        consumer.subscribe(&Destination::queue("q")).await.unwrap();
        let received = consumer.receive().await.unwrap().unwrap();
        assert_eq!(tag(&received), "a");
        consumer.commit().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_rollback_redelivers_in_order() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        producer
            .send(&Destination::queue("q"), message("b"))
            .await
            .unwrap();
        producer.commit().await.unwrap();

        let mut consumer = session(&broker).await;
        consumer.subscribe(&Destination::queue("q")).await.unwrap();
        let first = consumer.receive().await.unwrap().unwrap();
        assert_eq!(tag(&first), "a");
        consumer.rollback().await.unwrap();

        let again = consumer.receive().await.unwrap().unwrap();
        assert_eq!(tag(&again), "a");
        let second = consumer.receive().await.unwrap().unwrap();
        assert_eq!(tag(&second), "b");
    }

    #[tokio::test]
    async fn test_interactive_messages_take_the_fast_lane() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("ordinary"))
            .await
            .unwrap();
        let mut urgent = message("urgent");
        urgent.interactive = true;
        producer
            .send(&Destination::queue("q"), urgent)
            .await
            .unwrap();
        producer.commit().await.unwrap();

        let mut consumer = session(&broker).await;
        consumer.subscribe(&Destination::queue("q")).await.unwrap();
        let first = consumer.receive().await.unwrap().unwrap();
        assert_eq!(tag(&first), "urgent");
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_live_subscribers_only() {
        let broker = InMemoryBroker::new();
        let topic = Destination::topic("t");

        let mut sub_a = session(&broker).await;
        sub_a.subscribe(&topic).await.unwrap();
        let mut sub_b = session(&broker).await;
        sub_b.subscribe(&topic).await.unwrap();

        let mut producer = session(&broker).await;
        producer.send(&topic, message("evt")).await.unwrap();
        producer.commit().await.unwrap();

        assert_eq!(tag(&sub_a.receive().await.unwrap().unwrap()), "evt");
        assert_eq!(tag(&sub_b.receive().await.unwrap().unwrap()), "evt");

        // A subscriber arriving after the publish gets nothing; verify by
        // publishing a second event it *does* get, first in its stream.
        let mut late = session(&broker).await;
        late.subscribe(&topic).await.unwrap();
        producer.send(&topic, message("evt2")).await.unwrap();
        producer.commit().await.unwrap();
        assert_eq!(tag(&late.receive().await.unwrap().unwrap()), "evt2");
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_next_commits(1);
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        assert!(matches!(
            producer.commit().await,
            Err(BrokerError::Commit(_))
        ));
        // The failed transaction's sends were never published.
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_close_requeues_unacknowledged() {
        let broker = InMemoryBroker::new();
        let mut producer = session(&broker).await;
        producer
            .send(&Destination::queue("q"), message("a"))
            .await
            .unwrap();
        producer.commit().await.unwrap();

        let mut consumer = session(&broker).await;
        consumer.subscribe(&Destination::queue("q")).await.unwrap();
        let _ = consumer.receive().await.unwrap().unwrap();
        consumer.close().await;
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_connection_close_deactivates_sessions() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let mut session = connection.open_session().await.unwrap();
        assert!(session.is_active().await);
        connection.close().await;
        assert!(!session.is_active().await);
        assert!(connection.open_session().await.is_err());
        assert!(session.receive().await.unwrap().is_none());
    }
}
