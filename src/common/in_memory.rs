// src/common/in_memory.rs
//! In-process broker for tests and local development.
//!
//! Models the parts of AMQP the messaging core relies on: topic and direct
//! exchanges, durable queues that outlive connections, per-delivery ack/nack
//! with the `redelivered` flag, and requeue of unacked messages when a
//! session goes away. Failure injection hooks (unreachable hosts, forced
//! disconnects, publish backpressure) make the reconnect paths testable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::amqp_client::{
    BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream, MessageProperties,
};
use super::errors::{BrokerError, Result};
use super::topology::{topic_matches, ExchangeKind};

/// A message as it was handed to the broker, kept for assertions.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.data).ok()
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    session: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    session: u64,
    message: StoredMessage,
}

struct Session {
    open: bool,
    failures: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    sessions: HashMap<u64, Session>,
    next_tag: u64,
    next_session: u64,
    unreachable_hosts: HashSet<String>,
    connect_failures_remaining: u32,
    connect_attempts: Vec<String>,
    backpressure: bool,
    fail_publishes: bool,
    published: Vec<PublishedMessage>,
    dead_lettered: Vec<PublishedMessage>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let kind = *self.exchanges.get(exchange).ok_or_else(|| {
            BrokerError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, bound_exchange, pattern) in &self.bindings {
            let matched = bound_exchange == exchange
                && match kind {
                    ExchangeKind::Topic => topic_matches(pattern, routing_key),
                    ExchangeKind::Direct => pattern == routing_key,
                };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            if front {
                state.ready.push_front(message);
            } else {
                state.ready.push_back(message);
            }
        }
        self.dispatch(queue);
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            state.consumers.retain(|slot| !slot.sender.is_closed());
            if state.consumers.is_empty() {
                return;
            }
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            let index = state.next_consumer % state.consumers.len();
            state.next_consumer = state.next_consumer.wrapping_add(1);
            let session = state.consumers[index].session;

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            let sent = self.queues.get(queue).map_or(false, |state| {
                state.consumers[index].sender.send(Ok(delivery)).is_ok()
            });
            if sent {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        session,
                        message,
                    },
                );
            } else if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_front(message);
            }
        }
    }

    /// Drops the session's consumers and puts its unacked messages back.
    fn end_session(&mut self, session: u64) {
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.open = false;
        }
        for state in self.queues.values_mut() {
            state.consumers.retain(|slot| slot.session != session);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first so push_front restores the original order
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in orphaned {
            if let Some(Unacked { queue, mut message, .. }) = self.unacked.remove(&tag) {
                message.redelivered = true;
                if let Some(state) = self.queues.get_mut(&queue) {
                    state.ready.push_front(message);
                }
            }
        }
    }

    fn session_open(&self, session: u64) -> bool {
        self.sessions.get(&session).map_or(false, |s| s.open)
    }
}

/// Shared broker state; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable_hosts.remove(host);
        } else {
            state.unreachable_hosts.insert(host.to_string());
        }
    }

    /// The next `count` connection attempts fail regardless of host.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures_remaining = count;
    }

    pub fn set_backpressure(&self, enabled: bool) {
        self.lock().backpressure = enabled;
    }

    pub fn set_publish_failure(&self, enabled: bool) {
        self.lock().fail_publishes = enabled;
    }

    /// Simulates a network partition: every open session is closed and
    /// notified through its failure channel.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.end_session(id);
            if let Some(session) = state.sessions.get(&id) {
                let _ = session.failures.send(reason.to_string());
            }
        }
    }

    /// Reports a channel-level error on every open session while leaving the
    /// sessions themselves open, like a lapin channel closed by
    /// PRECONDITION_FAILED whose connection survives.
    pub fn raise_channel_error(&self, reason: &str) {
        let state = self.lock();
        for session in state.sessions.values().filter(|session| session.open) {
            let _ = session.failures.send(reason.to_string());
        }
    }

    /// Broker-side `basic.cancel`: drops every consumer on `queue` without
    /// touching its session.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(state) = self.lock().queues.get_mut(queue) {
            state.consumers.clear();
        }
    }

    /// Publishes from outside any session, as another process would.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &Value) -> Result<usize> {
        let data = serde_json::to_vec(payload)?;
        let mut state = self.lock();
        let targets = state.route(exchange, routing_key)?;
        for queue in &targets {
            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: MessageProperties::json(),
                data: data.clone(),
                redelivered: false,
            };
            state.enqueue(queue, message, false);
        }
        Ok(targets.len())
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().connect_attempts.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Messages nacked without requeue.
    pub fn dead_lettered(&self) -> Vec<PublishedMessage> {
        self.lock().dead_lettered.clone()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    pub fn binding_exists(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|(q, e, k)| q == queue && e == exchange && k == routing_key)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| {
            q.consumers.iter().filter(|c| !c.sender.is_closed()).count()
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.values().filter(|s| s.open).count()
    }
}

pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

fn host_of(uri: &str) -> String {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    host_port
        .split(':')
        .next()
        .unwrap_or(host_port)
        .to_string()
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn open(&self, uri: &str) -> Result<BrokerSession> {
        let host = host_of(uri);
        let mut state = self.broker.lock();
        state.connect_attempts.push(host.clone());

        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(BrokerError::ConnectionError(format!(
                "connection refused by {}",
                host
            )));
        }
        if state.unreachable_hosts.contains(&host) {
            return Err(BrokerError::ConnectionError(format!("host {} unreachable", host)));
        }

        state.next_session += 1;
        let session = state.next_session;
        let (failure_tx, failures) = mpsc::unbounded_channel();
        state.sessions.insert(
            session,
            Session {
                open: true,
                failures: failure_tx,
            },
        );
        debug!(host = %host, session, "In-memory session opened");

        Ok(BrokerSession {
            channel: Arc::new(InMemoryChannel {
                broker: self.broker.clone(),
                session,
            }),
            failures,
        })
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    session: u64,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if !state.session_open(self.session) {
            return Err(BrokerError::ChannelError("channel is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::TopologyError(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        let mut state = self.open_state()?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::TopologyError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::TopologyError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool> {
        let mut state = self.open_state()?;
        if state.fail_publishes {
            return Err(BrokerError::PublishError("publish rejected by broker".to_string()));
        }
        let targets = state.route(exchange, routing_key)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            data: payload.to_vec(),
        });
        for queue in &targets {
            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                data: payload.to_vec(),
                redelivered: false,
            };
            state.enqueue(queue, message, false);
        }
        Ok(!state.backpressure)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(queue_state) => queue_state.consumers.push(ConsumerSlot {
                session: self.session,
                sender,
            }),
            None => {
                return Err(BrokerError::ConsumeError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )))
            }
        }
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.open_state()?;
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::AckError(format!("unknown delivery tag {}", delivery_tag)))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.open_state()?;
        let Unacked { queue, mut message, .. } = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::AckError(format!("unknown delivery tag {}", delivery_tag)))?;

        if requeue {
            message.redelivered = true;
            state.enqueue(&queue, message, true);
        } else {
            state.dead_lettered.push(PublishedMessage {
                exchange: message.exchange,
                routing_key: message.routing_key,
                properties: message.properties,
                data: message.data,
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().end_session(self.session);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().session_open(self.session)
    }
}
