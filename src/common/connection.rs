// src/common/connection.rs
// Single shared broker connection: host fallback, backoff-scheduled
// reconnects, and replay of topology and consumers after each reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerChannel, BrokerConnector, BrokerSession, MessageProperties};
use super::consumer::{run_consumer, ConsumerId, ConsumerRegistration, MessageHandler};
use super::errors::{BrokerError, Result};
use super::retry::{add_jitter, backoff_delay};
use super::topology::{ExchangeKind, TopologyDeclaration, TopologyRegistrar};
use crate::config::{BrokerConfig, ConnectionConfig, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; needs an explicit `connect()` or restart
    Failed,
}

struct Live {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

/// A running consumer task and the connection generation it subscribed on.
struct ActiveConsumer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<ConnectionState>,
    live: Mutex<Option<Live>>,
    connecting: AtomicBool,
    closed: AtomicBool,
    reconnect_attempts: AtomicU32,
    generation: AtomicU64,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    topology: TopologyRegistrar,
    registry: Mutex<Vec<ConsumerRegistration>>,
    active_consumers: Mutex<HashMap<ConsumerId, ActiveConsumer>>,
    consumer_setup: tokio::sync::Mutex<()>,
    next_consumer_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resets the single-flight flag even if `connect()` is cancelled.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ConnectingGuard(flag))
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: &BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                config: config.connection.clone(),
                policy: config.reconnect.clone(),
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                live: Mutex::new(None),
                connecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                reconnect_timer: Mutex::new(None),
                watcher: Mutex::new(None),
                topology: TopologyRegistrar::new(),
                registry: Mutex::new(Vec::new()),
                active_consumers: Mutex::new(HashMap::new()),
                consumer_setup: tokio::sync::Mutex::new(()),
                next_consumer_id: AtomicU64::new(0),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| ConnectionManager { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.inner.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Connection state changed");
            *current = state;
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.current_channel().is_some()
    }

    pub fn topology(&self) -> &TopologyRegistrar {
        &self.inner.topology
    }

    /// The live channel, if connected and still open.
    pub fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        lock(&self.inner.live)
            .as_ref()
            .filter(|live| live.channel.is_open())
            .map(|live| live.channel.clone())
    }

    fn current_generation(&self) -> Option<u64> {
        lock(&self.inner.live).as_ref().map(|live| live.generation)
    }

    /// Returns the live channel, connecting first if needed.
    ///
    /// `None` means "try later": either another caller is already
    /// connecting, or no host was reachable and a reconnect was scheduled.
    pub async fn connect(&self) -> Option<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.current_channel() {
            return Some(channel);
        }

        let established = {
            let Some(_guard) = ConnectingGuard::acquire(&self.inner.connecting) else {
                debug!("Connection attempt already in progress");
                return None;
            };
            if let Some(channel) = self.current_channel() {
                return Some(channel);
            }
            self.inner.closed.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Connecting);
            self.establish().await
        };

        if established.is_none() && !self.inner.closed.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
        established
    }

    async fn establish(&self) -> Option<Arc<dyn BrokerChannel>> {
        let hosts = self.inner.config.candidate_hosts();
        for host in &hosts {
            let uri = self.inner.config.amqp_uri(host);
            info!(uri = %self.inner.config.redacted_uri(host), "Attempting to connect to RabbitMQ");

            match self.inner.connector.open(&uri).await {
                Ok(session) => return self.install(session, host).await,
                Err(e) => warn!(host = %host, error = %e, "Failed to connect to RabbitMQ host"),
            }
        }

        error!(hosts = ?hosts, "Could not connect to any RabbitMQ host");
        self.set_state(ConnectionState::Disconnected);
        None
    }

    async fn install(&self, session: BrokerSession, host: &str) -> Option<Arc<dyn BrokerChannel>> {
        let BrokerSession { channel, failures } = session;

        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("Connection closed while connecting, discarding new session");
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close discarded session");
            }
            self.set_state(ConnectionState::Disconnected);
            return None;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // subscriptions from an earlier generation may have died without the
        // failure watcher ever reporting it
        self.stop_consumers();
        let failed = self.inner.topology.replay(channel.as_ref()).await;
        if failed > 0 {
            warn!(failed, "Some topology declarations could not be re-asserted");
        }

        let previous = lock(&self.inner.live).replace(Live {
            channel: channel.clone(),
            generation,
        });
        if let Some(previous) = previous {
            self.retire(previous);
        }
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        let pending_timer = lock(&self.inner.reconnect_timer).take();
        if let Some(timer) = pending_timer {
            timer.abort();
        }
        self.set_state(ConnectionState::Connected);
        self.spawn_watcher(failures, generation);

        info!(host, generation, "Connected to RabbitMQ");
        self.replay_consumers(&channel, generation).await;
        Some(channel)
    }

    fn spawn_watcher(&self, mut failures: UnboundedReceiver<String>, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let reason = failures
                .recv()
                .await
                .unwrap_or_else(|| "connection dropped".to_string());
            if let Some(manager) = ConnectionManager::from_weak(&weak) {
                manager.handle_connection_loss(generation, &reason);
            }
        });

        let previous = lock(&self.inner.watcher).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn handle_connection_loss(&self, generation: u64, reason: &str) {
        let lost = {
            let mut live = lock(&self.inner.live);
            match live.as_ref() {
                Some(current) if current.generation == generation => live.take(),
                _ => {
                    debug!(generation, "Ignoring failure from a previous connection");
                    return;
                }
            }
        };

        warn!(reason, generation, "RabbitMQ connection lost");
        self.stop_consumers();
        if let Some(lost) = lost {
            self.retire(lost);
        }
        self.set_state(ConnectionState::Disconnected);
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    /// Closes a superseded channel in the background. A channel-level error
    /// leaves the underlying connection open, so it has to be closed here.
    fn retire(&self, live: Live) {
        let Live { channel, generation } = live;
        tokio::spawn(async move {
            match channel.close().await {
                Ok(()) => debug!(generation, "Closed superseded RabbitMQ connection"),
                Err(e) => {
                    debug!(generation, error = %e, "Superseded RabbitMQ connection already closed")
                }
            }
        });
    }

    /// Delay before reconnect attempt `attempt`:
    /// `min(base * factor^(attempt-1) + jitter, cap)`, jitter up to 30%.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let policy = &self.inner.policy;
        let cap = policy.max_delay();
        add_jitter(backoff_delay(policy.base_delay(), policy.factor, cap, attempt)).min(cap)
    }

    /// Arms the single reconnect timer unless one is pending, the manager
    /// is closed, or attempts are exhausted.
    pub fn schedule_reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut timer = lock(&self.inner.reconnect_timer);
        if timer.as_ref().map_or(false, |pending| !pending.is_finished()) {
            debug!("Reconnect already scheduled");
            return;
        }

        let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max_attempts = self.inner.policy.max_attempts;
        if attempt > max_attempts {
            self.set_state(ConnectionState::Failed);
            error!(
                attempts = max_attempts,
                "Max reconnection attempts reached. RabbitMQ connection requires operator intervention"
            );
            return;
        }

        let delay = self.reconnect_delay(attempt);
        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling RabbitMQ reconnect"
        );

        let weak = Arc::downgrade(&self.inner);
        *timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(manager) = ConnectionManager::from_weak(&weak) {
                drop(lock(&manager.inner.reconnect_timer).take());
                manager.connect().await;
            }
        }));
    }

    /// Cancels any pending reconnect, stops consumers, closes the channel and
    /// connection and resets counters. Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let timer = lock(&self.inner.reconnect_timer).take();
        if let Some(timer) = timer {
            timer.abort();
        }
        let watcher = lock(&self.inner.watcher).take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.stop_consumers();

        let live = lock(&self.inner.live).take();
        if let Some(live) = live {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(e) = live.channel.close().await {
                warn!(error = %e, "Error while closing RabbitMQ connection");
            }
        }

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    fn stop_consumers(&self) {
        let stopped: Vec<ActiveConsumer> = lock(&self.inner.active_consumers)
            .drain()
            .map(|(_, active)| active)
            .collect();
        for active in stopped {
            active.handle.abort();
        }
    }

    /// Declares `declaration` on the live channel and records it for replay.
    /// Broker errors are logged and reported as `false`.
    pub async fn declare(&self, declaration: TopologyDeclaration) -> bool {
        let Some(channel) = self.connect().await else {
            warn!("Not connected, {} will be asserted on connect", declaration);
            self.inner.topology.record(declaration);
            return false;
        };

        match declaration.apply(channel.as_ref()).await {
            Ok(()) => {
                if self.inner.topology.record(declaration.clone()) {
                    debug!("Asserted {}", declaration);
                }
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to assert {}", declaration);
                false
            }
        }
    }

    pub async fn assert_queue(&self, queue: &str) -> bool {
        self.declare(TopologyDeclaration::queue(queue)).await
    }

    pub async fn assert_exchange(&self, exchange: &str, kind: ExchangeKind) -> bool {
        self.declare(TopologyDeclaration::exchange(exchange, kind)).await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.declare(TopologyDeclaration::binding(queue, exchange, routing_key))
            .await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool> {
        let channel = self.connect().await.ok_or(BrokerError::NotConnected)?;
        channel
            .publish(exchange, routing_key, payload, properties)
            .await
    }

    /// Registers `handler` for `queue`. The registration survives reconnects;
    /// if the broker is unreachable now, consumption starts on the next
    /// successful connect.
    pub async fn consume_queue(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> ConsumerId {
        let id = ConsumerId(self.inner.next_consumer_id.fetch_add(1, Ordering::SeqCst) + 1);
        let registration = ConsumerRegistration {
            id,
            queue: queue.to_string(),
            handler,
        };
        lock(&self.inner.registry).push(registration.clone());
        info!(queue, consumer = id.0, "Registered consumer");

        let channel = match self.connect().await {
            Some(channel) => Some(channel),
            None => self.current_channel(),
        };
        match (channel, self.current_generation()) {
            (Some(channel), Some(generation)) => {
                self.start_consumer(channel, registration, generation).await;
            }
            _ => warn!(queue, "Not connected, consumer will start after reconnect"),
        }
        id
    }

    /// Removes a registration and stops its consumer.
    pub fn cancel_consumer(&self, id: ConsumerId) -> bool {
        let removed = {
            let mut registry = lock(&self.inner.registry);
            let before = registry.len();
            registry.retain(|registration| registration.id != id);
            registry.len() != before
        };
        let active = lock(&self.inner.active_consumers).remove(&id);
        if let Some(active) = active {
            active.handle.abort();
        }
        removed
    }

    pub fn registered_consumers(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    async fn replay_consumers(&self, channel: &Arc<dyn BrokerChannel>, generation: u64) {
        let registrations = lock(&self.inner.registry).clone();
        if registrations.is_empty() {
            return;
        }
        info!(consumers = registrations.len(), "Re-registering consumers");
        for registration in registrations {
            self.start_consumer(channel.clone(), registration, generation)
                .await;
        }
    }

    async fn start_consumer(
        &self,
        channel: Arc<dyn BrokerChannel>,
        registration: ConsumerRegistration,
        generation: u64,
    ) -> bool {
        let _setup = self.inner.consumer_setup.lock().await;
        {
            let mut active = lock(&self.inner.active_consumers);
            let running = active.get(&registration.id).map(|current| {
                current.generation == generation && !current.handle.is_finished()
            });
            match running {
                Some(true) => return true,
                Some(false) => {
                    if let Some(stale) = active.remove(&registration.id) {
                        stale.handle.abort();
                    }
                }
                None => {}
            }
        }
        let still_registered = lock(&self.inner.registry)
            .iter()
            .any(|r| r.id == registration.id);
        if !still_registered {
            return false;
        }

        let tag = format!("consumer-{}", registration.id.0);
        let deliveries = match channel.consume(&registration.queue, &tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(queue = %registration.queue, error = %e, "Failed to start consumer");
                return false;
            }
        };

        if self.current_generation() != Some(generation) {
            debug!(queue = %registration.queue, "Connection changed while subscribing");
            return false;
        }
        let id = registration.id;
        let weak = Arc::downgrade(&self.inner);
        // held while spawning so `consumer_ended` always finds the entry
        let mut active = lock(&self.inner.active_consumers);
        let handle = tokio::spawn(async move {
            let queue = registration.queue.clone();
            run_consumer(channel.clone(), registration, deliveries).await;
            if let Some(manager) = ConnectionManager::from_weak(&weak) {
                manager.consumer_ended(id, &queue, channel, generation);
            }
        });
        active.insert(id, ActiveConsumer { generation, handle });
        true
    }

    /// A subscription ended while its channel stayed open, e.g. the broker
    /// cancelled it. Re-subscribes after the base reconnect delay.
    fn consumer_ended(
        &self,
        id: ConsumerId,
        queue: &str,
        channel: Arc<dyn BrokerChannel>,
        generation: u64,
    ) {
        if self.inner.closed.load(Ordering::SeqCst)
            || self.current_generation() != Some(generation)
            || !channel.is_open()
        {
            return;
        }
        {
            let mut active = lock(&self.inner.active_consumers);
            if active.get(&id).map_or(true, |current| current.generation != generation) {
                return;
            }
            active.remove(&id);
        }
        let registration = lock(&self.inner.registry)
            .iter()
            .find(|r| r.id == id)
            .cloned();
        let Some(registration) = registration else {
            return;
        };

        warn!(queue, consumer = id.0, "Consumer cancelled by broker, re-subscribing");
        let delay = self.inner.policy.base_delay();
        let manager = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            manager.start_consumer(channel, registration, generation).await;
        });
    }
}
