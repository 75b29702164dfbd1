//! Per-logical-channel engine: ties the transport, pending table, state
//! machine, heartbeat monitor, reconnect supervisor and subscription
//! replay together under one supervisor task.
//!
//! The supervisor runs a `tokio::select!` loop over facade commands,
//! transport events, the heartbeat interval, the pending-expiry sweep and
//! the (optional) reconnect timer. Requests themselves do not pass
//! through this loop: issuers register in the pending table and push the
//! encoded frame straight onto the writer queue, so unrelated in-flight
//! calls never serialize behind each other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{topic_router, PushDispatcher, PushListener, SubscriptionRegistry};
use crate::error::{GatelinkError, Result};
use crate::frame;
use crate::pending::{Outcome, PendingTable};
use crate::protocol;
use crate::reconnect::ReconnectPolicy;
use crate::state::{ChannelKind, ChannelState, ChannelStatus, StateCell};
use crate::transport::{Conn, TransportEvent};

/// How often abandoned pending entries are swept out.
const EXPIRE_SWEEP_PERIOD: Duration = Duration::from_millis(25);

/// Shared slot holding the write queue of the current connection, if any.
/// Replaced atomically on reconnect; `None` while down.
type WriterSlot = Arc<RwLock<Option<mpsc::Sender<Bytes>>>>;

enum Command {
    Connect { respond_to: oneshot::Sender<Result<()>> },
    Disconnect { respond_to: oneshot::Sender<()> },
    Subscribe {
        topic: String,
        push_protocol_id: u32,
        listener: PushListener,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Unsubscribe { topic: String, respond_to: oneshot::Sender<Result<()>> },
}

/// Facade-side handle to one logical channel.
#[derive(Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<StateCell>,
    pending: Arc<PendingTable>,
    writer: WriterSlot,
    default_timeout: Duration,
}

impl ChannelHandle {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Drive the channel to READY: transport connect plus the
    /// protocol-level session-init exchange.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { respond_to: tx })
            .await
            .map_err(|_| GatelinkError::ChannelClosed)?;
        rx.await.map_err(|_| GatelinkError::ChannelClosed)?
    }

    /// Deliberate teardown; the reconnect supervisor stands down.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { respond_to: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Issue one request and await its typed outcome.
    ///
    /// Suspends the calling task on the request's own completion signal;
    /// resolving any other request never wakes this one.
    pub async fn request(&self, protocol_id: u32, body: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        if self.state.state() != ChannelState::Ready {
            return Err(GatelinkError::Disconnected(format!(
                "{} channel not ready",
                self.kind.as_str()
            )));
        }
        issue_request(&self.pending, &self.writer, protocol_id, body, timeout).await
    }

    /// Register a listener for pushes on `topic` and declare the
    /// subscription to the gateway. The registration survives reconnects:
    /// it is replayed automatically each time the channel re-enters READY.
    pub async fn subscribe(&self, topic: impl Into<String>, push_protocol_id: u32, listener: PushListener) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.into(),
                push_protocol_id,
                listener,
                respond_to: tx,
            })
            .await
            .map_err(|_| GatelinkError::ChannelClosed)?;
        rx.await.map_err(|_| GatelinkError::ChannelClosed)?
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe { topic: topic.into(), respond_to: tx })
            .await
            .map_err(|_| GatelinkError::ChannelClosed)?;
        rx.await.map_err(|_| GatelinkError::ChannelClosed)?
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> ChannelStatus {
        self.state.status()
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Observe state transitions (used by callers that want to await
    /// READY without polling).
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.watch()
    }
}

/// Register in the pending table, write the frame, await resolution.
///
/// Shared by facade requests, the session-init handshake, heartbeats and
/// subscription replay.
async fn issue_request(
    pending: &PendingTable,
    writer: &WriterSlot,
    protocol_id: u32,
    body: Bytes,
    timeout: Duration,
) -> Result<Bytes> {
    let (serial, rx) = pending.register(protocol_id, timeout);
    let wire = frame::encode(protocol_id, serial, &body);

    let write_tx = writer.read().clone();
    let Some(write_tx) = write_tx else {
        pending.cancel(serial);
        return Err(GatelinkError::Disconnected("no live connection".into()));
    };
    if write_tx.send(wire).await.is_err() {
        pending.cancel(serial);
        return Err(GatelinkError::Disconnected("connection lost before write".into()));
    }

    match time::timeout(timeout, rx).await {
        Ok(Ok(Outcome::Payload(payload))) => Ok(payload),
        Ok(Ok(Outcome::Failed(err))) => Err(err),
        // Table dropped the sender without resolving; treat as teardown.
        Ok(Err(_)) => Err(GatelinkError::ChannelClosed),
        Err(_) => {
            // Deadline hit before the sweep got there; resolve it ourselves.
            // If a response raced in, fail() is a no-op and the caller
            // still observes exactly one outcome: this timeout.
            pending.fail(serial, GatelinkError::Timeout(timeout));
            Err(GatelinkError::Timeout(timeout))
        }
    }
}

/// Spawn the supervisor task for one logical channel.
pub fn spawn_channel(
    kind: ChannelKind,
    config: Arc<GatewayConfig>,
    registry: Arc<SubscriptionRegistry>,
) -> ChannelHandle {
    let state = Arc::new(StateCell::new(kind));
    let pending = PendingTable::new();
    let dispatcher = PushDispatcher::new();
    dispatcher.register_handler(
        protocol::PUSH_QUOTE,
        topic_router(Arc::clone(&registry), protocol::PUSH_QUOTE),
    );
    dispatcher.register_handler(
        protocol::PUSH_ORDER,
        topic_router(Arc::clone(&registry), protocol::PUSH_ORDER),
    );

    let writer: WriterSlot = Arc::new(RwLock::new(None));
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let engine = Engine {
        kind,
        config,
        state: Arc::clone(&state),
        pending: Arc::clone(&pending),
        dispatcher,
        registry,
        writer: Arc::clone(&writer),
        conn: None,
        generation: 0,
        last_inbound: Instant::now(),
        user_disconnected: true,
        reconnect_at: None,
        policy: None,
    };
    let default_timeout = engine.config.request_timeout;
    tokio::spawn(engine.run(cmd_rx));

    ChannelHandle { kind, cmd_tx, state, pending, writer, default_timeout }
}

struct Engine {
    kind: ChannelKind,
    config: Arc<GatewayConfig>,
    state: Arc<StateCell>,
    pending: Arc<PendingTable>,
    dispatcher: Arc<PushDispatcher>,
    registry: Arc<SubscriptionRegistry>,
    writer: WriterSlot,
    conn: Option<Conn>,
    /// Bumped for every physical connection so stale transport events
    /// from a replaced socket are ignored.
    generation: u64,
    last_inbound: Instant,
    /// True between disconnect() and the next connect(); the reconnect
    /// supervisor only engages while this is false.
    user_disconnected: bool,
    reconnect_at: Option<Instant>,
    policy: Option<ReconnectPolicy>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(1024);

        let mut heartbeat = time::interval(self.config.heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = time::interval(EXPIRE_SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_due = self.reconnect_at;
            tokio::select! {
                biased;

                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    self.handle_command(cmd, &event_tx).await;
                }

                Some(event) = event_rx.recv() => {
                    self.handle_transport_event(event);
                }

                _ = heartbeat.tick() => {
                    self.heartbeat_tick();
                }

                _ = sweep.tick() => {
                    self.pending.expire();
                }

                _ = async {
                    match reconnect_due {
                        Some(at) => time::sleep_until(at).await,
                        None => futures::future::pending().await,
                    }
                } => {
                    self.reconnect_attempt(&event_tx).await;
                }
            }
        }

        // Facade dropped; tear down quietly.
        self.teardown("client dropped");
    }

    async fn handle_command(&mut self, cmd: Command, event_tx: &mpsc::Sender<TransportEvent>) {
        match cmd {
            Command::Connect { respond_to } => {
                self.user_disconnected = false;
                self.reconnect_at = None;
                self.policy = Some(ReconnectPolicy::new(self.config.reconnect.clone()));
                self.state.set_retry_count(0);
                let result = self.establish(event_tx).await;
                if let Err(ref e) = result {
                    self.state.record_error(e.to_string());
                }
                let _ = respond_to.send(result);
            }
            Command::Disconnect { respond_to } => {
                self.user_disconnected = true;
                self.reconnect_at = None;
                self.teardown("disconnect requested");
                let _ = respond_to.send(());
            }
            Command::Subscribe { topic, push_protocol_id, listener, respond_to } => {
                if topic.len() > usize::from(u16::MAX) {
                    let _ = respond_to.send(Err(GatelinkError::Protocol(format!(
                        "topic of {} bytes exceeds the u16 length prefix",
                        topic.len()
                    ))));
                    return;
                }
                // Protocol ids outside the stock set get a topic route on
                // demand; without one their pushes would never reach the
                // listener.
                self.dispatcher.ensure_handler(push_protocol_id, || {
                    topic_router(Arc::clone(&self.registry), push_protocol_id)
                });
                self.registry.insert(topic.clone(), push_protocol_id, listener);
                if self.state.state() == ChannelState::Ready {
                    self.send_subscribe(&topic, push_protocol_id);
                }
                let _ = respond_to.send(Ok(()));
            }
            Command::Unsubscribe { topic, respond_to } => {
                let push_protocol_id = self.registry.push_protocol_id(&topic);
                let was_registered = self.registry.remove(&topic);
                if was_registered && self.state.state() == ChannelState::Ready {
                    // Best effort: a failure only means a few stray pushes,
                    // which the dispatcher discards anyway.
                    let pending = Arc::clone(&self.pending);
                    let writer = Arc::clone(&self.writer);
                    let timeout = self.config.request_timeout;
                    let push_protocol_id = push_protocol_id.unwrap_or_default();
                    tokio::spawn(async move {
                        let result = match protocol::build_unsubscribe(&topic, push_protocol_id) {
                            Ok(body) => {
                                issue_request(&pending, &writer, protocol::UNSUBSCRIBE, body, timeout).await
                            }
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            debug!(error = %e, "unsubscribe request failed");
                        }
                    });
                }
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Transport connect + session-init handshake + subscription replay.
    async fn establish(&mut self, event_tx: &mpsc::Sender<TransportEvent>) -> Result<()> {
        self.teardown_conn();
        self.state.transition(ChannelState::Connecting);
        self.generation += 1;

        let endpoint = self.config.endpoint(self.kind);
        let conn = match Conn::establish(
            self.kind,
            endpoint,
            self.config.connect_timeout,
            self.config.max_body_len,
            self.generation,
            Arc::clone(&self.pending),
            Arc::clone(&self.dispatcher),
            event_tx.clone(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.state.transition(ChannelState::Disconnected);
                return Err(e);
            }
        };
        *self.writer.write() = Some(conn.write_handle());
        self.conn = Some(conn);
        self.last_inbound = Instant::now();

        // Protocol-level hello before the channel may carry requests.
        let handshake = match protocol::build_session_init(&self.config.client_id) {
            Ok(init_body) => {
                issue_request(
                    &self.pending,
                    &self.writer,
                    protocol::SESSION_INIT,
                    init_body,
                    self.config.connect_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            self.teardown_conn();
            self.state.transition(ChannelState::Disconnected);
            return Err(e);
        }

        self.state.transition(ChannelState::Ready);
        self.state.record_heartbeat();
        if let Some(policy) = self.policy.as_mut() {
            policy.reset();
        }
        self.state.set_retry_count(0);
        info!(channel = self.kind.as_str(), "channel ready");

        self.replay_subscriptions();
        Ok(())
    }

    /// Reissue a subscribe request for every topic still marked active.
    fn replay_subscriptions(&self) {
        for (topic, push_protocol_id) in self.registry.active() {
            info!(channel = self.kind.as_str(), %topic, "replaying subscription");
            self.send_subscribe(&topic, push_protocol_id);
        }
    }

    fn send_subscribe(&self, topic: &str, push_protocol_id: u32) {
        let pending = Arc::clone(&self.pending);
        let writer = Arc::clone(&self.writer);
        let timeout = self.config.request_timeout;
        let topic = topic.to_string();
        tokio::spawn(async move {
            let result = match protocol::build_subscribe(&topic, push_protocol_id) {
                Ok(body) => issue_request(&pending, &writer, protocol::SUBSCRIBE, body, timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => debug!(%topic, "subscribe acknowledged"),
                Err(e) => warn!(%topic, error = %e, "subscribe request failed"),
            }
        });
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Inbound { generation } if generation == self.generation => {
                self.last_inbound = Instant::now();
                self.state.record_heartbeat();
            }
            TransportEvent::Down { generation, reason } if generation == self.generation => {
                self.connection_lost(&reason);
            }
            _ => {} // stale event from a replaced connection
        }
    }

    /// The READY→DISCONNECTED path shared by transport errors and
    /// heartbeat staleness: transition, fail every pending request, then
    /// hand the outage to the reconnect supervisor.
    fn connection_lost(&mut self, reason: &str) {
        if self.state.state() == ChannelState::Disconnected {
            return;
        }
        warn!(channel = self.kind.as_str(), reason, "connection lost");
        self.state.record_error(reason);
        self.teardown_conn();
        self.state.transition(ChannelState::Disconnected);
        self.pending.fail_all(reason);

        if !self.user_disconnected {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(policy) = self.policy.as_mut() else { return };
        match policy.next_delay() {
            Some(delay) => {
                let attempt = policy.attempts();
                self.state.set_retry_count(attempt);
                info!(
                    channel = self.kind.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                let attempts = policy.attempts();
                warn!(channel = self.kind.as_str(), attempts, "reconnect exhausted");
                self.state
                    .record_error(GatelinkError::ReconnectExhausted { attempts }.to_string());
                self.reconnect_at = None;
            }
        }
    }

    async fn reconnect_attempt(&mut self, event_tx: &mpsc::Sender<TransportEvent>) {
        self.reconnect_at = None;
        if self.user_disconnected || self.state.state() == ChannelState::Ready {
            return;
        }
        match self.establish(event_tx).await {
            Ok(()) => {}
            Err(e) => {
                debug!(channel = self.kind.as_str(), error = %e, "reconnect attempt failed");
                self.state.record_error(e.to_string());
                self.schedule_reconnect();
            }
        }
    }

    fn heartbeat_tick(&mut self) {
        if self.state.state() != ChannelState::Ready {
            return;
        }
        if self.last_inbound.elapsed() >= self.config.heartbeat_timeout {
            self.connection_lost("heartbeat timeout: no liveness signal");
            return;
        }
        // Fire-and-forget liveness request; its response (like any other
        // inbound frame) refreshes last_inbound via the read loop.
        let pending = Arc::clone(&self.pending);
        let writer = Arc::clone(&self.writer);
        let timeout = self.config.heartbeat_period;
        tokio::spawn(async move {
            if let Err(e) =
                issue_request(&pending, &writer, protocol::HEARTBEAT, protocol::build_heartbeat(), timeout)
                    .await
            {
                debug!(error = %e, "heartbeat request unanswered");
            }
        });
    }

    fn teardown_conn(&mut self) {
        *self.writer.write() = None;
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    fn teardown(&mut self, reason: &str) {
        self.teardown_conn();
        self.state.transition(ChannelState::Disconnected);
        self.pending.fail_all(reason);
    }
}
