//! The realtime engine.
//!
//! One spawned task owns all session state and multiplexes three inputs in
//! a single `select!`: commands from [`EngineHandle`]s, signals from the
//! current bridge and the [`TimerRegistry`]. Nothing runs in parallel; the
//! only suspension points are the bridge, resolver and collaborator calls,
//! and the timers. The overlap guards (reconnect in flight, probe in
//! flight) are plain fields of that task.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Syncing -> Ready
//!      ^              |              |            |         |
//!      +--------------+--------------+------------+---------+  failure: backoff
//!
//! any state --auth failure--> LoggedOut (terminal, `not_logged_in`)
//! ```

use bytes::{Bytes, BytesMut};
use futures::Stream;
use msgr_delta::{route, Decoder, Event, FrameKind, SyncCursor};
use msgr_health::{HealthMonitor, HealthSnapshot, ProbeKind, ReconnectReason, RecycleDecision, RiskTier, Watchdog, WatchdogAction};
use msgr_wire::{foreground_state, ls_request, topics, LsTask, Packet, PacketDecoder, Publish};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeSignal, BridgeStream, Connector};
use crate::config::EngineConfig;
use crate::context::SessionContext;
use crate::handshake::{subscribe_packets, sync_packets, Handshake};
use crate::reconnect::{classify, ConnectionState, ErrorClass, Reconnector};
use crate::services::SessionServices;
use crate::tasks::{TaskError, TaskRegistry, TaskResponse, TaskType};
use crate::timers::{TimerKind, TimerRegistry};
use crate::{EngineError, ServiceError};

enum Command {
    Request {
        task_type: TaskType,
        payload: Value,
        queue_name: String,
        reply: oneshot::Sender<Result<TaskResponse, TaskError>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetRiskTier(RiskTier),
    NoteMaintenance,
}

/// Consumer side of the engine's events; ends when the engine stops
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<Event>,
}

impl EventStream {
    /// Next event, `None` once the engine stopped
    pub async fn next_event(&mut self) -> Option<Event> {
        tokio_stream::StreamExt::next(&mut self.inner).await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Control surface of a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    health: Arc<HealthMonitor>,
    cursor: watch::Receiver<SyncCursor>,
    request_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<SessionContext>>>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Request { task_type, .. } => write!(f, "Request({:?})", task_type),
            Command::Publish { topic, .. } => write!(f, "Publish({})", topic),
            Command::SetRiskTier(tier) => write!(f, "SetRiskTier({})", tier),
            Command::NoteMaintenance => f.write_str("NoteMaintenance"),
        }
    }
}

impl EngineHandle {
    /// Publish a task on `/ls_req` and wait for its correlated reply
    pub async fn request(
        &self,
        task_type: TaskType,
        payload: Value,
        queue_name: impl Into<String>,
    ) -> Result<TaskResponse, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                task_type,
                payload,
                queue_name: queue_name.into(),
                reply,
            })
            .map_err(|_| TaskError::Closed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Closed),
            Err(_) => Err(TaskError::Timeout),
        }
    }

    /// Publish a JSON body on `topic` (QoS 1)
    pub async fn publish(&self, topic: &str, body: &Value) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                payload: serde_json::to_vec(body)?,
                reply,
            })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Record the start of an outbound send for ack latency tracking
    pub fn record_send(&self, key: impl Into<String>) {
        self.health.acks().record_send(key);
    }

    /// Queue depths reported by the sending collaborator
    pub fn set_queue_depths(&self, pending_edits: u64, outbound_queue: u64) {
        self.health.set_queue_depths(pending_edits, outbound_queue);
    }

    /// Switch risk tier; cadences and backoff follow
    pub fn set_risk_tier(&self, tier: RiskTier) -> Result<(), EngineError> {
        self.commands
            .send(Command::SetRiskTier(tier))
            .map_err(|_| EngineError::Stopped)
    }

    /// Report a maintenance action done outside the engine (e.g. a session
    /// refresh); a recycle due shortly after is deferred
    pub fn note_maintenance(&self) -> Result<(), EngineError> {
        self.commands
            .send(Command::NoteMaintenance)
            .map_err(|_| EngineError::Stopped)
    }

    /// Health snapshot
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Current sync cursor
    pub fn cursor(&self) -> SyncCursor {
        self.cursor.borrow().clone()
    }

    /// Stop the engine and return the session context with its updated
    /// cursor. Clears every timer, closes the transport and fails pending
    /// requests; the event stream ends. Completes even when the event
    /// stream is held but no longer read.
    pub async fn stop(&self) -> Result<SessionContext, EngineError> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().await.take().ok_or(EngineError::Stopped)?;
        task.await.map_err(|_| EngineError::Stopped)
    }
}

/// Entry point of the realtime engine
pub struct Engine;

impl Engine {
    /// Spawn an engine for `context` and start connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        context: SessionContext,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        services: Arc<dyn SessionServices>,
    ) -> (EngineHandle, EventStream) {
        let tier = context.risk_tier;
        let thresholds = config.watchdog_for(tier);
        let health = Arc::new(HealthMonitor::new(tier, thresholds.soft_stale));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (cursor_tx, cursor_rx) = watch::channel(context.cursor.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let request_timeout = config.request_timeout();

        let session = Session {
            decoder: Decoder::new(context.user_id.clone(), config.decode_options(), services.resolver()),
            handshake: Handshake::new(),
            reconnector: Reconnector::new(config.backoff_for(tier)),
            watchdog: Watchdog::new(thresholds),
            packets: PacketDecoder::with_max_packet_size(config.max_packet_size),
            health: health.clone(),
            tasks: TaskRegistry::new(),
            timers: TimerRegistry::new(),
            bridge: None,
            inbound: BytesMut::new(),
            ids: PacketIds::default(),
            probe: None,
            last_maintenance: None,
            commands: command_rx,
            shutdown: shutdown_rx,
            events: event_tx,
            cursor: cursor_tx,
            ctx: context,
            config,
            connector,
            services,
        };
        let task = tokio::spawn(session.run());

        let handle = EngineHandle {
            commands: command_tx,
            shutdown: Arc::new(shutdown_tx),
            health,
            cursor: cursor_rx,
            request_timeout,
            task: Arc::new(Mutex::new(Some(task))),
        };
        (
            handle,
            EventStream {
                inner: ReceiverStream::new(event_rx),
            },
        )
    }
}

/// MQTT packet identifiers; never zero
#[derive(Debug, Default)]
struct PacketIds(u16);

impl PacketIds {
    fn next(&mut self) -> u16 {
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Input {
    Shutdown,
    Command(Option<Command>),
    Signal(Option<BridgeSignal>),
    Timer(TimerKind),
}

struct Session {
    ctx: SessionContext,
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    services: Arc<dyn SessionServices>,
    decoder: Decoder,
    handshake: Handshake,
    reconnector: Reconnector,
    watchdog: Watchdog,
    health: Arc<HealthMonitor>,
    tasks: TaskRegistry,
    timers: TimerRegistry,
    bridge: Option<BridgeStream>,
    inbound: BytesMut,
    packets: PacketDecoder,
    ids: PacketIds,
    probe: Option<ProbeKind>,
    last_maintenance: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<Event>,
    cursor: watch::Sender<SyncCursor>,
}

async fn next_signal(bridge: &mut Option<BridgeStream>) -> Option<BridgeSignal> {
    match bridge {
        Some(bridge) => bridge.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self) -> SessionContext {
        info!("Realtime engine starting for user {}", self.ctx.user_id);
        let thresholds = self.watchdog.thresholds().clone();
        self.timers.arm(TimerKind::WatchdogTick, thresholds.check_interval);
        self.timers.arm(TimerKind::Recycle, thresholds.next_recycle());
        self.connect();

        loop {
            let input = tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => Input::Shutdown,
                command = self.commands.recv() => Input::Command(command),
                signal = next_signal(&mut self.bridge) => Input::Signal(signal),
                kind = self.timers.expired() => Input::Timer(kind),
            };
            let flow = match input {
                Input::Shutdown => {
                    info!("Stop requested");
                    Flow::Stop
                }
                Input::Command(Some(command)) => self.on_command(command).await,
                Input::Command(None) => Flow::Stop,
                Input::Signal(Some(signal)) => self.on_signal(signal).await,
                Input::Signal(None) => self.on_failure("bridge ended".to_string()).await,
                Input::Timer(kind) => self.on_timer(kind).await,
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.teardown("engine stopped");
        self.timers.clear();
        info!("Realtime engine stopped for user {}", self.ctx.user_id);
        self.ctx
    }

    fn state(&self) -> ConnectionState {
        self.reconnector.state()
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.reconnector.transition(state);
        let state = self.reconnector.state();
        self.health.on_state(state.as_str(), state.is_connected());
    }

    fn connect(&mut self) {
        self.reconnector.begin_attempt();
        self.set_state(ConnectionState::Connecting);
        self.inbound.clear();
        self.packets = PacketDecoder::with_max_packet_size(self.config.max_packet_size);
        self.probe = None;

        let request = self.handshake.open_request(&self.ctx, &self.config);
        info!("Connecting to {}", request.url);
        self.bridge = Some(self.connector.open(&request));
        self.timers.arm(TimerKind::ConnectDeadline, self.config.connect_timeout());
    }

    /// Drop the transport and everything tied to it
    fn teardown(&mut self, reason: &'static str) {
        if let Some(bridge) = self.bridge.take() {
            bridge.close();
        }
        for kind in [
            TimerKind::KeepAlive,
            TimerKind::Heartbeat,
            TimerKind::ProbeDeadline,
            TimerKind::SyncGrace,
            TimerKind::ConnectDeadline,
        ] {
            self.timers.cancel(kind);
        }
        self.probe = None;
        self.tasks.drop_all(reason);
        if self.state() != ConnectionState::LoggedOut {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), EngineError> {
        let bridge = self.bridge.as_ref().ok_or(EngineError::NotConnected)?;
        let bytes = packet.encode(self.config.max_packet_size)?;
        bridge.write(bytes).map_err(|_| EngineError::NotConnected)
    }

    fn publish(&mut self, topic: &str, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        if !self.state().is_connected() {
            return Err(EngineError::NotConnected);
        }
        let packet = Packet::Publish(Publish::at_least_once(topic, self.ids.next(), payload));
        self.send(&packet)
    }

    /// Deliver an event; a full channel blocks the loop until the consumer
    /// reads or a stop is requested
    async fn emit(&mut self, event: Event) -> Flow {
        tokio::select! {
            sent = self.events.send(event) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => {
                    info!("Event consumer gone; stopping");
                    Flow::Stop
                }
            },
            _ = self.shutdown.wait_for(|stop| *stop) => {
                info!("Stop requested while the event channel was full");
                Flow::Stop
            }
        }
    }

    fn publish_cursor(&self) {
        self.cursor.send_replace(self.ctx.cursor.clone());
    }

    fn note_maintenance(&mut self) {
        self.last_maintenance = Some(Instant::now());
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Request {
                task_type,
                payload,
                queue_name,
                reply,
            } => {
                if self.state() != ConnectionState::Ready {
                    let _ = reply.send(Err(TaskError::Publish("not connected".to_string())));
                    return Flow::Continue;
                }
                let (request_id, task_id) = self.tasks.next_ids();
                let task = LsTask {
                    label: task_type.label().to_string(),
                    payload,
                    queue_name,
                };
                let body = match ls_request(request_id, task_id, &task) {
                    Ok(body) => body,
                    Err(e) => {
                        let _ = reply.send(Err(TaskError::Publish(e.to_string())));
                        return Flow::Continue;
                    }
                };
                // Replies are handled on this task, so registering after the
                // publish cannot miss one
                match self.publish(topics::LS_REQ, body) {
                    Ok(()) => {
                        debug!("Request {} published with task {}", request_id, task.label);
                        self.tasks.register(request_id, task_type, reply);
                    }
                    Err(e) => {
                        warn!("Request {} not sent: {}", request_id, e);
                        let _ = reply.send(Err(TaskError::Publish(e.to_string())));
                    }
                }
            }
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                let _ = reply.send(self.publish(&topic, payload));
            }
            Command::SetRiskTier(tier) => self.apply_risk_tier(tier),
            Command::NoteMaintenance => self.note_maintenance(),
        }
        Flow::Continue
    }

    fn apply_risk_tier(&mut self, tier: RiskTier) {
        if tier == self.ctx.risk_tier {
            return;
        }
        info!("Risk tier {} -> {}", self.ctx.risk_tier, tier);
        self.ctx.risk_tier = tier;
        let thresholds = self.config.watchdog_for(tier);
        self.health.set_risk_tier(tier, thresholds.soft_stale);
        self.reconnector.set_policy(self.config.backoff_for(tier));
        if self.timers.is_armed(TimerKind::Heartbeat) {
            self.timers.arm(TimerKind::Heartbeat, thresholds.next_heartbeat());
        }
        self.timers.arm(TimerKind::WatchdogTick, thresholds.check_interval);
        self.watchdog.set_thresholds(thresholds);
    }

    async fn on_signal(&mut self, signal: BridgeSignal) -> Flow {
        match signal {
            BridgeSignal::Connected => {
                self.set_state(ConnectionState::Handshaking);
                let connect = self.handshake.connect_packet(&self.ctx, &self.config);
                match connect.map_err(EngineError::from).and_then(|p| self.send(&p)) {
                    Ok(()) => Flow::Continue,
                    Err(e) => self.on_failure(format!("connect failed: {}", e)).await,
                }
            }
            BridgeSignal::Data(data) => self.on_data(data).await,
            BridgeSignal::Error(e) => self.on_failure(e.to_string()).await,
            BridgeSignal::Closed(reason) => self.on_failure(format!("closed: {}", reason)).await,
        }
    }

    async fn on_data(&mut self, data: Bytes) -> Flow {
        // Any inbound frame proves liveness
        self.health.on_frame();
        if let Some(kind) = self.probe.take() {
            debug!("{} probe answered", kind.as_str());
            self.timers.cancel(TimerKind::ProbeDeadline);
        }

        self.inbound.extend_from_slice(&data);
        loop {
            let packet = match self.packets.decode(&mut self.inbound) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping undecodable frame data: {}", e);
                    self.health.on_error("message_parse");
                    self.inbound.clear();
                    break;
                }
            };
            if self.on_packet(packet).await == Flow::Stop {
                return Flow::Stop;
            }
            // A failure inside the packet handler replaced the transport
            if self.bridge.is_none() {
                break;
            }
        }
        Flow::Continue
    }

    async fn on_packet(&mut self, packet: Packet) -> Flow {
        match packet {
            Packet::ConnAck(ack) => {
                if self.state() != ConnectionState::Handshaking {
                    return Flow::Continue;
                }
                if let Some(reason) = ack.refusal_reason() {
                    // Bad credentials and not authorized end the session
                    let reason = if matches!(ack.code, 4 | 5) {
                        format!("not logged in: {}", reason)
                    } else {
                        reason.to_string()
                    };
                    return self.on_failure(reason).await;
                }
                self.timers.cancel(TimerKind::ConnectDeadline);
                self.subscribe_and_sync().await
            }
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PingResp => {
                debug!("PINGRESP");
                Flow::Continue
            }
            Packet::SubAck(ack) => {
                if ack.return_codes.contains(&0x80) {
                    warn!("Subscription {} refused", ack.packet_id);
                }
                Flow::Continue
            }
            Packet::PubAck { packet_id } | Packet::UnsubAck { packet_id } => {
                debug!("Ack for packet {}", packet_id);
                Flow::Continue
            }
            Packet::Disconnect => self.on_failure("server sent DISCONNECT".to_string()).await,
            other => {
                debug!("Ignoring {:?} packet", other.packet_type());
                Flow::Continue
            }
        }
    }

    async fn subscribe_and_sync(&mut self) -> Flow {
        let mut packets = subscribe_packets(|| self.ids.next());
        match sync_packets(&self.ctx, &self.config, || self.ids.next()) {
            Ok(sync) => packets.extend(sync),
            Err(e) => return self.on_failure(format!("sync request failed: {}", e)).await,
        }
        for packet in &packets {
            if let Err(e) = self.send(packet) {
                return self.on_failure(format!("handshake write failed: {}", e)).await;
            }
        }
        debug!(
            "Subscribed to {} topics, initial sync published",
            topics::SUBSCRIBE_TOPICS.len()
        );
        self.set_state(ConnectionState::Syncing);
        self.timers.arm(TimerKind::SyncGrace, self.config.sync_grace());
        self.timers.arm(TimerKind::KeepAlive, self.config.keepalive());
        self.timers
            .arm(TimerKind::Heartbeat, self.watchdog.thresholds().next_heartbeat());
        Flow::Continue
    }

    async fn on_ready(&mut self) -> Flow {
        self.timers.cancel(TimerKind::SyncGrace);
        self.reconnector.on_ready();
        self.set_state(ConnectionState::Ready);
        self.health.on_ready();
        info!("Realtime session ready");
        if self.config.emit_ready {
            return self.emit(Event::Ready).await;
        }
        Flow::Continue
    }

    async fn on_publish(&mut self, publish: Publish) -> Flow {
        if let Some(packet_id) = publish.packet_id {
            let _ = self.send(&Packet::PubAck { packet_id });
        }

        let kind = route(&publish.topic);
        if kind == FrameKind::TaskReply {
            self.tasks.resolve(&publish.payload);
            return Flow::Continue;
        }
        if kind == FrameKind::SyncDeltas {
            if let Some(code) = sync_error(&publish.payload) {
                warn!("Sync queue error {}; restarting from a fresh queue", code);
                self.ctx.cursor.sync_token = None;
                self.publish_cursor();
                return self.on_failure(format!("sync error {}", code)).await;
            }
            if self.state() == ConnectionState::Syncing && self.on_ready().await == Flow::Stop {
                return Flow::Stop;
            }
        }
        if kind == FrameKind::Other {
            debug!("Unhandled publish on {}", publish.topic);
            return Flow::Continue;
        }

        let decoded = match self
            .decoder
            .decode(kind, &publish.payload, &mut self.ctx.cursor)
            .await
        {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping publish on {}: {}", publish.topic, e);
                self.health.on_error("message_parse");
                return Flow::Continue;
            }
        };

        if decoded.skipped > 0 {
            self.health.on_error("message_parse");
        }
        if decoded.cursor_changed {
            self.publish_cursor();
        }
        for key in &decoded.acks {
            self.health.acks().record_ack(key);
        }
        self.health.on_events(decoded.events.len());
        for event in decoded.events {
            if self.emit(Event::from(event)).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn on_timer(&mut self, kind: TimerKind) -> Flow {
        debug!("Timer {} fired", kind.as_str());
        match kind {
            TimerKind::KeepAlive => {
                if self.state().is_connected() {
                    let _ = self.send(&Packet::PingReq);
                    self.timers.arm(TimerKind::KeepAlive, self.config.keepalive());
                }
            }
            TimerKind::Heartbeat => {
                if self.state().is_connected() {
                    debug!("Heartbeat");
                    let _ = self.send(&Packet::PingReq);
                    let foreground = self.config.foreground.unwrap_or(self.ctx.foreground);
                    if let Ok(body) = serde_json::to_vec(&foreground_state(foreground)) {
                        let _ = self.publish(topics::FOREGROUND_STATE, body);
                    }
                    self.timers
                        .arm(TimerKind::Heartbeat, self.watchdog.thresholds().next_heartbeat());
                }
            }
            TimerKind::WatchdogTick => {
                self.timers
                    .arm(TimerKind::WatchdogTick, self.watchdog.thresholds().check_interval);
                self.tasks.purge_expired(self.config.request_timeout());
                self.health.acks().purge_stale();
                return self.watchdog_check().await;
            }
            TimerKind::ProbeDeadline => {
                if let Some(kind) = self.probe.take() {
                    let reason = self.watchdog.probe_expired(kind);
                    warn!("{} probe unanswered", kind.as_str());
                    self.force_reconnect(reason);
                }
            }
            TimerKind::Recycle => self.on_recycle(),
            TimerKind::Reconnect => return self.reconnect_attempt().await,
            TimerKind::SyncGrace => {
                if self.state() == ConnectionState::Syncing {
                    return self.on_failure("no sync reply within grace window".to_string()).await;
                }
            }
            TimerKind::ConnectDeadline => {
                if matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Handshaking
                ) {
                    return self.on_failure("connect timed out".to_string()).await;
                }
            }
        }
        Flow::Continue
    }

    async fn watchdog_check(&mut self) -> Flow {
        let action = self.watchdog.check(
            self.health.idle(),
            self.state().is_connected(),
            self.probe.is_some(),
            self.reconnector.in_flight(),
        );
        match action {
            WatchdogAction::None => {}
            WatchdogAction::Probe(kind) => {
                let wait = self.watchdog.thresholds().next_probe_wait();
                info!("Idle for {:?}; sending {} probe", self.health.idle(), kind.as_str());
                self.probe = Some(kind);
                self.timers.arm(TimerKind::ProbeDeadline, wait);
                if self.send(&Packet::PingReq).is_err() {
                    self.probe = None;
                    self.timers.cancel(TimerKind::ProbeDeadline);
                    self.force_reconnect(self.watchdog.probe_expired(kind));
                }
            }
            WatchdogAction::Reconnect(reason) => self.force_reconnect(reason),
        }
        Flow::Continue
    }

    fn on_recycle(&mut self) {
        let since = self.last_maintenance.map(|at| at.elapsed());
        match self.watchdog.recycle(since) {
            RecycleDecision::Defer(delay) => {
                self.timers.arm(TimerKind::Recycle, delay);
            }
            RecycleDecision::Proceed => {
                if self.state() == ConnectionState::Ready {
                    info!("Periodic recycle");
                    self.force_reconnect(ReconnectReason::Recycle);
                }
                self.timers
                    .arm(TimerKind::Recycle, self.watchdog.thresholds().next_recycle());
            }
        }
    }

    /// Watchdog driven reconnect
    fn force_reconnect(&mut self, reason: ReconnectReason) {
        if self.reconnector.in_flight() || self.state() == ConnectionState::LoggedOut {
            return;
        }
        warn!("Forcing reconnect: {}", reason.as_str());
        self.health.on_error(reason.as_str());
        if reason != ReconnectReason::Recycle {
            self.health.on_failure();
        }
        if matches!(
            reason,
            ReconnectReason::Recycle | ReconnectReason::Ghost | ReconnectReason::HardIdle
        ) {
            self.note_maintenance();
        }
        self.teardown("reconnecting");
        self.schedule_reconnect(reason.resets_backoff());
    }

    fn schedule_reconnect(&mut self, reset_backoff: bool) {
        if let Some(delay) = self.reconnector.schedule(reset_backoff) {
            warn!("Reconnecting in {:?}", delay);
            self.health.on_reconnect_scheduled(delay);
            self.timers.arm(TimerKind::Reconnect, delay);
        }
    }

    async fn reconnect_attempt(&mut self) -> Flow {
        match self.services.refresh_sequence_id(&self.ctx).await {
            Ok(Some(seq)) => {
                debug!("Sequence id refreshed to {}", seq);
                self.ctx.cursor.last_seq_id = seq;
                self.ctx.cursor.sync_token = None;
                self.publish_cursor();
                self.note_maintenance();
            }
            Ok(None) => {}
            Err(ServiceError::NotLoggedIn(reason)) => {
                return self.logout(format!("not logged in: {}", reason)).await;
            }
            Err(e) => warn!("Sequence id refresh failed: {}", e),
        }
        self.connect();
        Flow::Continue
    }

    /// A connection attempt failed or a live connection dropped
    async fn on_failure(&mut self, reason: String) -> Flow {
        if self.state() == ConnectionState::LoggedOut {
            return Flow::Stop;
        }
        warn!("Connection lost: {}", reason);
        match classify(&reason) {
            ErrorClass::Authentication => return self.logout(reason).await,
            ErrorClass::Decode => self.health.on_error("message_parse"),
            ErrorClass::Transient => self.health.on_error("transport"),
        }
        self.teardown("disconnected");
        self.health.on_failure();
        self.reconnector.attempt_finished();

        if !self.ctx.auto_reconnect {
            return self.exhausted(reason).await;
        }
        self.schedule_reconnect(false);
        Flow::Continue
    }

    async fn logout(&mut self, reason: String) -> Flow {
        error!("Session is no longer authenticated: {}", reason);
        self.teardown("logged out");
        self.timers.clear();
        self.reconnector.logged_out();
        self.health.on_state(ConnectionState::LoggedOut.as_str(), false);
        self.emit(Event::NotLoggedIn { error: reason }).await;
        Flow::Stop
    }

    /// Reconnection disabled and the connection is gone
    async fn exhausted(&mut self, reason: String) -> Flow {
        self.timers.clear();
        let event = match self.services.check_account_alive(&self.ctx).await {
            Ok(false) => Event::AccountInactive {
                error: format!("account may be blocked: {}", reason),
            },
            Err(ServiceError::NotLoggedIn(e)) => {
                return self.logout(format!("not logged in: {}", e)).await;
            }
            Ok(true) | Err(_) => Event::StopListen {
                error: format!("service unavailable: {}", reason),
            },
        };
        warn!("Listening stopped: {:?}", event.kind());
        self.emit(event).await;
        Flow::Stop
    }
}

/// `errorCode` of a sync envelope, if any
fn sync_error(payload: &[u8]) -> Option<String> {
    if !payload.windows(9).any(|w| w == b"errorCode") {
        return None;
    }
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("errorCode")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryListener, MemoryPeer};
    use crate::services::NoServices;
    use async_trait::async_trait;
    use msgr_health::{BackoffPolicy, WatchdogThresholds};
    use msgr_wire::ConnAck;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn config() -> EngineConfig {
        EngineConfig {
            emit_ready: true,
            ..EngineConfig::default()
        }
    }

    fn context() -> SessionContext {
        SessionContext::new("1000", vec![crate::Cookie::new("c_user", "1000")])
    }

    fn start(ctx: SessionContext, config: EngineConfig) -> (EngineHandle, EventStream, MemoryListener) {
        start_with(ctx, config, Arc::new(NoServices))
    }

    fn start_with(
        ctx: SessionContext,
        config: EngineConfig,
        services: Arc<dyn SessionServices>,
    ) -> (EngineHandle, EventStream, MemoryListener) {
        let (connector, listener) = MemoryConnector::new();
        let (handle, events) = Engine::start(ctx, config, Arc::new(connector), services);
        (handle, events, listener)
    }

    /// Next packet that is not a keepalive ping
    async fn next_packet(peer: &mut MemoryPeer) -> Packet {
        loop {
            match peer.recv_packet().await {
                Some(Packet::PingReq) => continue,
                Some(packet) => return packet,
                None => panic!("engine closed the bridge"),
            }
        }
    }

    /// Accept, answer CONNECT, drain subscribes; returns the sync publishes
    async fn handshake(peer: &mut MemoryPeer) -> Vec<Publish> {
        peer.accept().await;
        assert!(matches!(next_packet(peer).await, Packet::Connect(_)));
        peer.send_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            code: 0,
        }))
        .await
        .unwrap();

        let mut subscribes = 0;
        let mut publishes = Vec::new();
        while publishes.len() < 3 {
            match next_packet(peer).await {
                Packet::Subscribe(_) => subscribes += 1,
                Packet::Publish(p) => publishes.push(p),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(subscribes, topics::SUBSCRIBE_TOPICS.len());
        publishes
    }

    async fn deltas(peer: &MemoryPeer, body: Value) {
        peer.send_packet(&Packet::Publish(Publish::at_most_once(
            topics::SYNC_DELTAS,
            serde_json::to_vec(&body).unwrap(),
        )))
        .await
        .unwrap();
    }

    async fn ready(peer: &mut MemoryPeer, events: &mut EventStream) -> Vec<Publish> {
        let publishes = handshake(peer).await;
        deltas(peer, json!({ "lastIssuedSeqId": 10 })).await;
        assert!(matches!(events.next_event().await, Some(Event::Ready)));
        publishes
    }

    fn message_delta(sender: &str, mid: &str) -> Value {
        json!({
            "class": "NewMessage",
            "body": "hello",
            "messageMetadata": {
                "threadKey": { "otherUserFbId": sender },
                "messageId": mid,
                "actorFbId": sender,
                "timestamp": "1700000000000",
                "offlineThreadingId": format!("otid-{}", mid)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_session_creates_queue() {
        let mut ctx = context();
        ctx.cursor.last_seq_id = 321;
        let (handle, mut events, mut listener) = start(ctx, config());
        let mut peer = listener.accept().await.unwrap();

        let publishes = ready(&mut peer, &mut events).await;
        assert_eq!(publishes[0].topic, topics::SYNC_CREATE_QUEUE);
        let body: Value = serde_json::from_slice(&publishes[0].payload).unwrap();
        assert_eq!(body["initial_titan_sequence_id"], 321);
        assert_eq!(handle.health().state, "ready");

        let ctx = handle.stop().await.unwrap();
        assert_eq!(ctx.cursor.last_seq_id, 10);
        assert!(events.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_session_gets_diffs() {
        let mut ctx = context();
        ctx.cursor.last_seq_id = 321;
        ctx.cursor.sync_token = Some("tok".to_string());
        let (_handle, _events, mut listener) = start(ctx, config());
        let mut peer = listener.accept().await.unwrap();

        let publishes = handshake(&mut peer).await;
        assert_eq!(publishes[0].topic, topics::SYNC_GET_DIFFS);
        let body: Value = serde_json::from_slice(&publishes[0].payload).unwrap();
        assert_eq!(body["sync_token"], "tok");
        assert_eq!(body["last_seq_id"], 321);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_and_receipt_emitted_in_order() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let receipt = json!({
            "class": "ReadReceipt",
            "threadKey": { "otherUserFbId": "2000" },
            "actorFbId": "2000",
            "actionTimestampMs": "1700000000500"
        });
        deltas(
            &peer,
            json!({ "deltas": [message_delta("2000", "mid.1"), receipt] }),
        )
        .await;

        assert!(matches!(events.next_event().await, Some(Event::Message(m)) if m.message_id == "mid.1"));
        assert!(matches!(events.next_event().await, Some(Event::ReadReceipt(_))));
        assert_eq!(handle.health().messages, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_keeps_connection() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        peer.send_packet(&Packet::Publish(Publish::at_most_once(
            topics::SYNC_DELTAS,
            &b"{not json"[..],
        )))
        .await
        .unwrap();
        deltas(&peer, json!({ "deltas": [message_delta("2000", "mid.2")] })).await;

        assert!(matches!(events.next_event().await, Some(Event::Message(_))));
        let health = handle.health();
        assert_eq!(health.last_error.as_deref(), Some("message_parse"));
        assert_eq!(health.state, "ready");
        assert_eq!(health.reconnect_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_completes_ack() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        handle.record_send("otid-mid.own");
        tokio::time::advance(Duration::from_millis(120)).await;
        deltas(&peer, json!({ "deltas": [message_delta("1000", "mid.own")] })).await;
        deltas(&peer, json!({ "deltas": [message_delta("2000", "mid.3")] })).await;

        // The own echo is filtered; the next event is the other user's message
        assert!(matches!(events.next_event().await, Some(Event::Message(m)) if m.message_id == "mid.3"));
        let acks = handle.health().acks;
        assert_eq!(acks.last_ack_latency_ms, Some(120));
        assert_eq!(acks.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaction_request_correlates() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let requester = handle.clone();
        let request = tokio::spawn(async move {
            requester
                .request(TaskType::SetReaction, json!({ "reaction": "+1" }), "2000")
                .await
        });

        let request_id = loop {
            if let Packet::Publish(p) = next_packet(&mut peer).await {
                if p.topic == topics::LS_REQ {
                    let body: Value = serde_json::from_slice(&p.payload).unwrap();
                    assert_eq!(body["type"], 3);
                    break body["request_id"].as_u64().unwrap();
                }
            }
        };

        // Unknown request ids are ignored
        let stray = json!({ "request_id": request_id + 100, "payload": "{\"step\":[]}" });
        peer.send_packet(&Packet::Publish(Publish::at_most_once(
            topics::LS_RESP,
            serde_json::to_vec(&stray).unwrap(),
        )))
        .await
        .unwrap();

        let step = json!([1, [0, 0, [0, 0, [0, [5, "x", "t", "y", "mid.$r"]]]]]);
        let reply = json!({ "request_id": request_id, "payload": json!({ "step": step }).to_string() });
        peer.send_packet(&Packet::Publish(Publish::at_most_once(
            topics::LS_RESP,
            serde_json::to_vec(&reply).unwrap(),
        )))
        .await
        .unwrap();

        assert_eq!(
            request.await.unwrap().unwrap(),
            TaskResponse::Reaction {
                message_id: "mid.$r".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_requests_dropped_on_disconnect() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let requester = handle.clone();
        let request = tokio::spawn(async move {
            requester
                .request(TaskType::SendMessage, json!({ "text": "hi" }), "2000")
                .await
        });
        loop {
            if let Packet::Publish(p) = next_packet(&mut peer).await {
                if p.topic == topics::LS_REQ {
                    break;
                }
            }
        }
        peer.close("reset").await;

        assert!(matches!(request.await.unwrap(), Err(TaskError::Dropped(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_logged_in_is_terminal() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        peer.fail("Not logged in").await;

        match events.next_event().await {
            Some(Event::NotLoggedIn { error }) => assert!(error.contains("Not logged in")),
            other => panic!("expected not_logged_in, got {:?}", other),
        }
        assert!(events.next_event().await.is_none());
        assert!(listener.try_accept().is_none());
        assert_eq!(handle.health().state, "logged_out");
        assert!(handle.stop().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_reset_on_ready() {
        let config = EngineConfig {
            backoff: Some(BackoffPolicy {
                jitter: 0.0,
                ..BackoffPolicy::default()
            }),
            ..config()
        };
        let (handle, mut events, mut listener) = start(context(), config);

        let mut expected = [1_000u64, 2_000, 4_000].into_iter();
        let mut peer = listener.accept().await.unwrap();
        for delay in expected.by_ref() {
            peer.fail("connection reset").await;
            let before = Instant::now();
            peer = listener.accept().await.unwrap();
            let waited = before.elapsed().as_millis() as u64;
            assert!((delay..delay + 5).contains(&waited), "waited {}ms", waited);
            assert_eq!(handle.health().backoff_ms, delay);
        }

        ready(&mut peer, &mut events).await;
        let health = handle.health();
        assert_eq!(health.backoff_ms, 0);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.max_backoff_ms, 4_000);

        peer.close("bye").await;
        let before = Instant::now();
        let _peer = listener.accept().await.unwrap();
        let waited = before.elapsed().as_millis() as u64;
        assert!((1_000..1_005).contains(&waited), "waited {}ms", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sync_reply_reconnects() {
        let (handle, _events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        handshake(&mut peer).await;

        let _next = listener.accept().await.unwrap();
        let health = handle.health();
        assert_eq!(health.reconnect_count, 1);
        assert!(!peer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_stale_probe_reconnects_once() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let started = Instant::now();
        let _next = listener.accept().await.unwrap();
        let elapsed = started.elapsed();
        // 150s soft-stale, checked every 15s, plus a 6-8s probe window and
        // about one second of backoff from its base
        assert!(elapsed >= Duration::from_secs(150));
        assert!(elapsed <= Duration::from_secs(150 + 15 + 8 + 2));

        let health = handle.health();
        assert_eq!(health.reconnect_count, 1);
        assert_eq!(health.last_error.as_deref(), Some("soft_stale"));
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probe_keeps_connection() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        // Answer every ping from the engine for a while
        let deadline = Instant::now() + Duration::from_secs(600);
        while Instant::now() < deadline {
            match peer.recv_packet().await {
                Some(Packet::PingReq) => peer.send_packet(&Packet::PingResp).await.unwrap(),
                Some(_) => {}
                None => panic!("connection dropped"),
            }
        }
        assert_eq!(handle.health().reconnect_count, 0);
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ghost_connection_forces_reconnect() {
        let thresholds = WatchdogThresholds {
            soft_stale: Duration::from_secs(3_600),
            ..WatchdogThresholds::for_tier(RiskTier::Medium)
        };
        let config = EngineConfig {
            watchdog: Some(thresholds),
            ..config()
        };
        let (handle, mut events, mut listener) = start(context(), config);
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let started = Instant::now();
        let _next = listener.accept().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(9 * 60));
        assert!(started.elapsed() < Duration::from_secs(12 * 60));
        assert_eq!(handle.health().last_error.as_deref(), Some("ghost_connection"));
    }

    struct Probe {
        alive: bool,
        asked: AtomicBool,
    }

    #[async_trait]
    impl SessionServices for Probe {
        async fn check_account_alive(&self, _ctx: &SessionContext) -> Result<bool, ServiceError> {
            self.asked.store(true, Ordering::SeqCst);
            Ok(self.alive)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_blocked_account() {
        let mut ctx = context();
        ctx.auto_reconnect = false;
        let services = Arc::new(Probe {
            alive: false,
            asked: AtomicBool::new(false),
        });
        let (_handle, mut events, mut listener) = start_with(ctx, config(), services.clone());
        let mut peer = listener.accept().await.unwrap();
        peer.fail("connection refused").await;

        assert!(matches!(events.next_event().await, Some(Event::AccountInactive { .. })));
        assert!(services.asked.load(Ordering::SeqCst));
        assert!(events.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_unavailable_service() {
        let mut ctx = context();
        ctx.auto_reconnect = false;
        let services = Arc::new(Probe {
            alive: true,
            asked: AtomicBool::new(false),
        });
        let (_handle, mut events, mut listener) = start_with(ctx, config(), services);
        let mut peer = listener.accept().await.unwrap();
        peer.close("gone").await;

        assert!(matches!(events.next_event().await, Some(Event::StopListen { .. })));
    }

    struct Refresh(AtomicU64);

    #[async_trait]
    impl SessionServices for Refresh {
        async fn refresh_sequence_id(&self, _ctx: &SessionContext) -> Result<Option<u64>, ServiceError> {
            Ok(Some(self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_refreshes_sequence_id() {
        let mut ctx = context();
        ctx.cursor.sync_token = Some("tok".to_string());
        let services = Arc::new(Refresh(AtomicU64::new(900)));
        let (handle, _events, mut listener) = start_with(ctx, config(), services);
        let mut peer = listener.accept().await.unwrap();
        peer.fail("reset").await;

        let mut peer = listener.accept().await.unwrap();
        let publishes = handshake(&mut peer).await;
        assert_eq!(publishes[0].topic, topics::SYNC_CREATE_QUEUE);
        let body: Value = serde_json::from_slice(&publishes[0].payload).unwrap();
        assert_eq!(body["initial_titan_sequence_id"], 900);
        assert_eq!(handle.cursor().sync_token, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_everything() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        handle.stop().await.unwrap();
        assert!(events.next_event().await.is_none());
        assert!(peer.recv().await.is_none() || !peer.is_open());

        // No timer survives: nothing reconnects, however long we wait
        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert!(listener.try_accept().is_none());
        assert!(matches!(handle.stop().await, Err(EngineError::Stopped)));
        assert!(matches!(
            handle.publish("/foreground_state", &json!({})).await,
            Err(EngineError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_unread_events() {
        let config = EngineConfig {
            event_capacity: 1,
            ..config()
        };
        let (handle, mut events, mut listener) = start(context(), config);
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let batch: Vec<Value> = (1..=3)
            .map(|i| message_delta("2000", &format!("mid.{}", i)))
            .collect();
        deltas(&peer, json!({ "deltas": batch })).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(3_600), handle.stop()).await;
        assert!(matches!(stopped, Ok(Ok(_))), "stop blocked on a full event channel");

        // The buffered event is still delivered, then the stream ends
        assert!(matches!(events.next_event().await, Some(Event::Message(m)) if m.message_id == "mid.1"));
        assert!(events.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_announces_foreground() {
        let (_handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let started = Instant::now();
        let mut previous = None;
        loop {
            match peer.recv_packet().await {
                Some(Packet::Publish(p)) if p.topic == topics::FOREGROUND_STATE => break,
                Some(packet) => previous = Some(packet),
                None => panic!("connection dropped"),
            }
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(70), "heartbeat after {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(85), "heartbeat after {:?}", elapsed);
        assert!(matches!(previous, Some(Packet::PingReq)));
    }

    fn recycle_config(spacing: Duration) -> EngineConfig {
        let quiet = Duration::from_secs(24 * 3_600);
        let thresholds = WatchdogThresholds {
            soft_stale: quiet,
            ghost_idle: quiet,
            hard_idle: quiet,
            recycle_interval: Duration::from_secs(60),
            recycle_jitter: Duration::ZERO,
            maintenance_spacing: spacing,
            recycle_deferral: Duration::from_secs(30)..Duration::from_secs(30),
            ..WatchdogThresholds::for_tier(RiskTier::Medium)
        };
        EngineConfig {
            watchdog: Some(thresholds),
            ..config()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_recycle_reconnects() {
        let (handle, mut events, mut listener) =
            start(context(), recycle_config(Duration::from_secs(45 * 60)));
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        let started = Instant::now();
        let _next = listener.accept().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(59), "recycled after {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(62), "recycled after {:?}", elapsed);
        assert!(!peer.is_open());

        let health = handle.health();
        assert_eq!(health.reconnect_count, 1);
        assert_eq!(health.last_error.as_deref(), Some("periodic_recycle"));
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recycle_deferred_after_maintenance() {
        let (handle, mut events, mut listener) =
            start(context(), recycle_config(Duration::from_secs(120)));
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;
        handle.note_maintenance().unwrap();

        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(listener.try_accept().is_none());
        assert!(peer.is_open());

        // Deferred until the spacing window has passed
        let _next = listener.accept().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(120), "recycled after {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(152), "recycled after {:?}", elapsed);
        assert_eq!(handle.health().last_error.as_deref(), Some("periodic_recycle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_risk_tier_change_updates_health() {
        let (handle, mut events, mut listener) = start(context(), config());
        let mut peer = listener.accept().await.unwrap();
        ready(&mut peer, &mut events).await;

        handle.set_risk_tier(RiskTier::High).unwrap();
        handle.set_queue_depths(1, 4);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let health = handle.health();
        assert_eq!(health.risk_tier, RiskTier::High);
        assert_eq!(health.outbound_queue, 4);
    }

    #[test]
    fn test_sync_error_detection() {
        assert_eq!(
            sync_error(br#"{"errorCode":"ERROR_QUEUE_OVERFLOW"}"#).as_deref(),
            Some("ERROR_QUEUE_OVERFLOW")
        );
        assert_eq!(sync_error(br#"{"deltas":[]}"#), None);
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut ids = PacketIds(u16::MAX - 1);
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
    }
}
