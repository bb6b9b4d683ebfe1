//! The agent: one node's scheduler and peer registry.
//!
//! The agent multiplexes three sources of work onto a single control
//! thread:
//! - control commands from the application
//! - protocol frames from the network inbox
//! - a min-heap of timers
//!
//! It is sans-IO: the runtime that drives it (see membership-daemon) waits
//! on the channels, then calls `handle_command`, `handle_delivery` and
//! `run_timers` with the current time. All handler state is mutated from
//! those calls only.
//!
//! Handlers live in an arena and are addressed by [`HandlerId`]. While a
//! handler runs it gets `&mut Context`, the part of the agent that holds
//! peers, local state and outbound queues.

use crate::Endpoint;
use crate::config::{Config, ConfigError};
use crate::control::{AGENT_EXIT, ControlMessage, WILDCARD};
use crate::events::PeerEvent;
use crate::handler::{Handler, HandlerId};
use crate::heartbeat::create_heartbeat;
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::{Codec, Envelope, InboundMessage, MessageRegistry, Protocol, ProtocolError};
use crate::state::NodeState;
use crate::system::SystemHandler;
use crate::transport::{Delivery, Transport};
use crate::versioned::VersionedMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Agent has shut down")]
    ShutDown,
}

/// State shared with handlers while they run.
pub struct Context {
    address: Endpoint,
    config: Config,
    codec: Codec,
    now_ms: u64,
    local: NodeState,
    headers: VersionedMap,
    peers: PeerRegistry,
    transport: Box<dyn Transport>,
    events: VecDeque<PeerEvent>,
    outbox: Vec<ControlMessage>,
    stop_requested: bool,
}

impl Context {
    pub(crate) fn new(
        address: Endpoint,
        config: Config,
        transport: Box<dyn Transport>,
        now_ms: u64,
    ) -> Self {
        let local = NodeState::new(address, config.generation, 0);
        Self {
            address,
            codec: config.codec,
            config,
            now_ms,
            local,
            headers: VersionedMap::new(),
            peers: PeerRegistry::new(),
            transport,
            events: VecDeque::new(),
            outbox: Vec::new(),
            stop_requested: false,
        }
    }

    /// Our own (advertised) address.
    pub fn address(&self) -> Endpoint {
        self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Time of the current dispatch, in ms since the epoch.
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn local(&self) -> &NodeState {
        &self.local
    }

    pub fn headers(&self) -> &VersionedMap {
        &self.headers
    }

    /// Local effective version.
    pub fn local_version(&self) -> u64 {
        self.local.effective_version(&self.headers)
    }

    /// Advance the local heartbeat.
    pub fn beat(&mut self) -> u64 {
        self.local.beat(&self.headers)
    }

    /// Publish a local header.
    ///
    /// The header is stamped above the current effective version, so peers
    /// asking for "everything newer than what I know" always receive it.
    pub fn put_header(&mut self, key: &str, value: &str) -> u64 {
        let version = self.local_version() + 1;
        self.headers.put_versioned(key, version, value);
        debug!("Local header {}={} (version {})", key, value, version);
        version
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry {
        &mut self.peers
    }

    /// Find or create the peer for `endpoint` and make sure it is connected.
    ///
    /// Returns `None` for peers waiting out their removal grace period.
    pub fn connect_peer(&mut self, endpoint: Endpoint) -> Option<&mut Peer> {
        if self.peers.is_retired(&endpoint) {
            return None;
        }
        let address = self.address;
        let send_hwm = self.config.send_hwm;
        let peer = self.peers.create(endpoint);
        peer.connect(self.transport.as_mut(), address, send_hwm);
        Some(peer)
    }

    pub fn remove_peer(&mut self, endpoint: &Endpoint) {
        self.peers.remove(endpoint);
    }

    /// Encode and queue an envelope for `endpoint` without blocking.
    ///
    /// Returns false if the frame was dropped.
    pub fn send(&mut self, endpoint: Endpoint, envelope: &Envelope) -> bool {
        let frame = match envelope.encode(self.codec) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", endpoint, e);
                return false;
            }
        };
        let Some(peer) = self.connect_peer(endpoint) else {
            debug!("Not sending to removed peer {}", endpoint);
            return false;
        };
        match peer.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped frame to {}: {}", endpoint, e);
                false
            }
        }
    }

    /// Queue an event for the agent's event handlers.
    pub fn emit(&mut self, event: PeerEvent) {
        self.events.push_back(event);
    }

    /// Queue a control message for the application.
    pub fn notify(&mut self, message: ControlMessage) {
        self.outbox.push(message);
    }

    /// Ask the agent to stop after the current iteration.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    #[cfg(test)]
    pub(crate) fn take_events(&mut self) -> Vec<PeerEvent> {
        self.events.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn set_now(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }
}

struct Slot {
    handler: Box<dyn Handler>,
    initialized: bool,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    fire_at: u64,
    /// Insertion order, breaks ties between equal deadlines
    seq: u64,
    interval: u64,
    handler: HandlerId,
}

/// One node's scheduler.
pub struct Agent {
    ctx: Context,
    handlers: Vec<Slot>,
    commands: HashMap<String, Vec<HandlerId>>,
    subscribers: Vec<HandlerId>,
    callbacks: HashMap<crate::protocol::Signature, HandlerId>,
    registry: MessageRegistry,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    shut_down: bool,
}

impl Agent {
    pub fn new(
        address: Endpoint,
        config: Config,
        transport: Box<dyn Transport>,
        now_ms: u64,
    ) -> Self {
        Self {
            ctx: Context::new(address, config, transport, now_ms),
            handlers: Vec::new(),
            commands: HashMap::new(),
            subscribers: Vec::new(),
            callbacks: HashMap::new(),
            registry: MessageRegistry::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            shut_down: false,
        }
    }

    pub fn address(&self) -> Endpoint {
        self.ctx.address
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Add a handler to the arena. It is initialized on first registration.
    pub fn add_handler(&mut self, handler: Box<dyn Handler>) -> HandlerId {
        self.handlers.push(Slot {
            handler,
            initialized: false,
        });
        HandlerId(self.handlers.len() - 1)
    }

    /// Install the heartbeat strategy and the system handler.
    pub fn register_system_handlers(&mut self) -> Result<HandlerId, AgentError> {
        let heartbeat = self.add_handler(create_heartbeat(&self.ctx.config)?);
        let system = self.add_handler(Box::new(SystemHandler));

        let interval = self.ctx.config.interval_ms;
        self.register_timer(interval, heartbeat)?;
        if let Some(protocol) = self.handlers[heartbeat.0].handler.protocol() {
            self.register_callback(protocol, heartbeat)?;
        }
        self.register_command(WILDCARD, system)?;
        self.register_event_handler(system)?;
        Ok(heartbeat)
    }

    /// Route commands named `name` (or every command, for `"*"`).
    pub fn register_command(&mut self, name: &str, id: HandlerId) -> Result<(), AgentError> {
        self.initialize(id, None)?;
        self.commands.entry(name.to_string()).or_default().push(id);
        Ok(())
    }

    /// Deliver every peer event to the handler.
    pub fn register_event_handler(&mut self, id: HandlerId) -> Result<(), AgentError> {
        self.initialize(id, None)?;
        self.subscribers.push(id);
        Ok(())
    }

    /// Route messages of `protocol` to the handler. Last registration wins.
    pub fn register_callback(&mut self, protocol: Protocol, id: HandlerId) -> Result<(), AgentError> {
        self.initialize(id, None)?;
        self.registry.register(protocol);
        if let Some(previous) = self.callbacks.insert(protocol.signature(), id) {
            if previous != id {
                debug!("Protocol {} handler replaced", protocol.name);
            }
        }
        Ok(())
    }

    /// Fire the handler's timer now, then every `interval` ms.
    pub fn register_timer(&mut self, interval: u64, id: HandlerId) -> Result<(), AgentError> {
        self.initialize(id, Some(interval))?;
        let fire_at = self.ctx.now_ms;
        self.schedule(fire_at, interval, id);
        Ok(())
    }

    fn initialize(&mut self, id: HandlerId, interval: Option<u64>) -> Result<(), AgentError> {
        if self.shut_down {
            return Err(AgentError::ShutDown);
        }
        let slot = &mut self.handlers[id.0];
        if !slot.initialized {
            slot.initialized = true;
            debug!("Initializing handler {}", slot.handler.name());
            slot.handler.initialize(&mut self.ctx, interval);
            self.flush_events();
        }
        Ok(())
    }

    fn schedule(&mut self, fire_at: u64, interval: u64, handler: HandlerId) {
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            fire_at,
            seq: self.timer_seq,
            interval,
            handler,
        }));
    }

    /// Run a handler, then deliver whatever events it emitted.
    fn dispatch<R>(&mut self, id: HandlerId, f: impl FnOnce(&mut dyn Handler, &mut Context) -> R) -> R {
        let result = f(self.handlers[id.0].handler.as_mut(), &mut self.ctx);
        self.flush_events();
        result
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.ctx.events.pop_front() {
            for i in 0..self.subscribers.len() {
                let id = self.subscribers[i];
                self.handlers[id.0].handler.on_event(&mut self.ctx, &event);
            }
        }
    }

    /// Dispatch one control message: exact-name handlers first, then `"*"`.
    pub fn handle_command(&mut self, message: ControlMessage, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        let Some(name) = message.name() else {
            warn!("Dropping control message without a valid command name");
            return;
        };

        let mut targets = self.commands.get(name).cloned().unwrap_or_default();
        if name != WILDCARD {
            if let Some(wildcard) = self.commands.get(WILDCARD) {
                targets.extend(wildcard.iter().copied());
            }
        }
        if targets.is_empty() {
            debug!("No handler for command {}", name);
        }

        for id in targets {
            self.dispatch(id, |handler, ctx| {
                handler.on_command(ctx, name, message.args())
            });
        }
    }

    /// Dispatch one frame from the network inbox.
    pub fn handle_delivery(&mut self, delivery: Delivery, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        let Delivery { from, frame } = delivery;

        let (envelope, codec) = match Envelope::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", from, e);
                return;
            }
        };

        match self.registry.validate(&envelope.header) {
            Ok(_) => {}
            Err(ProtocolError::UnknownSignature(signature)) => {
                debug!("Discarding message with unknown signature {} from {}", signature, from);
                return;
            }
            Err(e) => {
                warn!("Rejected message from {}: {}", from, e);
                return;
            }
        }

        let Some(&id) = self.callbacks.get(&envelope.header.signature) else {
            debug!("No callback for signature {}", envelope.header.signature);
            return;
        };

        let message = InboundMessage {
            from,
            header: envelope.header,
            body: envelope.body,
            codec,
        };
        if let Err(e) = self.dispatch(id, |handler, ctx| handler.on_callback(ctx, message)) {
            warn!("Protocol error handling message from {}: {}", from, e);
        }
    }

    /// Fire every timer whose deadline has passed, earliest first.
    pub fn run_timers(&mut self, now_ms: u64) {
        self.ctx.now_ms = now_ms;
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.fire_at > now_ms || self.shut_down {
                break;
            }
            let Some(Reverse(entry)) = self.timers.pop() else {
                break;
            };
            let next = self.dispatch(entry.handler, |handler, ctx| {
                handler.on_timer(ctx, entry.interval)
            });
            if next > 0 {
                self.schedule(now_ms + next, next, entry.handler);
            }
        }
    }

    /// Milliseconds until the next timer is due, or `None` if there are no
    /// timers (wait indefinitely).
    pub fn next_timeout(&self, now_ms: u64) -> Option<u64> {
        self.timers
            .peek()
            .map(|Reverse(entry)| entry.fire_at.saturating_sub(now_ms))
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Request a stop, same as a `SYSTEM.EXIT` command.
    pub fn stop(&mut self) {
        self.ctx.stop_requested = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.stop_requested || self.shut_down
    }

    /// Control messages queued for the application.
    pub fn take_outbox(&mut self) -> Vec<ControlMessage> {
        std::mem::take(&mut self.ctx.outbox)
    }

    /// Destroy every initialized handler, tell the application, and drop
    /// all peer links. Runs once.
    pub fn shutdown(&mut self, now_ms: u64) {
        if self.shut_down {
            return;
        }
        self.ctx.now_ms = now_ms;
        for i in 0..self.handlers.len() {
            if self.handlers[i].initialized {
                self.dispatch(HandlerId(i), |handler, ctx| handler.destroy(ctx));
            }
        }
        self.shut_down = true;
        self.timers.clear();
        self.ctx.notify(ControlMessage::new(AGENT_EXIT));
        self.ctx.peers.clear();
        info!("Agent {} shut down", self.ctx.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AGENT_HEADER, SYSTEM_EXIT};
    use crate::events::PEER_ENTER;
    use crate::transport::MemoryNetwork;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every call; emits an Enter event on each command.
    struct Recorder {
        tag: &'static str,
        log: Log,
        timer_results: Vec<u64>,
        emit_on_command: bool,
        protocol: Option<Protocol>,
    }

    impl Recorder {
        fn new(tag: &'static str, log: &Log) -> Self {
            Self {
                tag,
                log: log.clone(),
                timer_results: Vec::new(),
                emit_on_command: false,
                protocol: None,
            }
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, entry));
        }
    }

    impl Handler for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn protocol(&self) -> Option<Protocol> {
            self.protocol
        }

        fn initialize(&mut self, _ctx: &mut Context, interval: Option<u64>) {
            self.record(format!("init({:?})", interval));
        }

        fn on_command(&mut self, ctx: &mut Context, name: &str, args: &[Vec<u8>]) {
            self.record(format!("cmd({},{})", name, args.len()));
            if self.emit_on_command {
                ctx.emit(PeerEvent::Enter {
                    endpoint: addr(9),
                });
            }
        }

        fn on_event(&mut self, _ctx: &mut Context, event: &PeerEvent) {
            self.record(format!("event({})", event.name()));
        }

        fn on_callback(
            &mut self,
            _ctx: &mut Context,
            message: InboundMessage,
        ) -> Result<(), ProtocolError> {
            self.record(format!("callback({})", message.header.kind));
            if message.header.kind == 2 {
                return Err(ProtocolError::UnexpectedKind {
                    protocol: "test",
                    kind: 2,
                });
            }
            Ok(())
        }

        fn on_timer(&mut self, _ctx: &mut Context, interval: u64) -> u64 {
            self.record(format!("timer({})", interval));
            if self.timer_results.is_empty() {
                interval
            } else {
                self.timer_results.remove(0)
            }
        }

        fn destroy(&mut self, _ctx: &mut Context) {
            self.record("destroy".to_string());
        }
    }

    const TEST_PROTOCOL: Protocol = Protocol {
        name: "test",
        version: 1,
        kinds: &[1, 2],
    };

    fn addr(port: u16) -> Endpoint {
        Endpoint::from(([127, 0, 0, 1], port))
    }

    fn agent() -> Agent {
        let network = MemoryNetwork::new();
        let transport = network.bind(addr(1));
        let config = Config::from_pairs([("heartbeat.generation", "1")]).unwrap();
        Agent::new(addr(1), config, Box::new(transport), 1_000)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn frame(kind: u16, codec: Codec) -> Delivery {
        let envelope = Envelope::wrap(&TEST_PROTOCOL, kind, &"x".to_string(), codec).unwrap();
        Delivery {
            from: addr(2),
            frame: envelope.encode(codec).unwrap(),
        }
    }

    // ==================== Registration ====================

    #[test]
    fn test_initialize_runs_once() {
        let log = Log::default();
        let mut agent = agent();
        let id = agent.add_handler(Box::new(Recorder::new("a", &log)));

        agent.register_timer(250, id).unwrap();
        agent.register_command("PING", id).unwrap();
        agent.register_event_handler(id).unwrap();
        agent.register_callback(TEST_PROTOCOL, id).unwrap();

        assert_eq!(entries(&log), vec!["a:init(Some(250))"]);
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let log = Log::default();
        let mut agent = agent();
        let id = agent.add_handler(Box::new(Recorder::new("a", &log)));
        agent.shutdown(2_000);

        assert!(matches!(
            agent.register_command("PING", id),
            Err(AgentError::ShutDown)
        ));
    }

    // ==================== Commands ====================

    #[test]
    fn test_exact_handlers_then_wildcard() {
        let log = Log::default();
        let mut agent = agent();
        let star = agent.add_handler(Box::new(Recorder::new("star", &log)));
        let first = agent.add_handler(Box::new(Recorder::new("first", &log)));
        let second = agent.add_handler(Box::new(Recorder::new("second", &log)));
        agent.register_command(WILDCARD, star).unwrap();
        agent.register_command("JOB", first).unwrap();
        agent.register_command("JOB", second).unwrap();
        log.lock().unwrap().clear();

        agent.handle_command(ControlMessage::new("JOB").push_str("arg"), 1_000);
        agent.handle_command(ControlMessage::new("OTHER"), 1_000);

        assert_eq!(
            entries(&log),
            vec![
                "first:cmd(JOB,1)",
                "second:cmd(JOB,1)",
                "star:cmd(JOB,1)",
                "star:cmd(OTHER,0)",
            ]
        );
    }

    #[test]
    fn test_command_without_name_is_dropped() {
        let log = Log::default();
        let mut agent = agent();
        let star = agent.add_handler(Box::new(Recorder::new("star", &log)));
        agent.register_command(WILDCARD, star).unwrap();
        log.lock().unwrap().clear();

        agent.handle_command(ControlMessage::from_frames(vec![vec![0xff]]), 1_000);
        agent.handle_command(ControlMessage::from_frames(vec![]), 1_000);

        assert!(entries(&log).is_empty());
    }

    // ==================== Events ====================

    #[test]
    fn test_events_reach_subscribers_after_handler_returns() {
        let log = Log::default();
        let mut agent = agent();
        let mut emitter = Recorder::new("emitter", &log);
        emitter.emit_on_command = true;
        let emitter = agent.add_handler(Box::new(emitter));
        let listener = agent.add_handler(Box::new(Recorder::new("listener", &log)));
        agent.register_command("GO", emitter).unwrap();
        agent.register_event_handler(listener).unwrap();
        log.lock().unwrap().clear();

        agent.handle_command(ControlMessage::new("GO"), 1_000);

        let expected = vec![
            "emitter:cmd(GO,0)".to_string(),
            format!("listener:event({})", PEER_ENTER),
        ];
        assert_eq!(entries(&log), expected);
    }

    // ==================== Callbacks ====================

    #[test]
    fn test_callback_routing_last_registration_wins() {
        let log = Log::default();
        let mut agent = agent();
        let old = agent.add_handler(Box::new(Recorder::new("old", &log)));
        let new = agent.add_handler(Box::new(Recorder::new("new", &log)));
        agent.register_callback(TEST_PROTOCOL, old).unwrap();
        agent.register_callback(TEST_PROTOCOL, new).unwrap();
        log.lock().unwrap().clear();

        agent.handle_delivery(frame(1, Codec::Bincode), 1_000);
        agent.handle_delivery(frame(1, Codec::Json), 1_000);

        assert_eq!(entries(&log), vec!["new:callback(1)", "new:callback(1)"]);
    }

    #[test]
    fn test_bad_frames_are_dropped() {
        let log = Log::default();
        let mut agent = agent();
        let id = agent.add_handler(Box::new(Recorder::new("h", &log)));
        agent.register_callback(TEST_PROTOCOL, id).unwrap();
        log.lock().unwrap().clear();

        // malformed
        agent.handle_delivery(
            Delivery {
                from: addr(2),
                frame: vec![1, 2, 3],
            },
            1_000,
        );
        // unknown signature
        let other = Protocol {
            name: "other",
            version: 1,
            kinds: &[1],
        };
        let envelope = Envelope::wrap(&other, 1, &0u8, Codec::Bincode).unwrap();
        agent.handle_delivery(
            Delivery {
                from: addr(2),
                frame: envelope.encode(Codec::Bincode).unwrap(),
            },
            1_000,
        );
        // undeclared kind
        agent.handle_delivery(frame(7, Codec::Bincode), 1_000);

        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_callback_error_is_local_to_message() {
        let log = Log::default();
        let mut agent = agent();
        let id = agent.add_handler(Box::new(Recorder::new("h", &log)));
        agent.register_callback(TEST_PROTOCOL, id).unwrap();
        log.lock().unwrap().clear();

        agent.handle_delivery(frame(2, Codec::Bincode), 1_000);
        agent.handle_delivery(frame(1, Codec::Bincode), 1_000);

        assert_eq!(entries(&log), vec!["h:callback(2)", "h:callback(1)"]);
        assert!(!agent.is_stopped());
    }

    // ==================== Timers ====================

    #[test]
    fn test_no_timers_means_block() {
        assert_eq!(agent().next_timeout(1_000), None);
    }

    #[test]
    fn test_timer_fires_immediately_then_reschedules() {
        let log = Log::default();
        let mut agent = agent();
        let id = agent.add_handler(Box::new(Recorder::new("t", &log)));
        agent.register_timer(500, id).unwrap();
        log.lock().unwrap().clear();

        assert_eq!(agent.next_timeout(1_000), Some(0));
        agent.run_timers(1_000);
        assert_eq!(agent.next_timeout(1_000), Some(500));
        assert_eq!(agent.next_timeout(1_200), Some(300));
        assert_eq!(agent.next_timeout(2_000), Some(0));

        agent.run_timers(1_499);
        agent.run_timers(1_500);
        assert_eq!(entries(&log), vec!["t:timer(500)", "t:timer(500)"]);
    }

    #[test]
    fn test_timer_cancelled_by_zero() {
        let log = Log::default();
        let mut agent = agent();
        let mut handler = Recorder::new("t", &log);
        handler.timer_results = vec![200, 0];
        let id = agent.add_handler(Box::new(handler));
        agent.register_timer(100, id).unwrap();

        agent.run_timers(1_000);
        agent.run_timers(1_200);
        agent.run_timers(5_000);

        assert_eq!(agent.timer_count(), 0);
        assert_eq!(agent.next_timeout(5_000), None);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let log = Log::default();
        let mut agent = agent();
        let slow = agent.add_handler(Box::new(Recorder::new("slow", &log)));
        let fast = agent.add_handler(Box::new(Recorder::new("fast", &log)));
        agent.register_timer(300, slow).unwrap();
        agent.register_timer(100, fast).unwrap();
        agent.run_timers(1_000);
        log.lock().unwrap().clear();

        // fast due at 1100, 1200, 1300; slow due at 1300
        agent.run_timers(1_100);
        agent.run_timers(1_200);
        agent.run_timers(1_300);

        assert_eq!(
            entries(&log),
            vec![
                "fast:timer(100)",
                "fast:timer(100)",
                "slow:timer(300)",
                "fast:timer(100)",
            ]
        );
    }

    // ==================== Shutdown ====================

    #[test]
    fn test_shutdown_destroys_initialized_handlers_once() {
        let log = Log::default();
        let mut agent = agent();
        let used = agent.add_handler(Box::new(Recorder::new("used", &log)));
        agent.add_handler(Box::new(Recorder::new("unused", &log)));
        agent.register_command("X", used).unwrap();
        agent.context_mut().connect_peer(addr(2));
        log.lock().unwrap().clear();

        agent.shutdown(2_000);
        agent.shutdown(3_000);

        assert_eq!(entries(&log), vec!["used:destroy"]);
        assert!(agent.is_stopped());
        assert!(agent.context().peers().is_empty());
        let outbox = agent.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].name(), Some(AGENT_EXIT));
    }

    // ==================== System handlers ====================

    #[test]
    fn test_system_exit_stops_agent() {
        let mut agent = agent();
        agent.register_system_handlers().unwrap();

        agent.handle_command(ControlMessage::new(SYSTEM_EXIT), 1_000);

        assert!(agent.is_stopped());
    }

    #[test]
    fn test_agent_header_is_stamped_above_heartbeat() {
        let mut agent = agent();
        agent.register_system_handlers().unwrap();
        agent.run_timers(1_000);
        agent.run_timers(2_000);
        let before = agent.context().local_version();

        agent.handle_command(
            ControlMessage::new(AGENT_HEADER)
                .push_str("zone")
                .push_str("eu"),
            2_100,
        );

        let header = agent.context().headers().get("zone").unwrap().clone();
        assert_eq!(header.value, "eu");
        assert_eq!(header.version, before + 1);
        assert_eq!(agent.context().local_version(), before + 1);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let network = MemoryNetwork::new();
        let config = Config::from_pairs([("heartbeat.strategy", "multicast")]).unwrap();
        let mut agent = Agent::new(addr(1), config, Box::new(network.bind(addr(1))), 0);

        assert!(matches!(
            agent.register_system_handlers(),
            Err(AgentError::Config(ConfigError::UnknownStrategy(name))) if name == "multicast"
        ));
    }
}
