//! Gossip membership handler.
//!
//! Registered with the agent as a timer (one gossip round per interval) and
//! as the callback for the gossip protocol. Per remote endpoint:
//!
//! ```text
//! unknown → alive ⇄ dead → evasive/expired → removed (grace) → forgotten
//! ```
//!
//! A peer whose `STATUS` header starts with one of the configured managing
//! values is flagged managing: it is reported dead but is never evicted for
//! being evasive.

use super::failure::FailureDetector;
use super::messages::{Digest, GOSSIP, GossipMessage, Hello, PingAck, StateDigest};
use crate::Endpoint;
use crate::agent::Context;
use crate::config::Config;
use crate::events::PeerEvent;
use crate::handler::Handler;
use crate::protocol::{InboundMessage, Protocol, ProtocolError};
use crate::state::NodeState;
use crate::versioned::{VersionedMap, VersionedValue};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Header a peer uses to report its status.
pub const STATUS_HEADER: &str = "STATUS";

pub struct Gossiper {
    interval_ms: u64,
    evasive_ms: u64,
    expired_ms: u64,
    managing_status: Vec<String>,
    seeds: Vec<Endpoint>,
    live: BTreeSet<Endpoint>,
    dead: BTreeSet<Endpoint>,
    detector: FailureDetector,
    rng: StdRng,
}

impl Gossiper {
    pub fn new(config: &Config) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Create with a specific random source (deterministic tests).
    pub fn with_rng(config: &Config, rng: StdRng) -> Self {
        Self {
            interval_ms: config.interval_ms,
            evasive_ms: config.evasive_ms,
            expired_ms: config.expired_ms,
            managing_status: config.managing_status.clone(),
            seeds: Vec::new(),
            live: BTreeSet::new(),
            dead: BTreeSet::new(),
            detector: FailureDetector::new(config.failure_detector()),
            rng,
        }
    }

    pub fn live(&self) -> &BTreeSet<Endpoint> {
        &self.live
    }

    pub fn dead(&self) -> &BTreeSet<Endpoint> {
        &self.dead
    }

    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    fn send(&self, ctx: &mut Context, to: Endpoint, message: &GossipMessage) -> bool {
        match message.to_envelope(ctx.codec()) {
            Ok(envelope) => ctx.send(to, &envelope),
            Err(e) => {
                warn!("Failed to encode gossip message for {}: {}", to, e);
                false
            }
        }
    }

    // ---- rounds ----

    /// Digest of the local node plus every node attached to a peer.
    fn digest(&self, ctx: &Context) -> Vec<StateDigest> {
        let local = ctx.local();
        let mut states = vec![StateDigest::summary(
            ctx.address(),
            local.generation,
            ctx.local_version(),
        )];
        for peer in ctx.peers().active() {
            if let Some(state) = peer.attached() {
                states.push(StateDigest::summary(
                    state.endpoint,
                    state.generation,
                    state.effective_version(peer.headers()),
                ));
            }
        }
        states
    }

    /// Ping one random target. Returns whether the target is a seed.
    fn gossip_to_random(
        &mut self,
        ctx: &mut Context,
        targets: &[Endpoint],
        message: &GossipMessage,
    ) -> bool {
        let Some(&to) = targets.choose(&mut self.rng) else {
            return false;
        };
        self.send(ctx, to, message);
        self.seeds.contains(&to)
    }

    /// Ping a random dead endpoint with probability dead / (live + 1).
    fn gossip_to_dead(&mut self, ctx: &mut Context, message: &GossipMessage) {
        if self.dead.is_empty() {
            return;
        }
        let probability = self.dead.len() as f64 / (self.live.len() + 1) as f64;
        if self.rng.random::<f64>() < probability {
            let dead: Vec<Endpoint> = self.dead.iter().copied().collect();
            self.gossip_to_random(ctx, &dead, message);
        }
    }

    /// Convict silent peers, evict evasive or expired ones, and forget
    /// peers whose grace period is over.
    fn check_state(&mut self, ctx: &mut Context) {
        let now = ctx.now();
        for endpoint in ctx.peers().attached_endpoints() {
            let Some(peer) = ctx.peers().get(&endpoint) else {
                continue;
            };
            let Some(state) = peer.attached() else {
                continue;
            };
            let (alive, managing) = (state.alive, state.managing);
            let (evasive_at, expired_at) = (peer.evasive_at(), peer.expired_at());

            if alive && !managing && self.detector.interpret(&endpoint, now) {
                info!(
                    "Convicting {} (phi {:.2})",
                    endpoint,
                    self.detector.phi(&endpoint, now)
                );
                self.mark_dead(ctx, endpoint);
                continue;
            }

            if !managing && now > evasive_at {
                info!("{} is evasive, removing", endpoint);
                self.remove_endpoint(ctx, endpoint);
            } else if now > expired_at {
                info!("{} expired, removing", endpoint);
                self.remove_endpoint(ctx, endpoint);
            }
        }

        for endpoint in ctx.peers_mut().purge_retired(now, 2 * self.evasive_ms) {
            debug!("Forgot removed peer {}", endpoint);
        }
    }

    // ---- liveness ----

    fn mark_alive(&mut self, ctx: &mut Context, endpoint: Endpoint) {
        let Some(state) = ctx
            .peers_mut()
            .get_mut(&endpoint)
            .and_then(|p| p.attached_mut())
        else {
            return;
        };
        state.alive = true;
        let state = state.clone();
        self.live.insert(endpoint);
        self.dead.remove(&endpoint);
        info!("{} is alive", endpoint);
        ctx.emit(PeerEvent::Alive { endpoint, state });
    }

    fn mark_dead(&mut self, ctx: &mut Context, endpoint: Endpoint) {
        let Some(state) = ctx
            .peers_mut()
            .get_mut(&endpoint)
            .and_then(|p| p.attached_mut())
        else {
            return;
        };
        state.alive = false;
        let state = state.clone();
        self.live.remove(&endpoint);
        self.dead.insert(endpoint);
        info!("{} is dead", endpoint);
        ctx.emit(PeerEvent::Dead { endpoint, state });
    }

    /// Evict a peer: it enters its grace period and is forgotten later.
    fn remove_endpoint(&mut self, ctx: &mut Context, endpoint: Endpoint) {
        let now = ctx.now();
        ctx.emit(PeerEvent::Exit { endpoint });
        self.live.remove(&endpoint);
        self.dead.remove(&endpoint);
        self.detector.remove(&endpoint);
        ctx.peers_mut().retire(&endpoint, now);
    }

    fn is_managing(&self, headers: &VersionedMap) -> bool {
        let Some(status) = headers.value(STATUS_HEADER) else {
            return false;
        };
        let status = status.split(',').next().unwrap_or_default().trim();
        self.managing_status.iter().any(|m| m == status)
    }

    // ---- reconciliation ----

    /// (generation, effective version) we hold for an endpoint.
    fn known(&self, ctx: &Context, endpoint: Endpoint) -> Option<(u32, u64)> {
        if endpoint == ctx.address() {
            return Some((ctx.local().generation, ctx.local_version()));
        }
        let peer = ctx.peers().get(&endpoint).filter(|p| !p.is_retired())?;
        let state = peer.attached()?;
        Some((state.generation, state.effective_version(peer.headers())))
    }

    /// Our state for `endpoint`, limited to headers newer than `since`.
    fn newer_state(&self, ctx: &Context, endpoint: Endpoint, since: u64) -> Option<StateDigest> {
        let (state, headers): (&NodeState, &VersionedMap) = if endpoint == ctx.address() {
            (ctx.local(), ctx.headers())
        } else {
            let peer = ctx.peers().get(&endpoint).filter(|p| !p.is_retired())?;
            (peer.attached()?, peer.headers())
        };
        let max_version = state.effective_version(headers);
        if max_version <= since {
            return None;
        }
        Some(StateDigest::with_headers(
            endpoint,
            state.generation,
            max_version,
            headers,
            since,
        ))
    }

    fn build_ping_ack(&self, ctx: &Context, digest: &[StateDigest]) -> PingAck {
        let mut ack = PingAck::default();
        for remote in digest {
            let endpoint = remote.address;
            if ctx.peers().is_retired(&endpoint) {
                continue;
            }
            match self.known(ctx, endpoint) {
                None => {
                    ack.request
                        .push(StateDigest::summary(endpoint, remote.generation, 0));
                }
                Some((generation, version)) if remote.generation == generation => {
                    if remote.max_version > version {
                        ack.request
                            .push(StateDigest::summary(endpoint, generation, version));
                    } else if remote.max_version < version {
                        ack.response
                            .extend(self.newer_state(ctx, endpoint, remote.max_version));
                    }
                }
                Some((generation, _)) if remote.generation > generation => {
                    ack.request
                        .push(StateDigest::summary(endpoint, remote.generation, 0));
                }
                Some(_) => {
                    ack.response.extend(self.newer_state(ctx, endpoint, 0));
                }
            }
        }
        ack
    }

    fn build_ping_end(&self, ctx: &Context, request: &[StateDigest]) -> Vec<StateDigest> {
        request
            .iter()
            .filter_map(|r| self.newer_state(ctx, r.address, r.max_version))
            .collect()
    }

    /// Merge remote states into our view.
    fn apply_state_changes(&mut self, ctx: &mut Context, states: &[StateDigest]) {
        for remote in states {
            let endpoint = remote.address;
            if endpoint == ctx.address() || ctx.peers().is_retired(&endpoint) {
                continue;
            }
            let local = ctx.peers().get(&endpoint).and_then(|p| {
                p.attached()
                    .map(|s| (s.generation, s.effective_version(p.headers())))
            });

            match local {
                None => self.new_peer(ctx, remote),
                Some((generation, _)) if remote.generation > generation => {
                    self.update_peer(ctx, remote, true);
                }
                Some((generation, version))
                    if remote.generation == generation && remote.max_version > version =>
                {
                    self.update_peer(ctx, remote, false);
                    let revived = ctx
                        .peers()
                        .get(&endpoint)
                        .and_then(|p| p.attached())
                        .is_some_and(|s| !s.alive && !s.managing);
                    if revived {
                        self.mark_alive(ctx, endpoint);
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn new_peer(&mut self, ctx: &mut Context, remote: &StateDigest) {
        let endpoint = remote.address;
        if ctx.connect_peer(endpoint).is_none() {
            return;
        }
        info!("Discovered {} (generation {})", endpoint, remote.generation);
        ctx.emit(PeerEvent::Enter { endpoint });
        self.refresh(ctx, remote);

        let Some(peer) = ctx.peers_mut().get_mut(&endpoint) else {
            return;
        };
        let managing = self.is_managing(peer.headers());
        let mut state = NodeState::new(endpoint, remote.generation, remote.max_version);
        state.alive = false;
        state.managing = managing;
        peer.attach(state);

        if managing {
            self.mark_dead(ctx, endpoint);
        } else {
            self.mark_alive(ctx, endpoint);
        }
    }

    fn update_peer(&mut self, ctx: &mut Context, remote: &StateDigest, restart: bool) {
        let endpoint = remote.address;
        if restart {
            info!("{} restarted with generation {}", endpoint, remote.generation);
            ctx.emit(PeerEvent::Restart { endpoint });
            self.detector.clear(&endpoint);
            if let Some(peer) = ctx.peers_mut().get_mut(&endpoint) {
                peer.headers_mut().clear();
            }
        }

        let applied = self.refresh(ctx, remote);

        let Some(peer) = ctx.peers_mut().get_mut(&endpoint) else {
            return;
        };
        let managing = self.is_managing(peer.headers());
        if let Some(state) = peer.attached_mut() {
            state.generation = remote.generation;
            state.version = remote.max_version;
            state.managing = managing;
        }
        for (key, value) in applied {
            ctx.emit(PeerEvent::Header {
                endpoint,
                key,
                value,
            });
        }
    }

    /// Merge newer headers, slide deadlines and feed the detector.
    ///
    /// Returns the headers that changed.
    fn refresh(&mut self, ctx: &mut Context, remote: &StateDigest) -> Vec<(String, String)> {
        let now = ctx.now();
        let endpoint = remote.address;
        let Some(peer) = ctx.peers_mut().get_mut(&endpoint) else {
            return Vec::new();
        };

        let mut applied = Vec::new();
        for entry in &remote.extra {
            let incoming = VersionedValue::new(entry.version, entry.value.clone());
            if peer.headers_mut().merge(&entry.key, &incoming) {
                applied.push((entry.key.clone(), entry.value.clone()));
            }
        }
        peer.refresh(now, self.evasive_ms, self.expired_ms);
        self.detector.report(endpoint, now);
        applied
    }
}

impl Handler for Gossiper {
    fn name(&self) -> &'static str {
        "gossip"
    }

    fn protocol(&self) -> Option<Protocol> {
        Some(GOSSIP)
    }

    fn initialize(&mut self, ctx: &mut Context, interval: Option<u64>) {
        if let Some(interval) = interval {
            self.interval_ms = interval;
        }
        let mut detector_config = ctx.config().failure_detector();
        detector_config.gossip_interval_ms = self.interval_ms;
        self.detector = FailureDetector::new(detector_config);

        let address = ctx.address();
        let hello = GossipMessage::Hello(Hello {
            address,
            generation: ctx.local().generation,
        });
        for seed in ctx.config().seeds.clone() {
            if seed == address || self.seeds.contains(&seed) {
                continue;
            }
            self.seeds.push(seed);
            self.send(ctx, seed, &hello);
        }
        info!(
            "Gossip on {} every {}ms (generation {}, {} seed(s))",
            address,
            self.interval_ms,
            ctx.local().generation,
            self.seeds.len()
        );
    }

    fn on_timer(&mut self, ctx: &mut Context, _interval: u64) -> u64 {
        ctx.beat();
        if ctx.peers().is_empty() {
            return self.interval_ms;
        }

        let ping = GossipMessage::ping(self.digest(ctx));
        let live: Vec<Endpoint> = self.live.iter().copied().collect();
        let landed_on_seed = self.gossip_to_random(ctx, &live, &ping);
        self.gossip_to_dead(ctx, &ping);
        if !landed_on_seed || self.live.len() < self.seeds.len() {
            let seeds = self.seeds.clone();
            self.gossip_to_random(ctx, &seeds, &ping);
        }

        self.check_state(ctx);
        self.interval_ms
    }

    fn on_callback(&mut self, ctx: &mut Context, message: InboundMessage) -> Result<(), ProtocolError> {
        let from = message.from;
        if ctx.peers().is_retired(&from) {
            debug!("Ignoring message from removed peer {}", from);
            return Ok(());
        }
        let message = GossipMessage::from_inbound(&message)?;

        if let GossipMessage::Exit = message {
            let attached = ctx.peers().get(&from).is_some_and(|p| p.attached().is_some());
            if attached {
                info!("{} said goodbye", from);
                self.remove_endpoint(ctx, from);
            } else {
                ctx.remove_peer(&from);
            }
            return Ok(());
        }

        let (now, evasive, expired) = (ctx.now(), self.evasive_ms, self.expired_ms);
        if let Some(peer) = ctx.connect_peer(from) {
            peer.set_ready();
            if peer.attached().is_some() {
                peer.refresh(now, evasive, expired);
            }
        }

        match message {
            GossipMessage::Hello(hello) => {
                debug!(
                    "Hello from {} (generation {})",
                    hello.address, hello.generation
                );
                let ping = GossipMessage::ping(self.digest(ctx));
                self.send(ctx, from, &ping);
            }
            GossipMessage::Ping(Digest { states }) => {
                let ack = self.build_ping_ack(ctx, &states);
                self.send(ctx, from, &GossipMessage::PingAck(ack));
            }
            GossipMessage::PingAck(PingAck { request, response }) => {
                self.apply_state_changes(ctx, &response);
                let states = self.build_ping_end(ctx, &request);
                self.send(ctx, from, &GossipMessage::ping_end(states));
            }
            GossipMessage::PingEnd(Digest { states }) => {
                self.apply_state_changes(ctx, &states);
            }
            GossipMessage::Exit => {}
        }
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut Context) {
        let live: Vec<Endpoint> = self.live.iter().copied().collect();
        for endpoint in &live {
            self.send(ctx, *endpoint, &GossipMessage::Exit);
        }
        debug!("Sent exit to {} live peer(s)", live.len());
    }
}
