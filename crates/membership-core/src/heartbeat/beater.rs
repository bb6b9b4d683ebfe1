//! All-to-all heartbeat handler.
//!
//! Each node pings every peer that has not answered yet, and every ready
//! peer that has been quiet for the evasive window. Peers that stay quiet
//! past the expired window are dropped. There is no failure detector and
//! no versioned state.
//!
//! A peer enters once it answers one of our pings. Whenever that happens
//! the node sends a `Hello` to every ready peer, listing the ready peers
//! and its own headers, so the others can connect to peers they have not
//! met yet.

use super::messages::{HEARTBEAT, Hello, HeartbeatMessage};
use crate::Endpoint;
use crate::agent::Context;
use crate::config::Config;
use crate::events::PeerEvent;
use crate::handler::Handler;
use crate::protocol::{InboundMessage, Protocol, ProtocolError};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

pub struct HeartBeater {
    interval_ms: u64,
    evasive_ms: u64,
    expired_ms: u64,
    seeds: Vec<Endpoint>,
    /// Last frame number received from each peer
    received: HashMap<Endpoint, u64>,
}

impl HeartBeater {
    pub fn new(config: &Config) -> Self {
        Self {
            interval_ms: config.interval_ms,
            evasive_ms: config.evasive_ms,
            expired_ms: config.expired_ms,
            seeds: Vec::new(),
            received: HashMap::new(),
        }
    }

    pub fn seeds(&self) -> &[Endpoint] {
        &self.seeds
    }

    pub fn last_sequence(&self, endpoint: &Endpoint) -> Option<u64> {
        self.received.get(endpoint).copied()
    }

    /// Number the next frame on the link to `to` will carry.
    fn next_sequence(ctx: &Context, to: Endpoint) -> u64 {
        ctx.peers()
            .get(&to)
            .filter(|p| p.is_connected())
            .map_or(0, |p| p.sequence())
            + 1
    }

    fn send(&self, ctx: &mut Context, to: Endpoint, message: &HeartbeatMessage) -> bool {
        match message.to_envelope(ctx.codec()) {
            Ok(envelope) => ctx.send(to, &envelope),
            Err(e) => {
                warn!("Failed to encode heartbeat for {}: {}", to, e);
                false
            }
        }
    }

    fn track_sequence(&mut self, from: Endpoint, sequence: u64) {
        if let Some(last) = self.received.insert(from, sequence) {
            if sequence <= last {
                debug!(
                    "Link from {} was rebuilt (frame {} after {})",
                    from, sequence, last
                );
            }
        }
    }

    /// First answer from `from`: announce it and tell everyone.
    fn on_ready(&mut self, ctx: &mut Context, from: Endpoint) {
        let Some(peer) = ctx.peers_mut().get_mut(&from) else {
            return;
        };
        if peer.is_ready() {
            return;
        }
        peer.set_ready();
        let mut headers: Vec<(String, String)> = peer
            .headers()
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        headers.sort();

        info!("{} is ready", from);
        ctx.emit(PeerEvent::Enter { endpoint: from });
        for (key, value) in headers {
            ctx.emit(PeerEvent::Header {
                endpoint: from,
                key,
                value,
            });
        }
        self.send_hello(ctx);
    }

    /// Share the ready peers and our headers with every ready peer.
    fn send_hello(&self, ctx: &mut Context) {
        let mut ready: Vec<Endpoint> = ctx
            .peers()
            .active()
            .filter(|p| p.is_ready())
            .map(|p| p.endpoint())
            .collect();
        ready.sort();
        let headers: BTreeMap<String, String> = ctx
            .headers()
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();

        for &to in &ready {
            let hello = HeartbeatMessage::Hello(Hello {
                sequence: Self::next_sequence(ctx, to),
                peers: ready.clone(),
                headers: headers.clone(),
            });
            self.send(ctx, to, &hello);
        }
    }

    /// Connect to peers we learn about from someone else's hello.
    fn introduce(&self, ctx: &mut Context, from: Endpoint, peers: &[Endpoint]) {
        for &endpoint in peers {
            if endpoint == ctx.address() || ctx.peers().contains(&endpoint) {
                continue;
            }
            debug!("Learned of {} from {}", endpoint, from);
            ctx.connect_peer(endpoint);
        }
    }

    /// Store the sender's headers. Changes are reported once it is ready.
    fn merge_headers(&self, ctx: &mut Context, from: Endpoint, headers: BTreeMap<String, String>) {
        let Some(peer) = ctx.peers_mut().get_mut(&from) else {
            return;
        };
        let mut changed = Vec::new();
        for (key, value) in headers {
            if peer.headers().value(&key) != Some(value.as_str()) {
                peer.headers_mut().put(key.clone(), value.clone());
                changed.push((key, value));
            }
        }
        if !peer.is_ready() {
            return;
        }
        for (key, value) in changed {
            ctx.emit(PeerEvent::Header {
                endpoint: from,
                key,
                value,
            });
        }
    }
}

impl Handler for HeartBeater {
    fn name(&self) -> &'static str {
        "all"
    }

    fn protocol(&self) -> Option<Protocol> {
        Some(HEARTBEAT)
    }

    fn initialize(&mut self, ctx: &mut Context, interval: Option<u64>) {
        if let Some(interval) = interval {
            self.interval_ms = interval;
        }
        let address = ctx.address();
        for seed in ctx.config().seeds.clone() {
            if seed == address || self.seeds.contains(&seed) {
                continue;
            }
            self.seeds.push(seed);
            ctx.connect_peer(seed);
        }
        info!(
            "Heartbeat on {} every {}ms ({} seed(s))",
            address,
            self.interval_ms,
            self.seeds.len()
        );
    }

    fn on_timer(&mut self, ctx: &mut Context, _interval: u64) -> u64 {
        let now = ctx.now();
        let mut expired = Vec::new();
        let mut quiet = Vec::new();
        for peer in ctx.peers().active() {
            if peer.expired_at() > 0 && now >= peer.expired_at() {
                expired.push((peer.endpoint(), peer.is_ready()));
            } else if !peer.is_ready() || now >= peer.evasive_at() {
                quiet.push(peer.endpoint());
            }
        }

        for (endpoint, entered) in expired {
            info!("{} expired, removing", endpoint);
            if entered {
                ctx.emit(PeerEvent::Exit { endpoint });
            }
            self.received.remove(&endpoint);
            ctx.peers_mut().retire(&endpoint, now);
        }
        for endpoint in quiet {
            let ping = HeartbeatMessage::ping(Self::next_sequence(ctx, endpoint));
            self.send(ctx, endpoint, &ping);
        }
        for endpoint in ctx.peers_mut().purge_retired(now, 2 * self.evasive_ms) {
            debug!("Forgot removed peer {}", endpoint);
        }
        self.interval_ms
    }

    fn on_callback(&mut self, ctx: &mut Context, message: InboundMessage) -> Result<(), ProtocolError> {
        let from = message.from;
        if ctx.peers().is_retired(&from) {
            debug!("Ignoring heartbeat from removed peer {}", from);
            return Ok(());
        }
        let message = HeartbeatMessage::from_inbound(&message)?;

        if !ctx.peers().contains(&from) {
            if !matches!(message, HeartbeatMessage::Ping(_)) {
                debug!("Ignoring heartbeat kind {} from unknown {}", message.kind(), from);
                return Ok(());
            }
            ctx.connect_peer(from);
        }
        self.track_sequence(from, message.sequence());

        match message {
            HeartbeatMessage::Ping(_) => {
                let ok = HeartbeatMessage::ping_ok(Self::next_sequence(ctx, from));
                self.send(ctx, from, &ok);
            }
            HeartbeatMessage::PingOk(_) => self.on_ready(ctx, from),
            HeartbeatMessage::Hello(hello) => {
                self.introduce(ctx, from, &hello.peers);
                self.merge_headers(ctx, from, hello.headers);
            }
        }

        let (now, evasive, expired) = (ctx.now(), self.evasive_ms, self.expired_ms);
        if let Some(peer) = ctx.peers_mut().get_mut(&from) {
            peer.refresh(now, evasive, expired);
        }
        Ok(())
    }
}
