//! Built-in handler for agent control commands.
//!
//! Registered for every command and every event:
//! - `AGENT.HEADER key value` publishes a local header
//! - `SYSTEM.EXIT` stops the agent
//! - peer events are forwarded to the application as control messages

use crate::agent::Context;
use crate::control::{AGENT_HEADER, SYSTEM_EXIT};
use crate::events::PeerEvent;
use crate::handler::Handler;
use tracing::{info, warn};

pub struct SystemHandler;

impl Handler for SystemHandler {
    fn name(&self) -> &'static str {
        "system"
    }

    fn on_command(&mut self, ctx: &mut Context, name: &str, args: &[Vec<u8>]) {
        match name {
            AGENT_HEADER => {
                let key = args.first().and_then(|a| std::str::from_utf8(a).ok());
                let value = args.get(1).and_then(|a| std::str::from_utf8(a).ok());
                match (key, value) {
                    (Some(key), Some(value)) => {
                        ctx.put_header(key, value);
                    }
                    _ => warn!("{} expects a UTF-8 key and value", AGENT_HEADER),
                }
            }
            SYSTEM_EXIT => {
                info!("Stop requested for agent {}", ctx.address());
                ctx.stop();
            }
            _ => {}
        }
    }

    fn on_event(&mut self, ctx: &mut Context, event: &PeerEvent) {
        ctx.notify(event.to_message());
    }
}
