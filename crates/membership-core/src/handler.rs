//! Handler capabilities.
//!
//! A handler is registered with the [`Agent`](crate::Agent) for any mix of
//! commands, events, protocol callbacks and a periodic timer. Every capability
//! method has a no-op default, so a handler only implements what it registers for.
//! Handlers receive the agent [`Context`] by reference for the duration of
//! a call and never keep it.

use crate::agent::Context;
use crate::events::PeerEvent;
use crate::protocol::{InboundMessage, Protocol, ProtocolError};

/// Index of a handler inside its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) usize);

pub trait Handler: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Protocol served by `on_callback`, if any.
    fn protocol(&self) -> Option<Protocol> {
        None
    }

    /// Called once, on first registration. `interval` is set when that
    /// registration is a timer.
    fn initialize(&mut self, _ctx: &mut Context, _interval: Option<u64>) {}

    fn on_command(&mut self, _ctx: &mut Context, _name: &str, _args: &[Vec<u8>]) {}

    fn on_event(&mut self, _ctx: &mut Context, _event: &PeerEvent) {}

    /// Handle one protocol message. An error only affects this message.
    fn on_callback(
        &mut self,
        _ctx: &mut Context,
        _message: InboundMessage,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Timer fired. Returns the delay until the next firing; 0 cancels.
    fn on_timer(&mut self, _ctx: &mut Context, _interval: u64) -> u64 {
        0
    }

    fn destroy(&mut self, _ctx: &mut Context) {}
}
