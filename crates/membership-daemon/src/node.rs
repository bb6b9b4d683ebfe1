//! Application-facing handle to a running agent.

use crate::driver::{self, Channels, Setup};
use anyhow::{anyhow, Result};
use membership_core::control::{AGENT_HEADER, SYSTEM_EXIT};
use membership_core::{Agent, Config, ControlMessage, Endpoint};
use tokio::sync::{mpsc, oneshot};

/// A membership agent running on its own thread.
///
/// Commands go in through [`Node::send`]; peer events and `AGENT.EXIT` come
/// out through [`Node::recv`]. Dropping the node stops the agent.
pub struct Node {
    address: Endpoint,
    commands: mpsc::UnboundedSender<ControlMessage>,
    messages: mpsc::UnboundedReceiver<ControlMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Node {
    /// Start an agent with the built-in handlers only.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, |_| Ok(())).await
    }

    /// Start an agent, running `setup` on it before its loop begins.
    pub async fn start_with<F>(config: Config, setup: F) -> Result<Self>
    where
        F: FnOnce(&mut Agent) -> Result<()> + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let setup: Setup = Box::new(setup);
        let thread = driver::spawn(
            config,
            setup,
            Channels {
                commands: command_rx,
                messages: message_tx,
                ready: ready_tx,
            },
        )?;

        let address = ready_rx
            .await
            .map_err(|_| anyhow!("Agent thread exited during startup"))??;

        Ok(Self {
            address,
            commands,
            messages,
            thread: Some(thread),
        })
    }

    /// Address announced to peers.
    pub fn address(&self) -> Endpoint {
        self.address
    }

    /// Queue a control message for the agent.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.commands
            .send(message)
            .map_err(|_| anyhow!("Agent {} has stopped", self.address))
    }

    /// Publish a local header to the cluster.
    pub fn put_header(&self, key: &str, value: &str) -> Result<()> {
        self.send(ControlMessage::new(AGENT_HEADER).push_str(key).push_str(value))
    }

    /// Next message from the agent. `None` once the agent is gone.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.messages.recv().await
    }

    /// Ask the agent to stop. It says goodbye to its peers and then sends
    /// `AGENT.EXIT`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ControlMessage::new(SYSTEM_EXIT));
    }

    /// Wait for the agent thread to finish.
    pub async fn join(mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || thread.join())
            .await?
            .map_err(|_| anyhow!("Agent thread panicked"))
    }
}
