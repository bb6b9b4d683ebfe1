//! The agent's control thread.
//!
//! One OS thread per agent runs a single-threaded tokio runtime. The loop
//! waits on application commands, the network inbox, and the next timer
//! deadline, then hands whatever is ready to the agent: commands first, then
//! frames, then timers. Agent state is never touched from anywhere else.

use crate::outgoing::{ReconnectConfig, WsTransport};
use crate::server::Inbox;
use anyhow::{Context as _, Result};
use membership_core::{clock, Agent, Config, ControlMessage, Delivery, Endpoint};
use std::future::pending;
use std::iter;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Extra registrations run on the agent before its loop starts.
pub type Setup = Box<dyn FnOnce(&mut Agent) -> Result<()> + Send>;

pub(crate) struct Channels {
    pub commands: mpsc::UnboundedReceiver<ControlMessage>,
    pub messages: mpsc::UnboundedSender<ControlMessage>,
    pub ready: oneshot::Sender<Result<Endpoint>>,
}

/// Start the control thread. The bound address (or the startup error) is
/// reported through `channels.ready`.
pub(crate) fn spawn(
    config: Config,
    setup: Setup,
    channels: Channels,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("membership-agent".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = channels.ready.send(Err(e.into()));
                    return;
                }
            };
            runtime.block_on(run(config, setup, channels));
        })
        .context("Failed to spawn agent thread")
}

async fn start(config: Config, setup: Setup) -> Result<(Agent, Inbox, WsTransport)> {
    let inbox = Inbox::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    let address = config.advertise.unwrap_or_else(|| inbox.local_addr());

    let transport = WsTransport::new(ReconnectConfig::default());
    let mut agent = Agent::new(address, config, Box::new(transport.clone()), clock::now_ms());
    agent.register_system_handlers()?;
    setup(&mut agent)?;
    Ok((agent, inbox, transport))
}

/// One pass of the loop: every pending command, then every pending frame,
/// then whatever timers are due.
pub(crate) fn service(
    agent: &mut Agent,
    commands: impl IntoIterator<Item = ControlMessage>,
    deliveries: impl IntoIterator<Item = Delivery>,
) {
    for command in commands {
        agent.handle_command(command, clock::now_ms());
    }
    for delivery in deliveries {
        agent.handle_delivery(delivery, clock::now_ms());
    }
    agent.run_timers(clock::now_ms());
}

async fn run(config: Config, setup: Setup, channels: Channels) {
    let Channels {
        mut commands,
        messages,
        ready,
    } = channels;
    let linger = Duration::from_millis(config.linger_ms);

    let (mut agent, mut inbox, transport) = match start(config, setup).await {
        Ok(started) => started,
        Err(e) => {
            error!("Agent failed to start: {:#}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!("Agent running on {}", agent.address());
    let _ = ready.send(Ok(agent.address()));

    loop {
        for message in agent.take_outbox() {
            let _ = messages.send(message);
        }
        if agent.is_stopped() {
            break;
        }

        let wait = agent.next_timeout(clock::now_ms());
        let timer = async move {
            match wait {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => pending::<()>().await,
            }
        };

        let mut woken_command = None;
        let mut woken_delivery = None;
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => woken_command = Some(command),
                None => {
                    debug!("Command channel closed, stopping");
                    break;
                }
            },
            Some(delivery) = inbox.recv() => woken_delivery = Some(delivery),
            _ = timer => {}
        }

        service(
            &mut agent,
            woken_command
                .into_iter()
                .chain(iter::from_fn(|| commands.try_recv().ok())),
            woken_delivery
                .into_iter()
                .chain(iter::from_fn(|| inbox.try_recv())),
        );
    }

    agent.shutdown(clock::now_ms());
    for message in agent.take_outbox() {
        let _ = messages.send(message);
    }
    drop(agent);
    transport.flush(linger).await;
    debug!("Agent thread finished");
}
