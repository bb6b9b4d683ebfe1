//! The agent's network inbox.
//!
//! Accepts WebSocket connections on the bind address and turns the frames
//! they carry into [`Delivery`]s tagged with the sender's announced address.
//! Connections that never complete the handshake are an internal detail.

use crate::connection::{self, ConnectionEvent};
use anyhow::Result;
use membership_core::{Delivery, Endpoint};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

pub struct Inbox {
    local_addr: SocketAddr,
    /// conn id → announced address, after handshake
    connections: HashMap<u64, Endpoint>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    accept_task: JoinHandle<()>,
}

impl Inbox {
    /// Bind the listener and start accepting connections.
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Inbox listening on {}", local_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, event_tx));

        Ok(Self {
            local_addr,
            connections: HashMap::new(),
            event_rx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections that completed the handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait for the next frame.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let event = self.event_rx.recv().await?;
            if let Some(delivery) = self.on_event(event) {
                return Some(delivery);
            }
        }
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            let event = self.event_rx.try_recv().ok()?;
            if let Some(delivery) = self.on_event(event) {
                return Some(delivery);
            }
        }
    }

    fn on_event(&mut self, event: ConnectionEvent) -> Option<Delivery> {
        match event {
            ConnectionEvent::Handshake { conn_id, address } => {
                debug!("conn-{} handshake complete ({})", conn_id, address);
                self.connections.insert(conn_id, address);
                None
            }
            ConnectionEvent::Frame { conn_id, data } => {
                let from = *self.connections.get(&conn_id)?;
                Some(Delivery { from, frame: data })
            }
            ConnectionEvent::Closed { conn_id } => {
                if let Some(address) = self.connections.remove(&conn_id) {
                    debug!("Inbound link from {} closed", address);
                }
                None
            }
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Accept connections until aborted. Aborting drops every reader with it.
async fn accept_loop(listener: TcpListener, event_tx: mpsc::UnboundedSender<ConnectionEvent>) {
    let mut readers = JoinSet::new();
    let mut next_conn_id: u64 = 1;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    readers.spawn(accept_connection(conn_id, stream, addr, event_tx.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn accept_connection(
    conn_id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Port scanners connect and close without a WebSocket handshake.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };

    debug!("New connection from {} (conn-{})", addr, conn_id);
    connection::read_loop(conn_id, ws_stream, event_tx).await;
}
