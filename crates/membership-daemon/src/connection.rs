//! Inbound peer connections.
//!
//! Every remote agent opens one WebSocket per link and starts with a
//! handshake frame naming its listen address. After that the connection
//! only carries protocol frames in one direction, towards us.

use futures::StreamExt;
use membership_core::protocol::{Handshake, MAX_MESSAGE_SIZE};
use membership_core::Endpoint;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by an inbound connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The remote side announced where it listens
    Handshake { conn_id: u64, address: Endpoint },
    /// A protocol frame
    Frame { conn_id: u64, data: Vec<u8> },
    /// Connection was closed
    Closed { conn_id: u64 },
}

/// Forward every frame of `ws_stream` to `event_tx` until it closes.
pub async fn read_loop(
    conn_id: u64,
    ws_stream: WebSocketStream<TcpStream>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (_, mut read) = ws_stream.split();
    let mut handshaken = false;

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame on conn-{}", conn_id);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Frame on conn-{} exceeds max size ({} > {}), dropping",
                        conn_id,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                if !handshaken {
                    match Handshake::from_json(&data) {
                        Some(handshake) => {
                            if handshake.should_warn_version() {
                                warn!(
                                    "conn-{} speaks transport version {}",
                                    conn_id, handshake.version
                                );
                            }
                            debug!("conn-{} is {}", conn_id, handshake.address);
                            handshaken = true;
                            let _ = event_tx.send(ConnectionEvent::Handshake {
                                conn_id,
                                address: handshake.address,
                            });
                        }
                        None => {
                            warn!("Dropping frame on conn-{} before handshake", conn_id);
                        }
                    }
                    continue;
                }

                if event_tx
                    .send(ConnectionEvent::Frame { conn_id, data })
                    .is_err()
                {
                    break;
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("conn-{} closed", conn_id);
                    }
                    _ => {
                        error!("WebSocket error on conn-{}: {}", conn_id, e);
                    }
                }
                break;
            }
            None => {
                debug!("conn-{} stream ended", conn_id);
                break;
            }
        }
    }

    let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
}
