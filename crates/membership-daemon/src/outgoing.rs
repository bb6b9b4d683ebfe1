//! Outgoing links.
//!
//! Each [`WsLink`] owns a bounded queue drained by a writer task. The
//! writer connects, sends our handshake, then forwards frames in order. If
//! the socket drops it reconnects with exponential backoff; frames queue up
//! meanwhile until the high-water mark rejects them.

use futures::{SinkExt, StreamExt};
use membership_core::protocol::Handshake;
use membership_core::transport::{Link, Result, Transport, TransportError};
use membership_core::Endpoint;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// WebSocket transport. Clones share the same writer tasks.
#[derive(Clone, Default)]
pub struct WsTransport {
    reconnect: ReconnectConfig,
    writers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WsTransport {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        Self {
            reconnect,
            writers: Arc::default(),
        }
    }

    /// Writer tasks still running.
    pub fn active_writers(&self) -> usize {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.retain(|task| !task.is_finished());
        writers.len()
    }

    /// Wait up to `linger` for writers of dropped links to flush, then
    /// abort whatever is left.
    pub async fn flush(&self, linger: Duration) {
        let writers: Vec<JoinHandle<()>> = {
            let mut guard = self.writers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if writers.is_empty() {
            return;
        }

        let aborts: Vec<_> = writers.iter().map(JoinHandle::abort_handle).collect();
        if timeout(linger, futures::future::join_all(writers)).await.is_err() {
            warn!("Linger expired with {} link(s) still flushing", aborts.len());
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Transport for WsTransport {
    fn connect(
        &mut self,
        endpoint: Endpoint,
        reply_to: Endpoint,
        send_hwm: usize,
    ) -> Result<Box<dyn Link>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (tx, rx) = mpsc::channel(send_hwm.max(1));
        let task = runtime.spawn(run_writer(endpoint, reply_to, rx, self.reconnect.clone()));

        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.retain(|task| !task.is_finished());
        writers.push(task);

        Ok(Box::new(WsLink { endpoint, tx }))
    }
}

/// Sending half of one outgoing link.
pub struct WsLink {
    endpoint: Endpoint,
    tx: mpsc::Sender<Vec<u8>>,
}

impl WsLink {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Link for WsLink {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::WouldBlock,
            TrySendError::Closed(_) => TransportError::Disconnected,
        })
    }
}

/// Connect, handshake and forward frames until the link is dropped and
/// its queue is drained.
async fn run_writer(
    endpoint: Endpoint,
    reply_to: Endpoint,
    mut rx: mpsc::Receiver<Vec<u8>>,
    config: ReconnectConfig,
) {
    let url = format!("ws://{}", endpoint);
    let handshake = Handshake::new(reply_to).to_json();
    let mut attempt: u32 = 0;

    loop {
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                if rx.is_closed() {
                    debug!("Giving up on {}: link dropped while unreachable", endpoint);
                    return;
                }
                attempt += 1;
                let delay = calculate_backoff(attempt, &config);
                debug!(
                    "Connect to {} failed ({}), retrying in {:?} (attempt {})",
                    endpoint, e, delay, attempt
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let (mut write, mut read) = ws_stream.split();
        if let Err(e) = write.send(Message::Binary(handshake.clone().into())).await {
            warn!("Handshake with {} failed: {}", endpoint, e);
            attempt += 1;
            tokio::time::sleep(calculate_backoff(attempt, &config)).await;
            continue;
        }
        if attempt > 0 {
            info!("Reconnected to {} after {} attempt(s)", endpoint, attempt);
        }
        attempt = 0;

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Binary(frame.into())).await {
                            warn!("Send to {} failed: {}", endpoint, e);
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        debug!("Link to {} closed", endpoint);
                        return;
                    }
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        debug!("{} closed the connection", endpoint);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Backoff calculation ====================

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 250ms, 500ms, 1s, 2s, 4s, 5s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(250));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(500));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(6, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(20, &config), Duration::from_secs(5));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 3.0,
        };

        // 1s, 3s, 9s, 10s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    // ==================== Links ====================

    #[test]
    fn test_connect_outside_runtime_fails() {
        let mut transport = WsTransport::default();
        let result = transport.connect(
            "127.0.0.1:9".parse().unwrap(),
            "127.0.0.1:8".parse().unwrap(),
            4,
        );
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_unreachable_link_hits_high_water_mark() {
        let mut transport = WsTransport::default();
        // Nothing listens on the discard port
        let link = transport
            .connect(
                "127.0.0.1:9".parse().unwrap(),
                "127.0.0.1:8".parse().unwrap(),
                2,
            )
            .unwrap();

        link.send(vec![1]).unwrap();
        link.send(vec![2]).unwrap();
        assert!(matches!(link.send(vec![3]), Err(TransportError::WouldBlock)));

        drop(link);
        transport.flush(Duration::from_secs(10)).await;
        assert_eq!(transport.active_writers(), 0);
    }
}
