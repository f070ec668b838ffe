//! Dashboard fan-out
//!
//! Observers connect over WebSocket and receive the set of currently-live
//! public URLs: a snapshot on connect, a broadcast every five seconds, and an
//! immediate refresh whenever a tunnel registers or closes. Observers never
//! send; anything inbound except close is ignored.

use crate::registry::TunnelRegistry;
use burrow_proto::ObserverFrame;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Broadcast cadence
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Pushes active-URL snapshots to every connected observer
pub struct DashboardBroadcaster {
    registry: Arc<TunnelRegistry>,
    observers: DashMap<u64, mpsc::UnboundedSender<Message>>,
    next_observer_id: AtomicU64,
}

impl DashboardBroadcaster {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self {
            registry,
            observers: DashMap::new(),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Build the snapshot frame from the live registry
    fn snapshot_frame(&self) -> Option<Message> {
        let frame = ObserverFrame::ActiveUrls {
            data: self.registry.snapshot_live_urls(),
        };
        match serde_json::to_string(&frame) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!("Failed to serialize dashboard snapshot: {}", e);
                None
            }
        }
    }

    /// Send the current snapshot to every open observer, evicting the dead
    pub fn broadcast_now(&self) {
        let Some(message) = self.snapshot_frame() else {
            return;
        };

        self.observers
            .retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.insert(id, tx);
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.observers.remove(&id);
    }

    /// Process-wide broadcast timer
    pub async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.broadcast_now();
        }
    }
}

/// Accepts observer connections
pub struct DashboardServer {
    broadcaster: Arc<DashboardBroadcaster>,
}

impl DashboardServer {
    pub fn new(broadcaster: Arc<DashboardBroadcaster>) -> Self {
        Self { broadcaster }
    }

    pub async fn run(
        self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> std::io::Result<()> {
        info!("Dashboard listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Dashboard listener accept error: {}", e);
                    continue;
                }
            };

            let broadcaster = self.broadcaster.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            handle_observer(broadcaster, tls_stream, peer_addr).await
                        }
                        Err(e) => warn!("TLS handshake failed from {}: {}", peer_addr, e),
                    },
                    None => handle_observer(broadcaster, stream, peer_addr).await,
                }
            });
        }
    }
}

async fn handle_observer<S>(
    broadcaster: Arc<DashboardBroadcaster>,
    stream: S,
    peer_addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws: WebSocketStream<S> = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Observer handshake failed from {}: {}", peer_addr, e);
            return;
        }
    };

    info!("Observer connected from {}", peer_addr);
    let (mut sink, mut source) = ws.split();

    // Snapshot on connect, before the observer joins the broadcast set
    if let Some(snapshot) = broadcaster.snapshot_frame() {
        if sink.send(snapshot).await.is_err() {
            return;
        }
    }

    let (observer_id, mut rx) = broadcaster.subscribe();

    loop {
        tokio::select! {
            broadcast = rx.recv() => {
                let Some(message) = broadcast else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Observers never send; drop anything else
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    broadcaster.unsubscribe(observer_id);
    debug!("Observer {} disconnected", peer_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tunnel;
    use uuid::Uuid;

    fn registry_with_tunnel(alias: &str, user: &str) -> Arc<TunnelRegistry> {
        let registry = Arc::new(TunnelRegistry::new("example.com"));
        let (tx, _rx) = mpsc::channel(8);
        registry
            .insert(Arc::new(Tunnel::new(
                Uuid::new_v4(),
                alias.to_string(),
                user.to_string(),
                3000,
                tx,
            )))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_snapshot_frame_contains_live_urls() {
        let registry = registry_with_tunnel("web-0123456789ab", "tok_a");
        let broadcaster = DashboardBroadcaster::new(registry);

        let frame = broadcaster.snapshot_frame().unwrap();
        let text = match frame {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {:?}", other),
        };

        assert!(text.contains(r#""type":"active_urls"#));
        assert!(text.contains("https://web-0123456789ab.example.com/"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let registry = registry_with_tunnel("app-aaaaaaaaaaaa", "tok_a");
        let broadcaster = DashboardBroadcaster::new(registry);

        let (_id1, mut rx1) = broadcaster.subscribe();
        let (_id2, mut rx2) = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 2);

        broadcaster.broadcast_now();

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dead_observers_evicted_on_broadcast() {
        let registry = registry_with_tunnel("app-aaaaaaaaaaaa", "tok_a");
        let broadcaster = DashboardBroadcaster::new(registry);

        let (_id1, rx1) = broadcaster.subscribe();
        let (_id2, _rx2) = broadcaster.subscribe();
        drop(rx1);

        broadcaster.broadcast_now();
        assert_eq!(broadcaster.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let registry = Arc::new(TunnelRegistry::new("example.com"));
        let broadcaster = DashboardBroadcaster::new(registry);

        let (id, _rx) = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 1);

        broadcaster.unsubscribe(id);
        assert_eq!(broadcaster.observer_count(), 0);
    }
}
