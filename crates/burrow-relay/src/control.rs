//! Tunnel endpoint: the control-channel side of the relay
//!
//! Each agent connection walks a small state machine: CONNECTED (transport
//! up, waiting for the register frame) → REGISTERING (alias allocation) →
//! ACTIVE (serving requests) → CLOSED (registry entries removed, pending
//! requests aborted). Outbound frames for a tunnel all pass through one
//! writer task so they never interleave on the wire.

use crate::alias::{AliasAllocator, ANONYMOUS_USER};
use crate::dashboard::DashboardBroadcaster;
use crate::registry::{RegistryError, Tunnel, TunnelRegistry};
use burrow_proto::{AgentControl, AgentFrame, RelayControl, RelayFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a connection may sit unregistered before it is dropped
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound queue depth per tunnel
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error)]
enum RegisterError {
    #[error("Connection closed before registration")]
    ConnectionClosed,

    #[error("Expected a register frame, got: {0}")]
    UnexpectedFrame(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Accepts agent connections and runs their tunnel lifecycles
pub struct ControlServer {
    registry: Arc<TunnelRegistry>,
    allocator: Arc<AliasAllocator>,
    dashboard: Arc<DashboardBroadcaster>,
}

impl ControlServer {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        allocator: Arc<AliasAllocator>,
        dashboard: Arc<DashboardBroadcaster>,
    ) -> Self {
        Self {
            registry,
            allocator,
            dashboard,
        }
    }

    /// Accept loop. Each connection gets its own task; a failed TLS or
    /// WebSocket handshake only costs that connection.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> std::io::Result<()> {
        info!("Tunnel endpoint listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Tunnel listener accept error: {}", e);
                    continue;
                }
            };

            debug!("Incoming agent connection from {}", peer_addr);

            let server = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.handshake(tls_stream, peer_addr).await,
                        Err(e) => warn!("TLS handshake failed from {}: {}", peer_addr, e),
                    },
                    None => server.handshake(stream, peer_addr).await,
                }
            });
        }
    }

    async fn handshake<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => {
                info!("Agent connected from {}", peer_addr);
                self.handle_agent(ws, peer_addr).await;
            }
            Err(e) => warn!("WebSocket handshake failed from {}: {}", peer_addr, e),
        }
    }

    /// Drive one agent connection from registration to teardown
    async fn handle_agent<S>(&self, ws: WebSocketStream<S>, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<RelayFrame>(OUTBOUND_QUEUE);
        tokio::spawn(writer_task(sink, outbound_rx));

        // CONNECTED: the first frame must be a register
        let (user, port) = match timeout(REGISTRATION_TIMEOUT, read_register(&mut stream)).await {
            Ok(Ok(registration)) => registration,
            Ok(Err(e)) => {
                warn!("Registration failed from {}: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                warn!("Registration timeout from {}", peer_addr);
                return;
            }
        };

        let user = user.unwrap_or_else(|| ANONYMOUS_USER.to_string());
        let port = port.unwrap_or(0);

        // REGISTERING: allocate an alias and take the registry slot
        let tunnel = match self.register(&user, port, &outbound_tx).await {
            Ok(tunnel) => tunnel,
            Err(message) => {
                error!(user = %user, port = port, "Registration rejected: {}", message);
                let _ = outbound_tx
                    .send(RelayFrame::Control(RelayControl::Error { message }))
                    .await;
                return;
            }
        };

        // ACTIVE
        if tunnel
            .send(RelayFrame::Control(RelayControl::Registered {
                uuid: tunnel.id.to_string(),
                alias: tunnel.alias.clone(),
            }))
            .await
            .is_err()
        {
            self.teardown(&tunnel);
            return;
        }

        self.dashboard.broadcast_now();
        info!(
            tunnel_id = %tunnel.id,
            alias = %tunnel.alias,
            user = %tunnel.user,
            "✅ Tunnel active"
        );

        // Demultiplex inbound frames until the channel closes. The agent's
        // transport keepalive (ping/pong) needs no application-level reply.
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<AgentFrame>(&text) {
                    Ok(AgentFrame::Response(response)) => {
                        // Filter by id before anything else touches the
                        // response; an orphan frame is dropped here.
                        tunnel.pending.complete(response.id, response);
                    }
                    Ok(AgentFrame::Control(AgentControl::Register { .. })) => {
                        warn!(tunnel_id = %tunnel.id, "Duplicate register frame ignored");
                    }
                    Err(e) => {
                        warn!(tunnel_id = %tunnel.id, "Malformed frame ignored: {}", e);
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    debug!(tunnel_id = %tunnel.id, "Close frame received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(tunnel_id = %tunnel.id, "Control channel error: {}", e);
                    break;
                }
            }
        }

        // CLOSED
        self.teardown(&tunnel);
    }

    /// Allocate an alias and insert the tunnel. An insert collision on an
    /// ephemeral alias (two agents racing the same draw) is retried once
    /// with a fresh draw.
    async fn register(
        &self,
        user: &str,
        port: u16,
        outbound: &mpsc::Sender<RelayFrame>,
    ) -> Result<Arc<Tunnel>, String> {
        for attempt in 0..2 {
            let allocated = self
                .allocator
                .allocate(user, port)
                .await
                .map_err(|e| {
                    error!("Alias allocation failed: {}", e);
                    "Registration failed: storage unavailable".to_string()
                })?;

            let tunnel = Arc::new(Tunnel::new(
                Uuid::new_v4(),
                allocated.alias.clone(),
                user.to_string(),
                port,
                outbound.clone(),
            ));

            match self.registry.insert(tunnel.clone()) {
                Ok(()) => return Ok(tunnel),
                Err(RegistryError::AliasInUse(alias)) if !allocated.persisted && attempt == 0 => {
                    warn!(alias = %alias, "Ephemeral alias raced, drawing again");
                }
                Err(RegistryError::AliasInUse(alias)) => {
                    return Err(format!("Alias already in use: {}", alias));
                }
            }
        }

        Err("Registration failed".to_string())
    }

    /// Remove registry entries, abort in-flight requests, notify observers
    fn teardown(&self, tunnel: &Arc<Tunnel>) {
        tunnel.mark_closed();
        self.registry.remove(&tunnel.id);
        tunnel.pending.abort_all();
        self.dashboard.broadcast_now();
        info!(
            tunnel_id = %tunnel.id,
            alias = %tunnel.alias,
            bytes_in = tunnel.bytes_in(),
            bytes_out = tunnel.bytes_out(),
            "Tunnel closed"
        );
    }
}

/// Wait for the register frame. Transport keepalives are allowed before it;
/// any other frame is a protocol violation and closes the connection.
async fn read_register<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
) -> Result<(Option<String>, Option<u16>), RegisterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Control(AgentControl::Register { user, port })) => {
                    return Ok((user, port));
                }
                _ => return Err(RegisterError::UnexpectedFrame(text.to_string())),
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return Err(RegisterError::ConnectionClosed),
            other => return Err(RegisterError::UnexpectedFrame(format!("{:?}", other))),
        }
    }

    Err(RegisterError::ConnectionClosed)
}

/// Serialize and send outbound frames. One writer per tunnel keeps the send
/// half ordered.
async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<RelayFrame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!("Control channel send error: {}", e);
            break;
        }
    }

    let _ = sink.close().await;
    debug!("Writer task ended");
}
