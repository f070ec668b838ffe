//! Agent control loop
//!
//! Lifecycle: dial → register → serve frames until the channel closes → wait
//! the reconnect delay → redial. Re-registration starts from scratch (the
//! relay issues a fresh tunnel id). Each request frame is served on its own
//! task so responses can complete out of order; the writer task keeps the
//! outbound side totally ordered.

use crate::forwarder::LocalForwarder;
use burrow_proto::{AgentControl, RelayControl, RelayFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay control-channel URL (ws:// or wss://)
    pub control_url: String,

    /// User token; None registers anonymously
    pub user_token: Option<String>,

    /// Local port the origin listens on
    pub local_port: u16,

    /// Transport keepalive cadence
    pub keepalive_interval: Duration,

    /// Fixed delay before redialing a dropped channel
    pub reconnect_delay: Duration,

    /// Timeout for requests against the local origin
    pub request_timeout: Duration,

    /// Anonymous sessions terminate after this long
    pub anonymous_session_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_url: "ws://localhost:9000".to_string(),
            user_token: None,
            local_port: 8080,
            keepalive_interval: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            anonymous_session_timeout: Duration::from_secs(3600),
        }
    }
}

/// Errors that can occur in the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid control URL '{0}', expected ws:// or wss://")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to build local HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

type Sink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The agent: one control channel, one local origin
pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<LocalForwarder>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let url = url::Url::parse(&config.control_url)
            .map_err(|_| AgentError::InvalidUrl(config.control_url.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AgentError::InvalidUrl(config.control_url.clone()));
        }

        let forwarder = Arc::new(LocalForwarder::new(
            config.local_port,
            config.request_timeout,
        )?);

        Ok(Self { config, forwarder })
    }

    /// Run until interrupted. Anonymous sessions terminate themselves after
    /// the configured timeout.
    pub async fn run(&self) -> Result<(), AgentError> {
        if self.config.user_token.is_some() {
            return self.reconnect_loop().await;
        }

        let session_timeout = self.config.anonymous_session_timeout;
        tokio::select! {
            result = self.reconnect_loop() => result,
            _ = tokio::time::sleep(session_timeout) => {
                info!(
                    "Anonymous session expired after {}s, exiting",
                    session_timeout.as_secs()
                );
                Ok(())
            }
        }
    }

    /// Dial, serve, redial. The loop structure arms exactly one reconnect
    /// timer at a time; a rejection is just another close here, since the
    /// relay may recover (storage back up, stale alias released).
    async fn reconnect_loop(&self) -> Result<(), AgentError> {
        loop {
            match self.connect_and_serve().await {
                Ok(()) => info!("Control channel closed"),
                Err(e) => error!("Control channel error: {}", e),
            }

            info!(
                "Reconnecting in {}s",
                self.config.reconnect_delay.as_secs()
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn connect_and_serve(&self) -> Result<(), AgentError> {
        info!("Dialing {}", self.config.control_url);
        let (ws, _) = connect_async(&self.config.control_url).await?;
        let (sink, mut stream) = ws.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(writer_task(sink, outbound_rx));

        let register = AgentControl::Register {
            user: self.config.user_token.clone(),
            port: Some(self.config.local_port),
        };
        send_frame(&outbound_tx, &register).await?;

        // Wait for the registration ack before serving anything
        let (uuid, alias) = loop {
            let Some(message) = stream.next().await else {
                return Err(AgentError::ConnectionClosed);
            };
            match message? {
                Message::Text(text) => match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(RelayFrame::Control(RelayControl::Registered { uuid, alias })) => {
                        break (uuid, alias);
                    }
                    Ok(RelayFrame::Control(RelayControl::Error { message })) => {
                        return Err(AgentError::RegistrationRejected(message));
                    }
                    Ok(RelayFrame::Request(_)) => {
                        warn!("Request frame before registration ack, dropping");
                    }
                    Err(e) => warn!("Malformed frame ignored: {}", e),
                },
                Message::Close(_) => return Err(AgentError::ConnectionClosed),
                _ => {}
            }
        };
        info!(tunnel_id = %uuid, alias = %alias, "✅ Registered, tunnel is live");

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if outbound_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Err(AgentError::ConnectionClosed);
                    }
                }
                inbound = stream.next() => {
                    let Some(message) = inbound else { return Ok(()) };
                    match message? {
                        Message::Text(text) => self.dispatch(&text, &outbound_tx),
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) => {}
                        _ => {}
                    }
                }
            }
        }
    }

    /// Handle one inbound frame. Requests run on their own task so slow
    /// origins don't block the channel.
    fn dispatch(&self, text: &str, outbound: &mpsc::Sender<Message>) {
        match serde_json::from_str::<RelayFrame>(text) {
            Ok(RelayFrame::Request(request)) => {
                debug!(id = request.id, method = %request.method, path = %request.path, "Request frame");
                let forwarder = self.forwarder.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = forwarder.handle(request).await;
                    match serde_json::to_string(&response) {
                        Ok(json) => {
                            let _ = outbound.send(Message::Text(json.into())).await;
                        }
                        Err(e) => error!("Failed to encode response frame: {}", e),
                    }
                });
            }
            Ok(RelayFrame::Control(RelayControl::Error { message })) => {
                warn!("Relay error: {}", message);
            }
            Ok(RelayFrame::Control(RelayControl::Registered { .. })) => {}
            Err(e) => {
                // Best-effort 500 keyed to the offending id, when one parses
                if let Some(id) = extract_id(text) {
                    warn!(id = id, "Malformed request frame: {}", e);
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        let response = crate::forwarder::internal_error_response(id);
                        if let Ok(json) = serde_json::to_string(&response) {
                            let _ = outbound.send(Message::Text(json.into())).await;
                        }
                    });
                } else {
                    warn!("Malformed frame ignored: {}", e);
                }
            }
        }
    }
}

/// Pull a numeric id out of an otherwise unparseable frame
fn extract_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}

async fn send_frame<T: serde::Serialize>(
    tx: &mpsc::Sender<Message>,
    frame: &T,
) -> Result<(), AgentError> {
    let json = serde_json::to_string(frame)?;
    tx.send(Message::Text(json.into()))
        .await
        .map_err(|_| AgentError::ConnectionClosed)
}

/// Drain outbound messages into the socket; one writer keeps the send half
/// ordered.
async fn writer_task(mut sink: Sink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!("Control channel send error: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_url() {
        let config = AgentConfig {
            control_url: "https://relay.example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_rejects_garbage_url() {
        let config = AgentConfig {
            control_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_accepts_ws_and_wss() {
        for url in ["ws://localhost:9000", "wss://tunnel.example.com:9000"] {
            let config = AgentConfig {
                control_url: url.to_string(),
                ..Default::default()
            };
            assert!(Agent::new(config).is_ok(), "rejected {}", url);
        }
    }

    #[test]
    fn test_extract_id() {
        assert_eq!(extract_id(r#"{"id":42,"method":7}"#), Some(42));
        assert_eq!(extract_id(r#"{"method":"GET"}"#), None);
        assert_eq!(extract_id("not json"), None);
        assert_eq!(extract_id(r#"{"id":"not a number"}"#), None);
    }

    #[test]
    fn test_default_intervals() {
        let config = AgentConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.anonymous_session_timeout, Duration::from_secs(3600));
    }
}
