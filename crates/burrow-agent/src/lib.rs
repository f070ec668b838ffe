//! The burrow agent
//!
//! Dials the relay's control channel, registers a local port, and serves
//! request frames by re-issuing each one against the local origin. Responses
//! travel back on the same channel, correlated by id. The agent reconnects
//! automatically when the channel drops.

pub mod agent;
pub mod forwarder;

pub use agent::{Agent, AgentConfig, AgentError};
pub use forwarder::LocalForwarder;
