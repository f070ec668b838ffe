//! The burrow relay
//!
//! Accepts public HTTPS requests on wildcard subdomains of a base domain and
//! forwards each one over a persistent control channel to the agent that
//! registered the subdomain. Three listeners make up the relay:
//!
//! - the **edge** (HTTP): resolves the host to a tunnel, frames the request,
//!   and waits for the correlated response
//! - the **tunnel endpoint** (WebSocket): registration, liveness and
//!   response demultiplexing for connected agents
//! - the **dashboard** (WebSocket): pushes the set of live public URLs to
//!   observers

pub mod alias;
pub mod config;
pub mod control;
pub mod dashboard;
pub mod edge;
pub mod pending;
pub mod registry;

pub use alias::{AliasAllocator, ANONYMOUS_USER};
pub use config::RelayConfig;
pub use control::ControlServer;
pub use dashboard::{DashboardBroadcaster, DashboardServer};
pub use pending::PendingRequests;
pub use registry::{Tunnel, TunnelRegistry};
