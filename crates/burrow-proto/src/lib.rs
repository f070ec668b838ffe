//! Protocol types for the burrow control channel
//!
//! The control channel carries JSON text frames in both directions. Frames
//! with a `type` field are control messages (registration, errors, dashboard
//! snapshots); request and response frames carry no tag and are correlated by
//! their numeric `id`.

pub mod classify;
pub mod frames;
mod id;

pub use classify::is_binary_content_type;
pub use frames::{
    AgentControl, AgentFrame, BinaryEnvelope, Body, FilePart, ObserverFrame, RelayControl,
    RelayFrame, TunnelRequest, TunnelResponse,
};
pub use id::next_request_id;
