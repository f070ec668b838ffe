//! Control-channel frame types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Frames the relay sends to a connected agent.
///
/// Control frames carry a `type` tag; request frames are identified by their
/// numeric `id` and carry no tag, so the wrapper is untagged and control
/// frames are tried first when decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RelayFrame {
    Control(RelayControl),
    Request(TunnelRequest),
}

/// Tagged control messages from relay to agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayControl {
    /// Registration succeeded; the tunnel is live under `alias`
    Registered { uuid: String, alias: String },
    /// Registration failed; the relay closes the channel after sending this
    Error { message: String },
}

/// Frames an agent sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AgentFrame {
    Control(AgentControl),
    Response(TunnelResponse),
}

/// Tagged control messages from agent to relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentControl {
    /// Registration. Both fields are optional: an anonymous agent sends a
    /// bare `{"type":"register"}` and the relay fabricates an identity.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
}

/// A public HTTP request, framed for transport to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRequest {
    /// Unique within the tunnel for the lifetime of the transaction
    pub id: u64,
    pub method: String,
    /// Path plus query as seen by the edge
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    /// Uploaded parts of a multipart request; `body` holds the non-file fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FilePart>,
}

/// The origin's response, framed for transport back to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelResponse {
    /// Matches the `id` of the request frame
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

/// A request or response body.
///
/// Binary payloads travel as a tagged base64 envelope; everything else is
/// either a UTF-8 string or a JSON document (parsed JSON bodies and decoded
/// form fields). Decoding tries the envelope first since it is the only
/// shape with a fixed structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Body {
    Binary(BinaryEnvelope),
    Text(String),
    Json(serde_json::Value),
}

/// The `{"type":"binary","data":"<base64>"}` envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BinaryEnvelope {
    Binary { data: String },
}

impl Body {
    /// Wrap raw bytes in the base64 envelope
    pub fn binary(bytes: &[u8]) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Body::Binary(BinaryEnvelope::Binary {
            data: STANDARD.encode(bytes),
        })
    }

    /// Decode the envelope, if this body is one
    pub fn as_binary(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        match self {
            Body::Binary(BinaryEnvelope::Binary { data }) => Some(STANDARD.decode(data)),
            _ => None,
        }
    }
}

/// One uploaded part of a multipart request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePart {
    /// Form field name
    pub field: String,
    /// Original filename as sent by the client
    pub filename: String,
    /// MIME type of the part
    pub mime: String,
    /// Part contents, base64-encoded on the wire
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Frames the relay sends to dashboard observers. Observers never send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverFrame {
    /// The set of currently-live public URLs, grouped by user
    ActiveUrls { data: BTreeMap<String, Vec<String>> },
}

// Serde codec for byte buffers carried as base64 strings inside JSON text
// frames.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
