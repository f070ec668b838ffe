//! Edge dispatcher: the public HTTP side of the relay
//!
//! Any method on any path is accepted. The Host header picks the tunnel
//! (custom-domain map first, then the first subdomain label), the request is
//! framed onto the tunnel's control channel, and the handler parks on a
//! pending slot until the correlated response arrives, the deadline expires,
//! or the tunnel closes.

use crate::registry::TunnelRegistry;
use axum::body::{to_bytes, Body as ResponseBody};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use burrow_db::{RequestLog, Store};
use burrow_proto::{
    next_request_id, BinaryEnvelope, Body, FilePart, RelayFrame, TunnelRequest, TunnelResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Shared dispatcher state
pub struct EdgeState {
    pub registry: Arc<TunnelRegistry>,
    pub store: Store,
    /// Exact host → alias overrides, consulted before subdomain parsing
    pub custom_domains: HashMap<String, String>,
    /// How long to wait for the agent before replying 504
    pub request_deadline: Duration,
}

#[derive(Debug, Error)]
enum BodyError {
    #[error("Failed to buffer request body: {0}")]
    Buffer(String),

    #[error("Malformed multipart body: {0}")]
    Multipart(String),
}

#[derive(Debug, Error)]
enum RenderError {
    #[error("Invalid base64 in binary envelope: {0}")]
    BadBase64(#[from] base64::DecodeError),

    #[error("Failed to serialize response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to build response: {0}")]
    Http(#[from] axum::http::Error),
}

/// Build the public router: one fallback handler takes everything. Bodies
/// are fully buffered (one frame per transaction), so the extractor limit
/// is lifted.
pub fn router(state: Arc<EdgeState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<EdgeState>>, request: Request) -> Response {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid URL");
    };

    let alias = resolve_alias(&state.custom_domains, &host);

    let Some(tunnel) = state.registry.lookup_by_alias(&alias) else {
        debug!(host = %host, alias = %alias, "No tunnel for host");
        return plain_response(StatusCode::BAD_REQUEST, "Invalid URL");
    };

    if !tunnel.is_open() {
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Client not connected");
    }

    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let forwarded_port = request
        .headers()
        .get("x-forwarded-port")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(0);
    let headers = collect_headers(request.headers());
    let content_type = headers.get("content-type").cloned().unwrap_or_default();

    let (body, files, body_len) = match read_body(request, &content_type).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(alias = %alias, "Failed to read request body: {}", e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    // Serialized headers plus body, the request's share of the byte counters
    let bytes_in = serde_json::to_vec(&headers).map(|v| v.len() as u64).unwrap_or(0) + body_len;

    // Fresh id within the tunnel; redraw on an in-flight collision
    let (id, receiver) = loop {
        let id = next_request_id();
        if let Some(rx) = tunnel.pending.register(id) {
            break (id, rx);
        }
    };

    let frame = RelayFrame::Request(TunnelRequest {
        id,
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
        files,
    });

    if tunnel.send(frame).await.is_err() {
        tunnel.pending.cancel(id);
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Client not connected");
    }
    tunnel.add_bytes_in(bytes_in);

    let response_frame = match timeout(state.request_deadline, receiver).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => {
            // Tunnel closed with this request still pending
            debug!(alias = %alias, id = id, "Tunnel closed mid-flight");
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Client not connected");
        }
        Err(_) => {
            tunnel.pending.cancel(id);
            warn!(alias = %alias, id = id, "Agent response deadline expired");
            return plain_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout");
        }
    };

    let (response, status_code, bytes_out) = match render_response(response_frame) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!(alias = %alias, id = id, "Failed to render response: {}", e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };
    tunnel.add_bytes_out(bytes_out);

    // Request log is best-effort: a storage failure never fails the request
    let entry = RequestLog {
        alias,
        port: forwarded_port,
        method,
        path,
        status_code: i32::from(status_code),
        bytes_in: bytes_in as i64,
        bytes_out: bytes_out as i64,
    };
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.log_request(entry).await {
            warn!("Failed to log request: {}", e);
        }
    });

    response
}

/// Resolve the Host header to an alias: custom-domain map first, then the
/// first label of the host. Aliases are matched case-sensitively (they are
/// always lowercase).
fn resolve_alias(custom_domains: &HashMap<String, String>, host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    if let Some(alias) = custom_domains.get(host) {
        return alias.clone();
    }
    host.split('.').next().unwrap_or(host).to_string()
}

/// Flatten the header map into single string values; repeated headers are
/// joined with ", ". Names come out lowercase.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// Buffer and parse the request body per its content type
async fn read_body(
    request: Request,
    content_type: &str,
) -> Result<(Option<Body>, Vec<FilePart>, u64), BodyError> {
    if content_type.starts_with("multipart/form-data") {
        return read_multipart(request).await;
    }

    let bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| BodyError::Buffer(e.to_string()))?;
    let body_len = bytes.len() as u64;

    Ok((parse_body(&bytes, content_type), Vec::new(), body_len))
}

/// Split a multipart request into its non-file fields and file parts
async fn read_multipart(
    request: Request,
) -> Result<(Option<Body>, Vec<FilePart>, u64), BodyError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| BodyError::Multipart(e.to_string()))?;

    let mut fields = serde_json::Map::new();
    let mut files = Vec::new();
    let mut body_len: u64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BodyError::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if let Some(filename) = field.file_name().map(str::to_owned) {
            let mime = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| BodyError::Multipart(e.to_string()))?;
            body_len += data.len() as u64;
            files.push(FilePart {
                field: name,
                filename,
                mime,
                data: data.to_vec(),
            });
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| BodyError::Multipart(e.to_string()))?;
            body_len += text.len() as u64;
            fields.insert(name, serde_json::Value::String(text));
        }
    }

    let body = if fields.is_empty() {
        None
    } else {
        Some(Body::Json(serde_json::Value::Object(fields)))
    };

    Ok((body, files, body_len))
}

/// Parse a non-multipart body: urlencoded forms and JSON become documents,
/// everything else is a UTF-8 string or a binary envelope.
fn parse_body(bytes: &[u8], content_type: &str) -> Option<Body> {
    if bytes.is_empty() {
        return None;
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let fields: serde_json::Map<String, serde_json::Value> =
            url::form_urlencoded::parse(bytes)
                .into_owned()
                .map(|(key, value)| (key, serde_json::Value::String(value)))
                .collect();
        return Some(Body::Json(serde_json::Value::Object(fields)));
    }

    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return Some(Body::Json(value));
        }
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => Some(Body::Text(text.to_string())),
        Err(_) => Some(Body::binary(bytes)),
    }
}

/// Turn a response frame into the HTTP response, returning the status and
/// transmitted body length for logging.
fn render_response(frame: TunnelResponse) -> Result<(Response, u16, u64), RenderError> {
    let status =
        StatusCode::from_u16(frame.status.unwrap_or(200)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let content_type = frame
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| "application/json".to_string());

    let body_bytes = render_body(frame.body, &content_type)?;
    let bytes_out = body_bytes.len() as u64;

    let content_type_value = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/json"));

    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_value)
        .body(ResponseBody::from(body_bytes))?;

    Ok((response, status.as_u16(), bytes_out))
}

/// Materialize the body bytes to send to the public client
fn render_body(body: Option<Body>, content_type: &str) -> Result<Vec<u8>, RenderError> {
    match body {
        None => Ok(Vec::new()),
        Some(Body::Binary(BinaryEnvelope::Binary { data })) => Ok(STANDARD.decode(&data)?),
        Some(Body::Json(value)) => Ok(serde_json::to_vec(&value)?),
        Some(Body::Text(text)) => {
            if content_type.contains("application/json") {
                Ok(serde_json::to_vec(&text)?)
            } else {
                Ok(text.into_bytes())
            }
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(ResponseBody::from(message.to_string()))
        .unwrap_or_default()
}
