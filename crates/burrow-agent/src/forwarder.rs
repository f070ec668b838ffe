//! Local request re-issue
//!
//! Each request frame becomes an HTTP request against
//! `http://localhost:<port><path>`. The origin's response is taken verbatim
//! regardless of status; only a failure of the local call itself synthesizes
//! a 500. Response bodies are classified on this side: binary content types
//! travel as the base64 envelope, JSON decodes to a document when it can, and
//! everything else goes back as a UTF-8 string.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use burrow_proto::{
    is_binary_content_type, BinaryEnvelope, Body, TunnelRequest, TunnelResponse,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors from a single local re-issue. All of them collapse into the
/// synthesized 500 on the wire.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid multipart part: {0}")]
    InvalidPart(String),

    #[error("Invalid base64 in request body: {0}")]
    BadBase64(#[from] base64::DecodeError),

    #[error("Failed to serialize request body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("Local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Re-issues request frames against the local origin
pub struct LocalForwarder {
    client: reqwest::Client,
    port: u16,
}

impl LocalForwarder {
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, port })
    }

    /// Handle one request frame. Never errors outward: when the local call
    /// itself fails, the frame gets a synthesized 500 instead.
    pub async fn handle(&self, request: TunnelRequest) -> TunnelResponse {
        let id = request.id;
        match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(id = id, "Local request failed: {}", e);
                internal_error_response(id)
            }
        }
    }

    async fn forward(&self, request: TunnelRequest) -> Result<TunnelResponse, ForwarderError> {
        let id = request.id;
        let url = format!("http://localhost:{}{}", self.port, request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwarderError::InvalidMethod(request.method.clone()))?;

        debug!(id = id, method = %method, url = %url, "Forwarding to local origin");

        let multipart = !request.files.is_empty();
        let headers = build_headers(&request.headers, multipart);
        let mut builder = self.client.request(method, &url).headers(headers);

        if multipart {
            // Rebuild the multipart body from the non-file fields and the
            // file parts; the client recomputes the boundary content type.
            let mut form = Form::new();
            if let Some(Body::Json(serde_json::Value::Object(fields))) = request.body {
                for (name, value) in fields {
                    let text = match value {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    form = form.text(name, text);
                }
            }
            for part in request.files {
                let piece = Part::bytes(part.data)
                    .file_name(part.filename)
                    .mime_str(&part.mime)
                    .map_err(|e| ForwarderError::InvalidPart(e.to_string()))?;
                form = form.part(part.field, piece);
            }
            builder = builder.multipart(form);
        } else if let Some(body) = request.body {
            builder = match body {
                Body::Binary(BinaryEnvelope::Binary { data }) => {
                    builder.body(STANDARD.decode(&data)?)
                }
                Body::Json(value) => builder.body(serde_json::to_vec(&value)?),
                Body::Text(text) => builder.body(text),
            };
        }

        // The origin's status is forwarded verbatim, never rejected here
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let bytes = response.bytes().await?;

        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let body = classify_body(&bytes, &content_type);

        Ok(TunnelResponse {
            id,
            status: Some(status),
            headers,
            body,
        })
    }
}

/// Copy the frame's headers onto the local request, dropping anything the
/// client must recompute.
fn build_headers(headers: &HashMap<String, String>, multipart: bool) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let (Ok(parsed_name), Ok(parsed_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!("Skipping unrepresentable header: {}", name);
            continue;
        };
        map.insert(parsed_name, parsed_value);
    }

    map.remove(CONTENT_LENGTH);
    if multipart {
        // The rebuilt multipart body carries its own boundary
        map.remove(CONTENT_TYPE);
    }
    map
}

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

/// Classify origin response bytes into the wire body
pub(crate) fn classify_body(bytes: &[u8], content_type: &str) -> Option<Body> {
    if bytes.is_empty() {
        return None;
    }

    if is_binary_content_type(content_type) {
        return Some(Body::binary(bytes));
    }

    if content_type.contains("application/json") {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return Some(Body::Json(value));
        }
    }

    Some(Body::Text(String::from_utf8_lossy(bytes).into_owned()))
}

/// The 500 frame sent when the local call itself fails
pub(crate) fn internal_error_response(id: u64) -> TunnelResponse {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());

    TunnelResponse {
        id,
        status: Some(500),
        headers,
        body: Some(Body::Json(
            serde_json::json!({"error": "Internal server error"}),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_empty_body() {
        assert!(classify_body(b"", "text/plain").is_none());
    }

    #[test]
    fn test_classify_binary_roundtrips() {
        let payload: Vec<u8> = (0..=255).collect();
        let body = classify_body(&payload, "image/png").unwrap();

        let decoded = body.as_binary().unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_classify_pdf_is_binary() {
        let body = classify_body(b"%PDF-1.7", "application/pdf").unwrap();
        assert!(body.as_binary().is_some());
    }

    #[test]
    fn test_classify_json_decodes_to_document() {
        let body = classify_body(br#"{"y":2}"#, "application/json").unwrap();
        match body {
            Body::Json(value) => assert_eq!(value["y"], 2),
            other => panic!("expected document, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_invalid_json_stays_text() {
        let body = classify_body(b"oops not json", "application/json").unwrap();
        assert_eq!(body, Body::Text("oops not json".to_string()));
    }

    #[test]
    fn test_classify_html_is_text() {
        let body = classify_body(b"<html></html>", "text/html; charset=utf-8").unwrap();
        assert_eq!(body, Body::Text("<html></html>".to_string()));
    }

    #[test]
    fn test_internal_error_shape() {
        let response = internal_error_response(42);

        assert_eq!(response.id, 42);
        assert_eq!(response.status, Some(500));
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "application/json"
        );
        match response.body.unwrap() {
            Body::Json(value) => assert_eq!(value["error"], "Internal server error"),
            other => panic!("expected json body, got {:?}", other),
        }
    }

    #[test]
    fn test_build_headers_drops_content_length() {
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "123".to_string());
        headers.insert("x-custom".to_string(), "kept".to_string());

        let map = build_headers(&headers, false);
        assert!(map.get(CONTENT_LENGTH).is_none());
        assert_eq!(map.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_build_headers_multipart_drops_content_type() {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "multipart/form-data; boundary=xyz".to_string(),
        );

        let map = build_headers(&headers, true);
        assert!(map.get(CONTENT_TYPE).is_none());

        // Non-multipart requests keep their content type
        let map = build_headers(&headers, false);
        assert!(map.get(CONTENT_TYPE).is_some());
    }

    #[test]
    fn test_build_headers_skips_unrepresentable() {
        let mut headers = HashMap::new();
        headers.insert("bad header name".to_string(), "v".to_string());
        headers.insert("good".to_string(), "v".to_string());

        let map = build_headers(&headers, false);
        assert_eq!(map.len(), 1);
        assert!(map.get("good").is_some());
    }
}
