//! Response content-type classification
//!
//! The agent decides whether a response body travels as the base64 binary
//! envelope. The relay never re-classifies; it trusts the envelope tag.

/// Content-type prefixes that always carry binary payloads
const BINARY_PREFIXES: &[&str] = &["image/", "video/", "audio/"];

/// Content-type fragments that mark binary payloads wherever they appear
const BINARY_MARKERS: &[&str] = &["application/octet-stream", "application/pdf"];

/// Whether a response with this content type must be base64-enveloped
pub fn is_binary_content_type(content_type: &str) -> bool {
    BINARY_PREFIXES
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
        || BINARY_MARKERS
            .iter()
            .any(|marker| content_type.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_prefixes() {
        assert!(is_binary_content_type("image/png"));
        assert!(is_binary_content_type("image/svg+xml"));
        assert!(is_binary_content_type("video/mp4"));
        assert!(is_binary_content_type("audio/mpeg"));
    }

    #[test]
    fn test_binary_markers() {
        assert!(is_binary_content_type("application/octet-stream"));
        assert!(is_binary_content_type("application/pdf"));
        assert!(is_binary_content_type(
            "application/pdf; charset=binary"
        ));
    }

    #[test]
    fn test_text_types() {
        assert!(!is_binary_content_type("text/html"));
        assert!(!is_binary_content_type("text/plain; charset=utf-8"));
        assert!(!is_binary_content_type("application/json"));
        assert!(!is_binary_content_type("application/x-www-form-urlencoded"));
    }

    #[test]
    fn test_prefix_must_anchor() {
        // "image/" must be a prefix, not a substring
        assert!(!is_binary_content_type("text/x-image/descriptor"));
    }
}
