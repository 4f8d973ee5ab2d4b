//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur while publishing through a library transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport endpoint is unreachable (connection refused, no route).
    #[error("transport unavailable at {endpoint}: {reason}")]
    Unavailable {
        /// The endpoint that could not be reached.
        endpoint: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The remote API rejected the credential.
    #[error("authorization rejected by the library API (HTTP {status})")]
    Authorization {
        /// The rejecting HTTP status (401 or 403).
        status: u16,
    },

    /// A by-name collection lookup matched no collection.
    #[error("no collection named '{name}' found in the library")]
    CollectionNotFound {
        /// The name that matched nothing.
        name: String,
    },

    /// A by-name collection lookup matched more than one collection.
    ///
    /// Ambiguity is an error, not a silent first-match.
    #[error("collection name '{name}' is ambiguous: {matches} collections share it")]
    AmbiguousCollectionName {
        /// The ambiguous name.
        name: String,
        /// How many collections share the name.
        matches: usize,
    },

    /// Attachment upload failed after the item itself was created.
    ///
    /// Partial success: the item exists and must not be rolled back.
    #[error("attachment upload failed for item {item_key}: {reason}")]
    AttachmentFailed {
        /// The already-created item.
        item_key: String,
        /// Human-readable cause.
        reason: String,
    },

    /// Network-level HTTP failure.
    #[error("HTTP error calling {url}: {source}")]
    Http {
        /// The URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The remote side answered with something the protocol does not allow.
    #[error("protocol error: {context}")]
    Protocol {
        /// What was expected and what happened instead.
        context: String,
    },
}

impl TransportError {
    /// Creates an unavailable-endpoint error.
    pub fn unavailable(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Creates an HTTP error with its URL context.
    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
        }
    }

    /// Creates an attachment-failed error.
    pub fn attachment_failed(item_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AttachmentFailed {
            item_key: item_key.into(),
            reason: reason.into(),
        }
    }

    /// True when the failure left a created item behind (partial success).
    #[must_use]
    pub fn is_partial_success(&self) -> bool {
        matches!(self, Self::AttachmentFailed { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_collection_display() {
        let err = TransportError::AmbiguousCollectionName {
            name: "Reading".to_string(),
            matches: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("Reading"), "Expected name in: {msg}");
        assert!(msg.contains("ambiguous"), "Expected 'ambiguous' in: {msg}");
    }

    #[test]
    fn test_collection_not_found_display() {
        let err = TransportError::CollectionNotFound {
            name: "Ghost".to_string(),
        };
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_attachment_failed_is_partial_success() {
        let err = TransportError::attachment_failed("ABCD1234", "storage quota exceeded");
        assert!(err.is_partial_success());
        assert!(!TransportError::protocol("x").is_partial_success());
    }

    #[test]
    fn test_unavailable_display_includes_endpoint() {
        let err = TransportError::unavailable("http://127.0.0.1:23119", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("23119"), "Expected port in: {msg}");
        assert!(msg.contains("refused"), "Expected reason in: {msg}");
    }
}
