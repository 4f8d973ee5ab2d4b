//! Library transports for publishing captured items.
//!
//! Two concrete transports implement [`LibraryTransport`]:
//!
//! - [`ConnectorTransport`] - talks to the local Zotero desktop application
//!   on its connector port; fast and host-app-aware, but only works when the
//!   application is running.
//! - [`ApiTransport`] - talks to the Zotero Web API with a bearer credential;
//!   works anywhere, but attachment upload is a multi-round-trip protocol.
//!
//! The transports diverge in attachment semantics, so the trait exposes an
//! explicit capability query ([`LibraryTransport::supports_direct_attachment`])
//! and the orchestrator branches on capability, never on transport identity.

mod api;
mod connector;
mod error;
mod fileserver;

pub use api::{ApiClient, ApiTransport};
pub use connector::ConnectorTransport;
pub use error::TransportError;
pub(crate) use fileserver::PdfServer;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::capture::{CaptureArtifact, CaptureTarget};
use crate::metadata::ItemMetadata;

/// Target collection reference, resolved to a concrete key once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionRef {
    /// A collection key, used as-is.
    ByKey(String),
    /// A collection name, resolved by exact-match lookup. Zero or multiple
    /// matches are errors.
    ByName(String),
}

/// Which transport published the item; carried on the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local companion-application connector.
    Connector,
    /// Remote Web API.
    Api,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connector => write!(f, "connector"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// Publish operations over one concrete transport.
///
/// # Object Safety
///
/// Uses `async_trait` to support `Box<dyn LibraryTransport>` dispatch in the
/// orchestrator; Rust 2024 native async traits are not object-safe.
#[async_trait]
pub trait LibraryTransport: Send + Sync {
    /// The transport kind, for the final result and logs.
    fn kind(&self) -> TransportKind;

    /// True when this transport stores the attachment in the same protocol
    /// exchange that creates the item, with the host application indexing it.
    fn supports_direct_attachment(&self) -> bool;

    /// Cheap reachability probe used by transport selection.
    async fn is_available(&self) -> bool;

    /// Creates the bibliographic item and returns its key.
    async fn create_item(
        &self,
        metadata: &ItemMetadata,
        target: &CaptureTarget,
    ) -> Result<String, TransportError>;

    /// Attaches the captured PDF.
    ///
    /// With `parent` set, the attachment is filed under that item. Transports
    /// that support direct attachment also accept `parent = None` to publish
    /// a standalone attachment (the existing-PDF input path).
    async fn attach_pdf(
        &self,
        parent: Option<&str>,
        artifact: &CaptureArtifact,
        metadata: &ItemMetadata,
    ) -> Result<String, TransportError>;

    /// Resolves a collection reference to a concrete collection key.
    ///
    /// # Errors
    ///
    /// [`TransportError::CollectionNotFound`] for zero by-name matches and
    /// [`TransportError::AmbiguousCollectionName`] for more than one.
    async fn resolve_collection(&self, collection: &CollectionRef)
    -> Result<String, TransportError>;

    /// Assigns the item to a collection and applies tags.
    async fn assign(
        &self,
        item_key: &str,
        collection_key: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> Result<(), TransportError>;

    /// Read-back check that the created item is indexed.
    async fn verify_item(&self, item_key: &str) -> Result<bool, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Connector.to_string(), "connector");
        assert_eq!(TransportKind::Api.to_string(), "api");
    }

    #[test]
    fn test_collection_ref_equality() {
        assert_eq!(
            CollectionRef::ByName("Unfiled".to_string()),
            CollectionRef::ByName("Unfiled".to_string())
        );
        assert_ne!(
            CollectionRef::ByKey("ABC123".to_string()),
            CollectionRef::ByName("ABC123".to_string())
        );
    }
}
