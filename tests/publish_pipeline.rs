//! Integration tests for the publish orchestrator.
//!
//! Uses in-memory fake transports to exercise transport selection, fallback,
//! partial-failure handling, and the attach-only retry path without a
//! browser or a live library. The existing-PDF input path supplies the
//! artifact, so no rendering happens in any of these tests.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use zotsave_core::capture::{CaptureArtifact, CaptureTarget};
use zotsave_core::metadata::ItemMetadata;
use zotsave_core::{
    CollectionRef, LibraryTransport, PublishConfig, PublishError, PublishOrchestrator,
    TransportError, TransportKind,
};

/// A scriptable in-memory transport.
struct FakeTransport {
    kind: TransportKind,
    available: bool,
    fail_attach: bool,
    items_created: Arc<AtomicUsize>,
    attachments_created: Arc<AtomicUsize>,
    assigned_collection: Arc<Mutex<Option<String>>>,
}

impl FakeTransport {
    fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            available: true,
            fail_attach: false,
            items_created: Arc::new(AtomicUsize::new(0)),
            attachments_created: Arc::new(AtomicUsize::new(0)),
            assigned_collection: Arc::new(Mutex::new(None)),
        }
    }

    fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    fn item_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.items_created)
    }

    fn attachment_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attachments_created)
    }

    fn assigned_collection(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.assigned_collection)
    }
}

#[async_trait]
impl LibraryTransport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_direct_attachment(&self) -> bool {
        self.kind == TransportKind::Connector
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn create_item(
        &self,
        _metadata: &ItemMetadata,
        _target: &CaptureTarget,
    ) -> Result<String, TransportError> {
        let n = self.items_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ITEM{n:04}"))
    }

    async fn attach_pdf(
        &self,
        parent: Option<&str>,
        _artifact: &CaptureArtifact,
        _metadata: &ItemMetadata,
    ) -> Result<String, TransportError> {
        if self.fail_attach {
            return Err(TransportError::attachment_failed(
                parent.unwrap_or("STANDALONE"),
                "simulated storage failure",
            ));
        }
        let n = self.attachments_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ATTACH{n:02}"))
    }

    async fn resolve_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<String, TransportError> {
        match collection {
            CollectionRef::ByKey(key) => Ok(key.clone()),
            CollectionRef::ByName(name) if name == "Unfiled" => Ok("UNFILED1".to_string()),
            CollectionRef::ByName(name) => {
                Err(TransportError::CollectionNotFound { name: name.clone() })
            }
        }
    }

    async fn assign(
        &self,
        _item_key: &str,
        collection_key: Option<&str>,
        _tags: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        *self.assigned_collection.lock().unwrap() = collection_key.map(str::to_string);
        Ok(())
    }

    async fn verify_item(&self, _item_key: &str) -> Result<bool, TransportError> {
        Ok(true)
    }
}

/// Writes a minimal PDF file and returns its target.
fn pdf_target(dir: &tempfile::TempDir) -> CaptureTarget {
    let path = dir.path().join("capture.pdf");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"%PDF-1.7\n%fake body\n%%EOF\n").unwrap();
    CaptureTarget::ExistingFile(path)
}

fn orchestrator_with(transports: Vec<Box<dyn LibraryTransport>>) -> PublishOrchestrator {
    PublishOrchestrator::with_transports(PublishConfig::default(), transports)
}

#[tokio::test]
async fn test_clean_run_has_no_warnings() {
    let dir = tempfile::TempDir::new().unwrap();
    let connector = FakeTransport::new(TransportKind::Connector);
    let orchestrator = orchestrator_with(vec![Box::new(connector)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    assert_eq!(result.transport_used, TransportKind::Connector);
    assert!(result.attachment_id.is_some());
}

#[tokio::test]
async fn test_connector_publishes_existing_pdf_as_standalone_attachment() {
    let dir = tempfile::TempDir::new().unwrap();
    let connector = FakeTransport::new(TransportKind::Connector);
    let items = connector.item_counter();
    let orchestrator = orchestrator_with(vec![Box::new(connector)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    // Direct attachment: the attachment IS the item, no separate parent.
    assert_eq!(items.load(Ordering::SeqCst), 0);
    assert_eq!(result.attachment_id.as_deref(), Some(&*result.item_id));
}

#[tokio::test]
async fn test_falls_back_to_api_when_connector_down() {
    let dir = tempfile::TempDir::new().unwrap();
    let connector = FakeTransport::new(TransportKind::Connector).unavailable();
    let api = FakeTransport::new(TransportKind::Api);
    let orchestrator = orchestrator_with(vec![Box::new(connector), Box::new(api)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert_eq!(result.transport_used, TransportKind::Api);
}

#[tokio::test]
async fn test_connector_preferred_when_both_available() {
    let dir = tempfile::TempDir::new().unwrap();
    let connector = FakeTransport::new(TransportKind::Connector);
    let api = FakeTransport::new(TransportKind::Api);
    let orchestrator = orchestrator_with(vec![Box::new(connector), Box::new(api)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert_eq!(result.transport_used, TransportKind::Connector);
}

#[tokio::test]
async fn test_no_transport_available_preserves_artifact() {
    let dir = tempfile::TempDir::new().unwrap();
    let connector = FakeTransport::new(TransportKind::Connector).unavailable();
    let api = FakeTransport::new(TransportKind::Api).unavailable();
    let orchestrator = orchestrator_with(vec![Box::new(connector), Box::new(api)]);

    let err = orchestrator.run(&pdf_target(&dir)).await.unwrap_err();
    let artifact = err
        .captured_artifact()
        .expect("artifact should survive transport failure");
    assert!(artifact.pdf.starts_with(b"%PDF"));
    assert_eq!(artifact.filename, "capture.pdf");
}

#[tokio::test]
async fn test_attach_failure_keeps_item_and_warns() {
    let dir = tempfile::TempDir::new().unwrap();
    // API kind: no direct attachment, so the run creates a parent item first.
    let api = FakeTransport::new(TransportKind::Api).failing_attach();
    let items = api.item_counter();
    let orchestrator = orchestrator_with(vec![Box::new(api)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert_eq!(items.load(Ordering::SeqCst), 1);
    assert!(result.attachment_id.is_none());
    assert!(
        result.warnings.iter().any(|w| w.contains("attachment failed")),
        "warnings: {:?}",
        result.warnings
    );
}

#[tokio::test]
async fn test_retry_attachment_creates_no_second_item() {
    let dir = tempfile::TempDir::new().unwrap();
    let failing = FakeTransport::new(TransportKind::Api).failing_attach();
    let items = failing.item_counter();
    let orchestrator = orchestrator_with(vec![Box::new(failing)]);
    let partial = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert!(partial.attachment_id.is_none());

    // Second orchestrator stands in for a rerun with the storage fault gone.
    let healthy = FakeTransport::new(TransportKind::Api);
    let retry_items = healthy.item_counter();
    let attachments = healthy.attachment_counter();
    let retry = orchestrator_with(vec![Box::new(healthy)]);
    let attachment_id = retry
        .retry_attachment(&partial.item_id, &partial.artifact, &partial.metadata)
        .await
        .unwrap();

    assert!(!attachment_id.is_empty());
    assert_eq!(items.load(Ordering::SeqCst), 1);
    assert_eq!(retry_items.load(Ordering::SeqCst), 0);
    assert_eq!(attachments.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unique_collection_name_resolves_and_run_stays_clean() {
    let dir = tempfile::TempDir::new().unwrap();
    let api = FakeTransport::new(TransportKind::Api);
    let assigned = api.assigned_collection();
    let config = PublishConfig {
        collection: Some(CollectionRef::ByName("Unfiled".to_string())),
        ..PublishConfig::default()
    };
    let orchestrator = PublishOrchestrator::with_transports(config, vec![Box::new(api)]);

    let result = orchestrator.run(&pdf_target(&dir)).await.unwrap();
    assert!(!result.item_id.is_empty());
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    // The single by-name match resolved to its key before assignment.
    assert_eq!(assigned.lock().unwrap().as_deref(), Some("UNFILED1"));
}

#[tokio::test]
async fn test_collection_resolution_failure_aborts_run() {
    let dir = tempfile::TempDir::new().unwrap();
    let api = FakeTransport::new(TransportKind::Api);
    let items = api.item_counter();
    let config = PublishConfig {
        collection: Some(CollectionRef::ByName("Nowhere".to_string())),
        ..PublishConfig::default()
    };
    let orchestrator = PublishOrchestrator::with_transports(config, vec![Box::new(api)]);

    let err = orchestrator.run(&pdf_target(&dir)).await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::Transport(TransportError::CollectionNotFound { .. })
    ));
    // Resolution happens before item creation, so nothing was written.
    assert_eq!(items.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_input_file_is_typed_error() {
    let api = FakeTransport::new(TransportKind::Api);
    let orchestrator = orchestrator_with(vec![Box::new(api)]);
    let target = CaptureTarget::ExistingFile("/nonexistent/never.pdf".into());

    let err = orchestrator.run(&target).await.unwrap_err();
    assert!(matches!(err, PublishError::Input { .. }));
}
