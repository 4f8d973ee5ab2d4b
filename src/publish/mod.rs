//! The capture-and-publish orchestrator.
//!
//! [`PublishOrchestrator`] runs one pipeline per invocation, strictly in
//! stage order:
//!
//! ```text
//! Render (if URL) -> Expand -> Capture -> ExtractMetadata
//!   -> SelectTransport -> ResolveCollection -> CreateItem
//!   -> AttachFile -> Assign -> Verify
//! ```
//!
//! Structural failures (navigation, timeout, no transport, ambiguous
//! collection, rejected credential) abort the run as typed errors.
//! Recoverable conditions (expansion round errors, attachment failure after
//! the item exists, a verify miss) are downgraded to warnings on the final
//! [`PublishResult`] - a metadata-only item is still useful, and rolling it
//! back would throw away the one part of the operation that succeeded.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::capture::{
    CaptureArtifact, CaptureDiagnostics, CaptureError, CaptureTarget, ContentExpander,
    PageRenderer, PdfCapturer, RenderOptions,
};
use crate::config::PublishConfig;
use crate::metadata::{ItemMetadata, MetadataExtractor, attachment_filename};
use crate::transport::{
    ApiClient, ApiTransport, ConnectorTransport, LibraryTransport, TransportError, TransportKind,
};

/// Terminal result of a successful publish run. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Key of the created library item.
    pub item_id: String,
    /// Key of the PDF attachment, when attaching succeeded.
    pub attachment_id: Option<String>,
    /// Which transport performed the publish.
    pub transport_used: TransportKind,
    /// Non-fatal problems, in occurrence order.
    pub warnings: Vec<String>,
    /// The published PDF, returned so callers can keep a local copy or
    /// retry the attachment without re-rendering.
    pub artifact: CaptureArtifact,
    /// The metadata the item was created with.
    pub metadata: ItemMetadata,
}

/// Errors that abort a publish run.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Rendering or serializing the page failed.
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    /// A transport operation failed structurally.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// No transport can publish: the connector is unreachable and no API
    /// credentials are configured.
    ///
    /// Capture work is not discarded - when the pipeline had already produced
    /// a PDF, the artifact rides along so the caller can retry with different
    /// transport configuration without re-rendering.
    #[error(
        "no library transport available: the connector is unreachable and no API credentials are configured"
    )]
    NoTransportAvailable {
        /// The already-captured artifact, when capture had completed.
        artifact: Option<Box<CaptureArtifact>>,
    },

    /// The existing-PDF input could not be read.
    #[error("could not read input file {path}: {source}")]
    Input {
        /// The unreadable path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The caller-supplied deadline elapsed before the pipeline finished.
    #[error("publish deadline of {budget:?} exceeded")]
    DeadlineExceeded {
        /// The deadline that was exceeded.
        budget: Duration,
    },
}

impl PublishError {
    /// The capture artifact preserved by a transport-selection failure, if any.
    #[must_use]
    pub fn captured_artifact(&self) -> Option<&CaptureArtifact> {
        match self {
            Self::NoTransportAvailable {
                artifact: Some(artifact),
            } => Some(artifact),
            _ => None,
        }
    }
}

/// Composes capture, metadata extraction, and transport publishing.
pub struct PublishOrchestrator {
    config: PublishConfig,
    transports: Vec<Box<dyn LibraryTransport>>,
}

impl PublishOrchestrator {
    /// Builds an orchestrator with transports derived from the configuration.
    ///
    /// Both transports need Web API credentials - the API transport for its
    /// writes, the connector for item-key recovery and read-backs - so no
    /// credentials means an empty transport set and a
    /// [`PublishError::NoTransportAvailable`] at selection time.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] if a transport's HTTP client
    /// cannot be constructed.
    pub fn new(config: PublishConfig) -> Result<Self, PublishError> {
        let mut transports: Vec<Box<dyn LibraryTransport>> = Vec::new();

        if let Some(ref credentials) = config.credentials {
            let api_client = ApiClient::with_base_url(credentials, &config.api_base_url)?;
            // Preference order: connector first (lower latency, host-app
            // indexing), Web API as the fallback.
            transports.push(Box::new(ConnectorTransport::new(
                &config.connector_host,
                config.connector_port,
                api_client.clone(),
                config.poll.clone(),
            )?));
            transports.push(Box::new(ApiTransport::new(api_client)));
        }

        Ok(Self { config, transports })
    }

    /// Builds an orchestrator over caller-supplied transports, in preference
    /// order. Used by tests and by embedders with custom transports.
    #[must_use]
    pub fn with_transports(
        config: PublishConfig,
        transports: Vec<Box<dyn LibraryTransport>>,
    ) -> Self {
        Self { config, transports }
    }

    /// Runs the full pipeline for one target.
    ///
    /// # Errors
    ///
    /// Typed [`PublishError`] identifying the failing stage; see the module
    /// docs for which conditions abort and which downgrade to warnings.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn run(&self, target: &CaptureTarget) -> Result<PublishResult, PublishError> {
        let (artifact, mut metadata) = match target {
            CaptureTarget::WebUrl(url) => self.capture_url(url).await?,
            CaptureTarget::ExistingFile(path) => self.load_existing(path.clone()).await?,
        };
        metadata.tags = self.config.tags.clone();

        let transport = self.select_transport(Some(&artifact)).await?;
        info!(transport = %transport.kind(), "Transport selected");

        // Resolved once per run; the key is reused for assignment below.
        let collection_key = match self.config.collection {
            Some(ref collection) => Some(transport.resolve_collection(collection).await?),
            None => None,
        };

        let mut warnings = artifact.diagnostics.warnings.clone();

        let (item_id, attachment_id) = if transport.supports_direct_attachment()
            && matches!(target, CaptureTarget::ExistingFile(_))
        {
            // Direct-attachment transports publish a standalone PDF as the
            // item itself, in one protocol exchange.
            let key = transport.attach_pdf(None, &artifact, &metadata).await?;
            (key.clone(), Some(key))
        } else {
            let item_id = transport.create_item(&metadata, target).await?;
            let attachment_id = match transport.attach_pdf(Some(&item_id), &artifact, &metadata).await
            {
                Ok(key) => Some(key),
                Err(error) => {
                    // The item exists and stays; deleting it would discard
                    // the successful half of the operation.
                    warn!(error = %error, item_id, "Attachment failed after item creation");
                    warnings.push(format!("attachment failed: {error}"));
                    None
                }
            };
            (item_id, attachment_id)
        };

        if let Err(error) = transport
            .assign(&item_id, collection_key.as_deref(), &metadata.tags)
            .await
        {
            warn!(error = %error, item_id, "Tag/collection assignment failed");
            warnings.push(format!("tag/collection assignment failed: {error}"));
        }

        match transport.verify_item(&item_id).await {
            Ok(true) => {}
            Ok(false) => {
                warnings.push(format!(
                    "verification did not find item {item_id}; the write is presumed to have succeeded"
                ));
            }
            Err(error) => {
                warnings.push(format!("verification read-back failed: {error}"));
            }
        }

        info!(
            item_id,
            attachment = ?attachment_id,
            warnings = warnings.len(),
            "Publish complete"
        );
        Ok(PublishResult {
            item_id,
            attachment_id,
            transport_used: transport.kind(),
            warnings,
            artifact,
            metadata,
        })
    }

    /// Runs the pipeline under a caller-supplied deadline.
    ///
    /// On expiry the pipeline future is dropped at its current suspension
    /// point; the render session's browser process is killed on drop, so the
    /// scoped release holds under cancellation too.
    ///
    /// # Errors
    ///
    /// [`PublishError::DeadlineExceeded`] on expiry, otherwise as [`Self::run`].
    pub async fn run_with_deadline(
        &self,
        target: &CaptureTarget,
        deadline: Duration,
    ) -> Result<PublishResult, PublishError> {
        match tokio::time::timeout(deadline, self.run(target)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::DeadlineExceeded { budget: deadline }),
        }
    }

    /// Retries only the attachment step for an already-created item.
    ///
    /// Creates no second item, so it is the safe follow-up after a run whose
    /// result carried an attachment warning.
    ///
    /// # Errors
    ///
    /// Transport selection and attachment errors.
    pub async fn retry_attachment(
        &self,
        item_id: &str,
        artifact: &CaptureArtifact,
        metadata: &ItemMetadata,
    ) -> Result<String, PublishError> {
        let transport = self.select_transport(None).await?;
        Ok(transport.attach_pdf(Some(item_id), artifact, metadata).await?)
    }

    /// Picks the first available transport in preference order.
    async fn select_transport(
        &self,
        artifact: Option<&CaptureArtifact>,
    ) -> Result<&dyn LibraryTransport, PublishError> {
        for transport in &self.transports {
            if transport.is_available().await {
                return Ok(transport.as_ref());
            }
            warn!(transport = %transport.kind(), "Transport unavailable, trying next");
        }
        Err(PublishError::NoTransportAvailable {
            artifact: artifact.map(|a| Box::new(a.clone())),
        })
    }

    /// Render -> expand -> extract -> capture, with the session torn down on
    /// every exit path.
    async fn capture_url(
        &self,
        url: &str,
    ) -> Result<(CaptureArtifact, ItemMetadata), PublishError> {
        let options = RenderOptions {
            wait_budget: self.config.wait_budget,
            settle: self.config.settle,
            user_agent: self.config.user_agent.clone(),
            profile_dir: self.config.profile_dir.clone(),
        };

        let session = PageRenderer::new().render(url, &options).await?;

        let expansion = ContentExpander::new(self.config.expand.clone())
            .expand(&session)
            .await;
        let metadata = MetadataExtractor::new()
            .extract_from_page(&session, url)
            .await;

        let diagnostics = CaptureDiagnostics {
            final_height: expansion.final_height(),
            elapsed_wait: session.elapsed(),
            expansion_rounds: expansion.rounds(),
            warnings: expansion.warnings().to_vec(),
        };
        let filename = attachment_filename(&metadata);

        let captured = PdfCapturer::new()
            .capture(&session, filename, diagnostics)
            .await;
        session.close().await;

        Ok((captured?, metadata))
    }

    /// Loads an existing PDF as the artifact; render/expand/capture are
    /// skipped for this input.
    async fn load_existing(
        &self,
        path: PathBuf,
    ) -> Result<(CaptureArtifact, ItemMetadata), PublishError> {
        let pdf = tokio::fs::read(&path)
            .await
            .map_err(|source| PublishError::Input {
                path: path.clone(),
                source,
            })?;

        let metadata = MetadataExtractor::new().extract_from_pdf(&path);
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| attachment_filename(&metadata));

        Ok((
            CaptureArtifact {
                pdf,
                filename,
                diagnostics: CaptureDiagnostics::default(),
            },
            metadata,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_no_transport_error_exposes_artifact() {
        let artifact = CaptureArtifact {
            pdf: vec![1, 2, 3],
            filename: "x.pdf".to_string(),
            diagnostics: CaptureDiagnostics::default(),
        };
        let err = PublishError::NoTransportAvailable {
            artifact: Some(Box::new(artifact)),
        };
        assert_eq!(err.captured_artifact().unwrap().pdf, vec![1, 2, 3]);

        let bare = PublishError::NoTransportAvailable { artifact: None };
        assert!(bare.captured_artifact().is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_without_credentials_has_no_transports() {
        let orchestrator = PublishOrchestrator::new(PublishConfig::default()).unwrap();
        let result = orchestrator.select_transport(None).await;
        assert!(matches!(
            result,
            Err(PublishError::NoTransportAvailable { artifact: None })
        ));
    }
}
