//! Local companion-application (connector) transport.
//!
//! Talks to the running Zotero desktop application over its loopback
//! connector port. Snapshot saves get the host application's own translator
//! and indexing machinery, which the raw Web API cannot offer, but the
//! connector protocol has two quirks this module papers over:
//!
//! - `saveSnapshot` does not return the created item key; the key is
//!   recovered by polling the Web API for the newest item with the URL.
//! - attachments are ingested by URL, so the PDF is briefly served from an
//!   in-process loopback server ([`super::PdfServer`]) and the resulting
//!   attachment item is rewritten to point at the real source afterwards.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureArtifact, CaptureTarget};
use crate::config::PollOptions;
use crate::metadata::ItemMetadata;

use super::api::ApiClient;
use super::error::TransportError;
use super::fileserver::PdfServer;
use super::{CollectionRef, LibraryTransport, TransportKind};

/// Ping probes should fail fast; the application either answers or is gone.
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes items through the local application's connector endpoint.
///
/// Wraps an [`ApiClient`]: the connector protocol is write-only, so key
/// recovery, tag/collection assignment, and verification all go through the
/// Web API for the same library.
#[derive(Debug, Clone)]
pub struct ConnectorTransport {
    client: Client,
    base_url: String,
    api: ApiClient,
    poll: PollOptions,
}

impl ConnectorTransport {
    /// Creates a connector transport for `host:port`, paired with the Web
    /// API client used for read-back.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be constructed.
    pub fn new(
        host: &str,
        port: u16,
        api: ApiClient,
        poll: PollOptions,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::protocol(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}:{port}", host.trim_end_matches('/')),
            api,
            poll,
        })
    }

    /// The connector endpoint base, e.g. `http://127.0.0.1:23119`.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn post_snapshot(&self, payload: &Value) -> Result<(), TransportError> {
        let url = format!("{}/connector/saveSnapshot", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    TransportError::unavailable(&self.base_url, e.to_string())
                } else {
                    TransportError::http(&url, e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 201 {
            Ok(())
        } else {
            Err(TransportError::protocol(format!(
                "saveSnapshot returned HTTP {status}"
            )))
        }
    }

    /// Rewrites a connector-created attachment item: points its URL at the
    /// real source (or clears the transfer URL), fixes the filename, and
    /// files it under `parent` when given.
    async fn rewrite_attachment(
        &self,
        attachment_key: &str,
        parent: Option<&str>,
        source_url: Option<&str>,
        filename: &str,
    ) -> Result<(), TransportError> {
        let item = self
            .api
            .get_item(attachment_key)
            .await?
            .ok_or_else(|| {
                TransportError::protocol(format!(
                    "attachment {attachment_key} missing during rewrite"
                ))
            })?;
        let version = item
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut patch = json!({
            "url": source_url.unwrap_or(""),
            "filename": filename,
        });
        if let Some(parent) = parent {
            patch["parentItem"] = json!(parent);
        }
        self.api.update_item(attachment_key, &patch, version).await
    }

    /// Deletes the empty webpage item the attachment snapshot leaves behind.
    ///
    /// Saving an attachment through `saveSnapshot` creates a parent webpage
    /// record pointing at the transfer URL alongside the attachment itself.
    /// Once the attachment is reparented that record is an empty item with a
    /// localhost URL, so it is removed - but only while it has no children,
    /// in case the host application filed something under it meanwhile.
    async fn delete_stray_snapshot_item(
        &self,
        transfer_url: &str,
    ) -> Result<(), TransportError> {
        // The webpage record is indexed together with the attachment, which
        // was already found; one lookup is enough.
        let single_lookup = PollOptions {
            max_attempts: 1,
            interval: Duration::ZERO,
        };
        let Some(stray_key) = self
            .api
            .find_recent_item_by_url(transfer_url, "webpage", &single_lookup)
            .await?
        else {
            return Ok(());
        };
        let Some(stray) = self.api.get_item(&stray_key).await? else {
            return Ok(());
        };

        let children = stray
            .pointer("/meta/numChildren")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if children > 0 {
            debug!(stray_key, children, "Snapshot item has children, keeping it");
            return Ok(());
        }

        let version = stray.get("version").and_then(Value::as_u64).unwrap_or(0);
        self.api.delete_item(&stray_key, version).await?;
        debug!(stray_key, "Stray snapshot item deleted");
        Ok(())
    }
}

#[async_trait]
impl LibraryTransport for ConnectorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Connector
    }

    fn supports_direct_attachment(&self) -> bool {
        // One saveSnapshot exchange both stores the file and lets the host
        // application index it.
        true
    }

    /// Pings the connector endpoint. Connection refusal means the host
    /// application is not running.
    async fn is_available(&self) -> bool {
        let url = format!("{}/connector/ping", self.base_url);
        let ping = self.client.post(&url).timeout(PING_TIMEOUT).send().await;
        match ping {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!(error = %error, "Connector ping failed");
                false
            }
        }
    }

    #[instrument(skip_all, fields(title = %metadata.title))]
    async fn create_item(
        &self,
        metadata: &ItemMetadata,
        target: &CaptureTarget,
    ) -> Result<String, TransportError> {
        let Some(url) = target.url() else {
            return Err(TransportError::protocol(
                "the connector creates items from URLs; use attach_pdf for standalone PDFs",
            ));
        };

        self.post_snapshot(&json!({ "url": url, "title": metadata.title }))
            .await?;
        info!(url, "Snapshot accepted by the host application");

        // The response carries no key; recover it from the library index.
        self.api
            .find_recent_item_by_url(url, "webpage", &self.poll)
            .await?
            .ok_or_else(|| {
                TransportError::protocol(format!(
                    "snapshot for {url} was accepted but never appeared in the library"
                ))
            })
    }

    #[instrument(skip_all, fields(parent = ?parent, filename = %artifact.filename))]
    async fn attach_pdf(
        &self,
        parent: Option<&str>,
        artifact: &CaptureArtifact,
        metadata: &ItemMetadata,
    ) -> Result<String, TransportError> {
        let server = PdfServer::serve(artifact.pdf.clone()).await?;
        let transfer_url = server.url();

        let payload = json!({
            "url": transfer_url,
            "title": metadata.title,
            "filename": artifact.filename,
            "contentType": "application/pdf",
            "itemType": "attachment",
        });
        let saved = self.post_snapshot(&payload).await;
        // The host application fetches the PDF during the snapshot call, so
        // the server can come down as soon as the call returns.
        server.stop().await;
        saved.map_err(|e| match parent {
            Some(parent) => TransportError::attachment_failed(parent, e.to_string()),
            None => e,
        })?;

        let attachment_key = self
            .api
            .find_recent_item_by_url(&transfer_url, "attachment", &self.poll)
            .await?
            .ok_or_else(|| {
                TransportError::protocol(
                    "attachment snapshot was accepted but never appeared in the library",
                )
            })?;

        if let Err(error) = self
            .rewrite_attachment(
                &attachment_key,
                parent,
                metadata.source_url.as_deref(),
                &artifact.filename,
            )
            .await
        {
            // The file made it into the library; a failed rewrite only leaves
            // a localhost URL on the attachment record.
            warn!(error = %error, attachment_key, "Attachment rewrite failed");
        }

        if let Err(error) = self.delete_stray_snapshot_item(&transfer_url).await {
            // Leaking the empty record is cosmetic; the attachment is saved.
            warn!(error = %error, "Could not delete stray snapshot item");
        }

        Ok(attachment_key)
    }

    async fn resolve_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<String, TransportError> {
        // Collection lookup is a library read; delegate to the Web API.
        super::api::resolve_collection_via(&self.api, collection).await
    }

    async fn assign(
        &self,
        item_key: &str,
        collection_key: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        super::api::assign_item(&self.api, item_key, collection_key, tags).await
    }

    async fn verify_item(&self, item_key: &str) -> Result<bool, TransportError> {
        Ok(self.api.get_item(item_key).await?.is_some())
    }
}
