//! Zotero Web API transport.
//!
//! [`ApiClient`] is the low-level Web API v3 client (items, collections,
//! file uploads) shared by both transports: the API transport publishes
//! through it directly, and the connector transport uses it for item-key
//! recovery, tag/collection assignment, and verification.
//!
//! Attachment upload on this path is the three-step authorization protocol:
//! create the attachment item, request upload authorization (md5, size,
//! mtime), upload the bytes to the storage backend, then register the upload.
//! When the backend already holds a file with the same digest the
//! authorization response short-circuits with `exists: 1`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureArtifact, CaptureTarget};
use crate::config::{ApiCredentials, PollOptions};
use crate::metadata::{ItemMetadata, provenance_extra};

use super::error::TransportError;
use super::{CollectionRef, LibraryTransport, TransportKind};

const API_VERSION_HEADER: &str = "Zotero-API-Version";
const API_KEY_HEADER: &str = "Zotero-API-Key";
const API_VERSION: &str = "3";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Write response from `POST /items`.
#[derive(Debug, Deserialize)]
pub struct WriteResponse {
    /// Index -> created item key.
    #[serde(default)]
    pub success: HashMap<String, String>,
    /// Index -> failure description.
    #[serde(default)]
    pub failed: HashMap<String, Value>,
}

impl WriteResponse {
    /// The first created key, for single-item writes.
    #[must_use]
    pub fn first_key(&self) -> Option<&str> {
        self.success.get("0").map(String::as_str)
    }
}

/// Upload authorization response from `POST /items/{key}/file`.
#[derive(Debug, Deserialize)]
struct UploadAuthorization {
    #[serde(default)]
    exists: u8,
    url: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    prefix: Option<String>,
    suffix: Option<String>,
    #[serde(rename = "uploadKey")]
    upload_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionEntry {
    data: CollectionData,
}

#[derive(Debug, Deserialize)]
struct CollectionData {
    key: String,
    name: String,
}

/// Low-level Zotero Web API v3 client for one library.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    prefix: String,
    api_key: String,
}

impl ApiClient {
    /// Creates a client for the given credentials against the public API.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be constructed.
    pub fn new(credentials: &ApiCredentials) -> Result<Self, TransportError> {
        Self::with_base_url(credentials, crate::config::DEFAULT_API_BASE_URL)
    }

    /// Creates a client against a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be constructed.
    pub fn with_base_url(
        credentials: &ApiCredentials,
        base_url: &str,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TransportError::protocol(format!("HTTP client build failed: {e}")))?;

        let prefix = format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            credentials.library_type.path_segment(),
            credentials.library_id
        );

        Ok(Self {
            client,
            prefix,
            api_key: credentials.api_key.clone(),
        })
    }

    /// The library prefix URL, e.g. `https://api.zotero.org/users/12345`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(API_VERSION_HEADER, API_VERSION)
    }

    /// Probes the library endpoint. Any HTTP answer counts as reachable;
    /// credential problems surface later as typed authorization errors.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/collections?limit=1", self.prefix);
        self.request(reqwest::Method::GET, &url)
            .send()
            .await
            .is_ok()
    }

    /// Creates items and returns the write response.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] on a rejected credential, otherwise
    /// HTTP/protocol errors.
    pub async fn create_items(&self, items: &[Value]) -> Result<WriteResponse, TransportError> {
        let url = format!("{}/items", self.prefix);
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(items)
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::protocol(format!(
                "item write returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<WriteResponse>()
            .await
            .map_err(|e| TransportError::http(&url, e))
    }

    /// Fetches a full item by key. `Ok(None)` when the item does not exist.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] or HTTP/protocol errors.
    pub async fn get_item(&self, key: &str) -> Result<Option<Value>, TransportError> {
        let url = format!("{}/items/{key}", self.prefix);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::protocol(format!(
                "item read returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map(Some)
            .map_err(|e| TransportError::http(&url, e))
    }

    /// Patches an item's data fields, guarded by its current version.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] or HTTP/protocol errors.
    pub async fn update_item(
        &self,
        key: &str,
        data: &Value,
        version: u64,
    ) -> Result<(), TransportError> {
        let url = format!("{}/items/{key}", self.prefix);
        let response = self
            .request(reqwest::Method::PATCH, &url)
            .header("If-Unmodified-Since-Version", version)
            .json(data)
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::protocol(format!(
                "item update returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Deletes an item, guarded by its current version. Best-effort callers
    /// downgrade failures to warnings.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] or HTTP/protocol errors.
    pub async fn delete_item(&self, key: &str, version: u64) -> Result<(), TransportError> {
        let url = format!("{}/items/{key}", self.prefix);
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .header("If-Unmodified-Since-Version", version)
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::protocol(format!(
                "item delete returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Lists all collections as `(key, name)` pairs.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] or HTTP/protocol errors.
    pub async fn collections(&self) -> Result<Vec<(String, String)>, TransportError> {
        let url = format!("{}/collections?limit=100", self.prefix);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::protocol(format!(
                "collection list returned HTTP {}",
                response.status()
            )));
        }

        let entries: Vec<CollectionEntry> = response
            .json()
            .await
            .map_err(|e| TransportError::http(&url, e))?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.data.key, entry.data.name))
            .collect())
    }

    /// Finds the most recently added item of `item_type` with the given URL,
    /// polling because connector-created items are indexed asynchronously.
    ///
    /// # Errors
    ///
    /// [`TransportError::Authorization`] or HTTP/protocol errors; exhausting
    /// the poll budget yields `Ok(None)`.
    #[instrument(skip(self, poll))]
    pub async fn find_recent_item_by_url(
        &self,
        target_url: &str,
        item_type: &str,
        poll: &PollOptions,
    ) -> Result<Option<String>, TransportError> {
        let url = format!(
            "{}/items?sort=dateAdded&direction=desc&limit=10",
            self.prefix
        );

        for attempt in 1..=poll.max_attempts {
            let response = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await
                .map_err(|e| TransportError::http(&url, e))?;

            check_auth(response.status())?;
            if response.status().is_success() {
                let items: Vec<Value> = response
                    .json()
                    .await
                    .map_err(|e| TransportError::http(&url, e))?;
                let found = items.iter().find_map(|item| {
                    let data = item.get("data")?;
                    (data.get("url")?.as_str()? == target_url
                        && data.get("itemType")?.as_str()? == item_type)
                        .then(|| data.get("key")?.as_str().map(str::to_string))
                        .flatten()
                });
                if let Some(key) = found {
                    debug!(key = %key, attempt, "Item found by URL");
                    return Ok(Some(key));
                }
            }

            if attempt < poll.max_attempts {
                debug!(attempt, "Item not indexed yet, waiting before retry");
                tokio::time::sleep(poll.interval).await;
            }
        }

        warn!(url = %target_url, "Item never appeared in the library index");
        Ok(None)
    }

    /// Runs the upload authorization protocol for an existing attachment item.
    ///
    /// # Errors
    ///
    /// Any failure is reported against the attachment's `item_key`.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn upload_file(
        &self,
        item_key: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let md5_hex = format!("{:x}", Md5::digest(bytes));
        let mtime = chrono::Utc::now().timestamp_millis();
        let url = format!("{}/items/{item_key}/file", self.prefix);

        let response = self
            .request(reqwest::Method::POST, &url)
            .header("If-None-Match", "*")
            .form(&[
                ("md5", md5_hex.as_str()),
                ("filename", filename),
                ("filesize", &bytes.len().to_string()),
                ("mtime", &mtime.to_string()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        check_auth(response.status())?;
        if !response.status().is_success() {
            return Err(TransportError::attachment_failed(
                item_key,
                format!("upload authorization returned HTTP {}", response.status()),
            ));
        }

        let auth: UploadAuthorization = response
            .json()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        if auth.exists == 1 {
            debug!("Storage backend already holds this file, upload skipped");
            return Ok(());
        }

        let (upload_url, prefix, suffix, upload_key) =
            match (auth.url, auth.prefix, auth.suffix, auth.upload_key) {
                (Some(u), Some(p), Some(s), Some(k)) => (u, p, s, k),
                _ => {
                    return Err(TransportError::attachment_failed(
                        item_key,
                        "upload authorization response missing upload parameters",
                    ));
                }
            };

        // Storage backends expect prefix + file bytes + suffix as one body.
        let mut body = Vec::with_capacity(prefix.len() + bytes.len() + suffix.len());
        body.extend_from_slice(prefix.as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(suffix.as_bytes());

        let upload_response = self
            .client
            .post(&upload_url)
            .header(
                "Content-Type",
                auth.content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::http(&upload_url, e))?;

        if !upload_response.status().is_success() {
            return Err(TransportError::attachment_failed(
                item_key,
                format!(
                    "storage upload returned HTTP {}",
                    upload_response.status()
                ),
            ));
        }

        let register_response = self
            .request(reqwest::Method::POST, &url)
            .header("If-None-Match", "*")
            .form(&[("upload", upload_key.as_str())])
            .send()
            .await
            .map_err(|e| TransportError::http(&url, e))?;

        if !register_response.status().is_success() {
            return Err(TransportError::attachment_failed(
                item_key,
                format!(
                    "upload registration returned HTTP {}",
                    register_response.status()
                ),
            ));
        }

        info!(item_key, filename, "Attachment uploaded and registered");
        Ok(())
    }
}

/// Read-modify-write tag and collection assignment, shared by both
/// transports. Merging with the existing values keeps assignment idempotent.
pub(crate) async fn assign_item(
    client: &ApiClient,
    item_key: &str,
    collection_key: Option<&str>,
    tags: &BTreeSet<String>,
) -> Result<(), TransportError> {
    if collection_key.is_none() && tags.is_empty() {
        return Ok(());
    }

    let item = client.get_item(item_key).await?.ok_or_else(|| {
        TransportError::protocol(format!("item {item_key} vanished before assignment"))
    })?;
    let data = item.get("data").cloned().unwrap_or_default();
    let version = item
        .get("version")
        .and_then(Value::as_u64)
        .or_else(|| data.get("version").and_then(Value::as_u64))
        .unwrap_or(0);

    let mut existing_tags: Vec<Value> = data
        .get("tags")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for tag in tags {
        let already = existing_tags
            .iter()
            .any(|t| t.get("tag").and_then(Value::as_str) == Some(tag.as_str()));
        if !already {
            existing_tags.push(json!({ "tag": tag }));
        }
    }

    let mut collections: Vec<Value> = data
        .get("collections")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(key) = collection_key {
        if !collections.iter().any(|c| c.as_str() == Some(key)) {
            collections.push(json!(key));
        }
    }

    let patch = json!({ "tags": existing_tags, "collections": collections });
    client.update_item(item_key, &patch, version).await
}

/// Exact-name collection resolution, shared by both transports.
///
/// Ambiguity is an error by contract: silently taking the first of several
/// same-named collections would file items somewhere the user cannot predict.
pub(crate) async fn resolve_collection_via(
    client: &ApiClient,
    collection: &CollectionRef,
) -> Result<String, TransportError> {
    match collection {
        CollectionRef::ByKey(key) => Ok(key.clone()),
        CollectionRef::ByName(name) => {
            let collections = client.collections().await?;
            let matches: Vec<&(String, String)> = collections
                .iter()
                .filter(|(_, collection_name)| collection_name == name)
                .collect();
            match matches.as_slice() {
                [] => Err(TransportError::CollectionNotFound { name: name.clone() }),
                [(key, _)] => Ok(key.clone()),
                many => Err(TransportError::AmbiguousCollectionName {
                    name: name.clone(),
                    matches: many.len(),
                }),
            }
        }
    }
}

fn check_auth(status: StatusCode) -> Result<(), TransportError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportError::Authorization {
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Builds the parent item payload for a capture target.
fn build_parent_item(metadata: &ItemMetadata, target: &CaptureTarget) -> Value {
    let mut item = match target {
        CaptureTarget::WebUrl(url) => json!({
            "itemType": "webpage",
            "title": metadata.title,
            "url": url,
            "accessDate": metadata.access_date,
            "websiteTitle": metadata.domain.clone().unwrap_or_default(),
        }),
        CaptureTarget::ExistingFile(_) => json!({
            "itemType": "document",
            "title": metadata.title,
        }),
    };

    if let Some(ref description) = metadata.description {
        item["abstractNote"] = json!(description);
    }
    if let Some(ref date) = metadata.publication_date {
        item["date"] = json!(date);
    }
    if let Some((first, last)) = metadata.author_name_parts() {
        item["creators"] = json!([{
            "creatorType": "author",
            "firstName": first,
            "lastName": last,
        }]);
    }
    item["extra"] = json!(provenance_extra(metadata));
    item
}

/// Publishes items through the Zotero Web API.
#[derive(Debug, Clone)]
pub struct ApiTransport {
    client: ApiClient,
}

impl ApiTransport {
    /// Creates the transport around an [`ApiClient`].
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// The underlying API client.
    #[must_use]
    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

#[async_trait]
impl LibraryTransport for ApiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Api
    }

    fn supports_direct_attachment(&self) -> bool {
        // Attachment upload is a separate multi-step round trip after item
        // creation, with backend-dependent semantics.
        false
    }

    async fn is_available(&self) -> bool {
        self.client.is_reachable().await
    }

    #[instrument(skip_all, fields(title = %metadata.title))]
    async fn create_item(
        &self,
        metadata: &ItemMetadata,
        target: &CaptureTarget,
    ) -> Result<String, TransportError> {
        let item = build_parent_item(metadata, target);
        let response = self.client.create_items(std::slice::from_ref(&item)).await?;

        match response.first_key() {
            Some(key) => {
                info!(key, "Parent item created via Web API");
                Ok(key.to_string())
            }
            None => Err(TransportError::protocol(format!(
                "item write reported no success key (failed: {:?})",
                response.failed
            ))),
        }
    }

    #[instrument(skip_all, fields(parent = ?parent, filename = %artifact.filename))]
    async fn attach_pdf(
        &self,
        parent: Option<&str>,
        artifact: &CaptureArtifact,
        metadata: &ItemMetadata,
    ) -> Result<String, TransportError> {
        let Some(parent) = parent else {
            return Err(TransportError::protocol(
                "the Web API transport requires a parent item for attachments",
            ));
        };

        let attachment = json!({
            "itemType": "attachment",
            "linkMode": "imported_file",
            "title": format!("{} (PDF)", metadata.title),
            "contentType": "application/pdf",
            "filename": artifact.filename,
            "parentItem": parent,
            "url": metadata.source_url.clone().unwrap_or_default(),
        });

        let response = self
            .client
            .create_items(std::slice::from_ref(&attachment))
            .await
            .map_err(|e| TransportError::attachment_failed(parent, e.to_string()))?;
        let attachment_key = response
            .first_key()
            .ok_or_else(|| {
                TransportError::attachment_failed(
                    parent,
                    format!(
                        "attachment item write reported no success key (failed: {:?})",
                        response.failed
                    ),
                )
            })?
            .to_string();

        self.client
            .upload_file(&attachment_key, &artifact.filename, &artifact.pdf)
            .await?;

        Ok(attachment_key)
    }

    async fn resolve_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<String, TransportError> {
        resolve_collection_via(&self.client, collection).await
    }

    async fn assign(
        &self,
        item_key: &str,
        collection_key: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        assign_item(&self.client, item_key, collection_key, tags).await
    }

    async fn verify_item(&self, item_key: &str) -> Result<bool, TransportError> {
        Ok(self.client.get_item(item_key).await?.is_some())
    }
}
