//! Run configuration for the capture-and-publish pipeline.
//!
//! A [`PublishConfig`] is an immutable value constructed once (by the CLI or a
//! library caller) and threaded through the orchestrator. Nothing in the core
//! reads process-global state, so multiple pipelines with different
//! configurations can coexist in one process.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::transport::CollectionRef;

/// Default connector host (the Zotero desktop application listens on loopback).
pub const DEFAULT_CONNECTOR_HOST: &str = "http://127.0.0.1";

/// Default connector port used by the Zotero desktop application.
pub const DEFAULT_CONNECTOR_PORT: u16 = 23119;

/// Default wait budget for page load, in milliseconds.
pub const DEFAULT_WAIT_BUDGET_MS: u64 = 5000;

/// Base URL of the Zotero Web API.
pub const DEFAULT_API_BASE_URL: &str = "https://api.zotero.org";

/// Zotero library kind addressed by the Web API transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryType {
    /// A personal user library (`/users/{id}`).
    User,
    /// A shared group library (`/groups/{id}`).
    Group,
}

impl LibraryType {
    /// Returns the URL path segment for this library kind.
    #[must_use]
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Group => "groups",
        }
    }
}

impl FromStr for LibraryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            other => Err(format!("library type must be 'user' or 'group', got '{other}'")),
        }
    }
}

/// Credentials for the Zotero Web API.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    /// Bearer API key sent in the `Zotero-API-Key` header.
    pub api_key: String,
    /// Numeric library identifier.
    pub library_id: String,
    /// Whether the library is a user or group library.
    pub library_type: LibraryType,
}

/// How the renderer waits for a page to settle after the load event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// Wait a fixed delay after navigation completes.
    FixedDelay,
    /// Wait for a quiet window with no in-flight network requests, bounded
    /// by the wait budget.
    NetworkIdle,
}

/// Knobs for the content-expansion loop.
///
/// The defaults are conservative; both bounds exist so expansion terminates
/// even on synthetic infinite-scroll pages.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    /// Hard cap on expansion rounds.
    pub round_cap: u32,
    /// Rounds with no height/node-count growth before expansion stops.
    pub stagnation_threshold: u32,
    /// Settle interval between rounds.
    pub settle_delay: Duration,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            round_cap: 10,
            stagnation_threshold: 2,
            settle_delay: Duration::from_millis(800),
        }
    }
}

/// Bounded polling used to recover item keys after a connector snapshot save.
///
/// The connector's `saveSnapshot` response does not include the created item
/// key, so the transport polls the Web API until the item is indexed.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Maximum number of read-back attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Immutable configuration for one publish pipeline.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Connector host, including scheme.
    pub connector_host: String,
    /// Connector port.
    pub connector_port: u16,
    /// Web API credentials; absence disables the API fallback transport.
    pub credentials: Option<ApiCredentials>,
    /// Web API base URL (overridable for tests).
    pub api_base_url: String,
    /// Target collection, by key or by name.
    pub collection: Option<CollectionRef>,
    /// Tags applied to the created item.
    pub tags: BTreeSet<String>,
    /// Page-load wait budget.
    pub wait_budget: Duration,
    /// Settle behavior after the load event.
    pub settle: SettleMode,
    /// Custom user agent; when `None` one is chosen at random per session.
    pub user_agent: Option<String>,
    /// Persistent browser profile directory. Setting this forces headful mode.
    ///
    /// The directory is an externally shared resource with no internal
    /// locking; concurrent use by another process is out of contract.
    pub profile_dir: Option<PathBuf>,
    /// Content-expansion knobs.
    pub expand: ExpandOptions,
    /// Connector item-key recovery polling.
    pub poll: PollOptions,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            connector_host: DEFAULT_CONNECTOR_HOST.to_string(),
            connector_port: DEFAULT_CONNECTOR_PORT,
            credentials: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            collection: None,
            tags: BTreeSet::new(),
            wait_budget: Duration::from_millis(DEFAULT_WAIT_BUDGET_MS),
            settle: SettleMode::FixedDelay,
            user_agent: None,
            profile_dir: None,
            expand: ExpandOptions::default(),
            poll: PollOptions::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_library_type_from_str() {
        assert_eq!("user".parse::<LibraryType>().unwrap(), LibraryType::User);
        assert_eq!("GROUP".parse::<LibraryType>().unwrap(), LibraryType::Group);
        assert!("team".parse::<LibraryType>().is_err());
    }

    #[test]
    fn test_library_type_path_segment() {
        assert_eq!(LibraryType::User.path_segment(), "users");
        assert_eq!(LibraryType::Group.path_segment(), "groups");
    }

    #[test]
    fn test_publish_config_defaults() {
        let config = PublishConfig::default();
        assert_eq!(config.connector_port, DEFAULT_CONNECTOR_PORT);
        assert_eq!(config.wait_budget, Duration::from_millis(5000));
        assert_eq!(config.expand.round_cap, 10);
        assert_eq!(config.expand.stagnation_threshold, 2);
        assert!(config.credentials.is_none());
    }
}
