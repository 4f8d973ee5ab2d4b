//! CLI argument definitions using clap derive macros.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use zotsave_core::config::{
    DEFAULT_API_BASE_URL, DEFAULT_CONNECTOR_HOST, DEFAULT_CONNECTOR_PORT, DEFAULT_WAIT_BUDGET_MS,
};
use zotsave_core::{
    ApiCredentials, CaptureTarget, CollectionRef, LibraryType, PublishConfig, SettleMode,
};

/// Capture a web page as a PDF and save it to a Zotero library.
///
/// Zotsave renders the page in a headless browser, expands collapsed
/// content, prints it to PDF, and files the result (with extracted
/// metadata) through the Zotero connector or the Web API.
#[derive(Parser, Debug)]
#[command(name = "zotsave")]
#[command(author, version, about)]
pub struct Args {
    /// URL of the page to capture
    #[arg(required_unless_present = "pdf", conflicts_with = "pdf")]
    pub url: Option<String>,

    /// Publish an existing PDF instead of capturing a page
    #[arg(long, value_name = "FILE")]
    pub pdf: Option<PathBuf>,

    /// Settle wait after page load, in milliseconds (0-120000)
    #[arg(short = 'w', long, default_value_t = DEFAULT_WAIT_BUDGET_MS, value_parser = clap::value_parser!(u64).range(0..=120_000))]
    pub wait: u64,

    /// Wait for network idle instead of sleeping a fixed delay
    #[arg(long)]
    pub network_idle: bool,

    /// Collection key to file the item under (wins over --collection-name)
    #[arg(long, value_name = "KEY")]
    pub collection_key: Option<String>,

    /// Collection name to file the item under (must match exactly one)
    #[arg(long, value_name = "NAME")]
    pub collection_name: Option<String>,

    /// Tag to apply to the saved item (repeatable)
    #[arg(short = 't', long = "tag", value_name = "TAG", default_values_t = vec!["zotsave".to_string()])]
    pub tags: Vec<String>,

    /// Zotero Web API key
    #[arg(long, env = "ZOTERO_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Zotero library identifier
    #[arg(long, env = "ZOTERO_LIBRARY_ID")]
    pub library_id: Option<String>,

    /// Library kind: user or group
    #[arg(long, env = "ZOTERO_LIBRARY_TYPE", default_value = "user")]
    pub library_type: LibraryType,

    /// Base URL of the Zotero connector endpoint
    #[arg(long, env = "ZOTERO_CONNECTOR_HOST", default_value = DEFAULT_CONNECTOR_HOST)]
    pub connector_host: String,

    /// Port of the Zotero connector endpoint
    #[arg(long, env = "ZOTERO_CONNECTOR_PORT", default_value_t = DEFAULT_CONNECTOR_PORT)]
    pub connector_port: u16,

    /// Base URL of the Zotero Web API
    #[arg(long, env = "ZOTERO_API_BASE_URL", default_value = DEFAULT_API_BASE_URL, hide = true)]
    pub api_base_url: String,

    /// Browser user agent override (default: random desktop agent)
    #[arg(long, env = "ZOTERO_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Persistent browser profile directory (forces headful mode)
    #[arg(long, env = "ZOTERO_BROWSER_USER_DATA_DIR", value_name = "DIR")]
    pub profile_dir: Option<PathBuf>,

    /// Also write the captured PDF into this directory
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Abort the whole run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// The capture target selected by the positional URL or `--pdf`.
    ///
    /// clap guarantees exactly one of the two is present.
    #[must_use]
    pub fn target(&self) -> CaptureTarget {
        match (&self.url, &self.pdf) {
            (Some(url), None) => CaptureTarget::WebUrl(url.clone()),
            (_, Some(path)) => CaptureTarget::ExistingFile(path.clone()),
            (None, None) => unreachable!("clap enforces url or --pdf"),
        }
    }

    /// Builds the immutable run configuration from the parsed arguments.
    #[must_use]
    pub fn to_config(&self) -> PublishConfig {
        let credentials = match (&self.api_key, &self.library_id) {
            (Some(api_key), Some(library_id)) => Some(ApiCredentials {
                api_key: api_key.clone(),
                library_id: library_id.clone(),
                library_type: self.library_type,
            }),
            _ => None,
        };

        // A key identifies the collection directly; a name needs a lookup.
        // When both are given the key wins.
        let collection = match (&self.collection_key, &self.collection_name) {
            (Some(key), _) => Some(CollectionRef::ByKey(key.clone())),
            (None, Some(name)) => Some(CollectionRef::ByName(name.clone())),
            (None, None) => None,
        };

        let settle = if self.network_idle {
            SettleMode::NetworkIdle
        } else {
            SettleMode::FixedDelay
        };

        PublishConfig {
            connector_host: self.connector_host.clone(),
            connector_port: self.connector_port,
            credentials,
            api_base_url: self.api_base_url.clone(),
            collection,
            tags: self.tags.iter().cloned().collect::<BTreeSet<_>>(),
            wait_budget: Duration::from_millis(self.wait),
            settle,
            user_agent: self.user_agent.clone(),
            profile_dir: self.profile_dir.clone(),
            ..PublishConfig::default()
        }
    }
}
