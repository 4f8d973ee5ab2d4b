//! Error types for the capture module.
//!
//! Structural capture failures abort the run; they carry enough context
//! (stage, URL, budget) for the caller to decide whether to retry.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while rendering and serializing a page.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Navigation failed before the page could load (DNS, connection refused, TLS).
    #[error("navigation to {url} failed: {reason}")]
    Navigation {
        /// The URL that failed to load.
        url: String,
        /// Human-readable cause from the browser engine.
        reason: String,
    },

    /// The page did not reach a stable load state within the wait budget.
    #[error("timed out after {budget:?} waiting for {url} to load")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// The configured wait budget that was exceeded.
        budget: Duration,
    },

    /// The engine could not serialize the page to PDF.
    #[error("PDF serialization failed: {reason}")]
    Render {
        /// Human-readable cause from the browser engine.
        reason: String,
    },

    /// The browser process could not be launched or crashed mid-session.
    #[error("browser error: {reason}")]
    Browser {
        /// Human-readable cause.
        reason: String,
    },
}

impl CaptureError {
    /// Creates a navigation error.
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            budget,
        }
    }

    /// Creates a render error.
    pub fn render(reason: impl Into<String>) -> Self {
        Self::Render {
            reason: reason.into(),
        }
    }

    /// Creates a browser error.
    pub fn browser(reason: impl Into<String>) -> Self {
        Self::Browser {
            reason: reason.into(),
        }
    }
}

// Note: no `From<chromiumoxide::error::CdpError>` impl. The CDP error alone
// cannot tell navigation failures from serialization failures; call sites map
// it through the helper constructors with the stage context they have.
