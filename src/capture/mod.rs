//! Browser-driven webpage capture.
//!
//! This module turns a live URL into a high-fidelity PDF in three stages,
//! each owned by its own component:
//!
//! - [`PageRenderer`] - loads the URL and stabilizes the DOM in a scoped
//!   [`RenderSession`]
//! - [`ContentExpander`] - reveals hidden and lazy content in a bounded loop
//! - [`PdfCapturer`] - serializes the settled page, nothing else
//!
//! The split keeps "making content visible" and "serializing it" apart, so
//! capture stays deterministic once the page has settled.

mod error;
mod expander;
mod pdf;
mod renderer;

pub use error::CaptureError;
pub use expander::{ContentExpander, ExpansionState, ExpansionStrategy};
pub use pdf::PdfCapturer;
pub use renderer::{PageRenderer, RenderOptions, RenderSession};

use std::path::PathBuf;
use std::time::Duration;

/// The single input source of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A live webpage to render and capture.
    WebUrl(String),
    /// An existing PDF on disk; render/expand/capture are skipped.
    ExistingFile(PathBuf),
}

impl CaptureTarget {
    /// The source URL, when the target is a webpage.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::WebUrl(url) => Some(url),
            Self::ExistingFile(_) => None,
        }
    }
}

impl std::fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebUrl(url) => write!(f, "{url}"),
            Self::ExistingFile(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Diagnostics gathered while producing a [`CaptureArtifact`].
#[derive(Debug, Clone, Default)]
pub struct CaptureDiagnostics {
    /// Final page scroll height after expansion, in CSS pixels.
    pub final_height: u64,
    /// Total wall time spent rendering and expanding.
    pub elapsed_wait: Duration,
    /// Number of expansion rounds performed.
    pub expansion_rounds: u32,
    /// Non-fatal problems encountered during capture, in occurrence order.
    pub warnings: Vec<String>,
}

/// The produced PDF plus its capture diagnostics.
///
/// Owned by the orchestrator until handed to a transport; never mutated
/// after creation.
#[derive(Debug, Clone)]
pub struct CaptureArtifact {
    /// The PDF byte stream.
    pub pdf: Vec<u8>,
    /// Sanitized filename the attachment will carry.
    pub filename: String,
    /// Capture diagnostics.
    pub diagnostics: CaptureDiagnostics,
}
