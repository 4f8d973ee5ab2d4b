//! PDF serialization of a stabilized page.
//!
//! [`PdfCapturer`] does no scrolling and no waiting. Making content visible
//! is the renderer's and expander's job; this component only serializes what
//! is already there, so its output is deterministic for a settled session.

use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use tracing::{debug, instrument};

use super::error::CaptureError;
use super::renderer::RenderSession;
use super::{CaptureArtifact, CaptureDiagnostics};

/// A4 in inches; continuous-reading layout relies on CSS flow, not fixed
/// pagination, so dynamic-height content is never truncated mid-page.
const PAPER_WIDTH_IN: f64 = 8.27;
const PAPER_HEIGHT_IN: f64 = 11.7;
const MARGIN_IN: f64 = 0.4;

/// Slightly scaled down to fit more content per page.
const PDF_SCALE: f64 = 0.9;

/// Serializes a [`RenderSession`] into a print-quality PDF.
#[derive(Debug, Default)]
pub struct PdfCapturer;

impl PdfCapturer {
    /// Creates a capturer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Produces the PDF bytes for the session's page.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Render`] if the engine cannot produce output,
    /// e.g. when the session's page has already been closed.
    #[instrument(skip_all)]
    pub async fn capture(
        &self,
        session: &RenderSession,
        filename: String,
        diagnostics: CaptureDiagnostics,
    ) -> Result<CaptureArtifact, CaptureError> {
        let params = PrintToPdfParams {
            print_background: Some(true),
            scale: Some(PDF_SCALE),
            paper_width: Some(PAPER_WIDTH_IN),
            paper_height: Some(PAPER_HEIGHT_IN),
            margin_top: Some(MARGIN_IN),
            margin_bottom: Some(MARGIN_IN),
            margin_left: Some(MARGIN_IN),
            margin_right: Some(MARGIN_IN),
            prefer_css_page_size: Some(false),
            ..PrintToPdfParams::default()
        };

        let pdf = session
            .page()
            .pdf(params)
            .await
            .map_err(|e| CaptureError::render(e.to_string()))?;

        if pdf.is_empty() {
            return Err(CaptureError::render("engine produced an empty PDF"));
        }

        debug!(bytes = pdf.len(), filename = %filename, "PDF captured");
        Ok(CaptureArtifact {
            pdf,
            filename,
            diagnostics,
        })
    }
}
