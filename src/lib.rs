//! Zotsave Core Library
//!
//! This library captures web pages as print-quality PDFs through a headless
//! browser and publishes them, with extracted metadata, into a Zotero
//! library over whichever transport is reachable.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`capture`] - Browser rendering, content expansion, PDF serialization
//! - [`metadata`] - Page/PDF metadata extraction and filename derivation
//! - [`transport`] - Connector and Web API publishing backends
//! - [`publish`] - The orchestrator tying capture to a transport
//! - [`config`] - Immutable run configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod config;
pub mod metadata;
pub mod publish;
pub mod transport;

// Re-export commonly used types
pub use capture::{CaptureArtifact, CaptureError, CaptureTarget};
pub use config::{ApiCredentials, LibraryType, PublishConfig, SettleMode};
pub use metadata::ItemMetadata;
pub use publish::{PublishError, PublishOrchestrator, PublishResult};
pub use transport::{CollectionRef, LibraryTransport, TransportError, TransportKind};

/// Crate version, recorded in item provenance.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
