//! Ephemeral localhost server for the connector attachment protocol.
//!
//! The connector's `saveSnapshot` endpoint ingests attachments by URL, so
//! the captured PDF is served from memory on a random loopback port just
//! long enough for the host application to fetch it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::header;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::error::TransportError;

/// Path the PDF is served under; fixed so the URL never needs escaping.
const SERVE_PATH: &str = "/during_transfer.pdf";

/// A one-shot PDF server bound to a random loopback port.
pub(crate) struct PdfServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PdfServer {
    /// Starts serving `bytes` and returns once the socket is bound.
    pub(crate) async fn serve(bytes: Vec<u8>) -> Result<Self, TransportError> {
        let body = Arc::new(bytes);
        let app = Router::new().route(
            SERVE_PATH,
            get(move || {
                let body = Arc::clone(&body);
                async move {
                    (
                        [(header::CONTENT_TYPE, "application/pdf")],
                        body.as_ref().clone(),
                    )
                }
            }),
        );

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TransportError::protocol(format!("PDF server bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::protocol(format!("PDF server address lookup: {e}")))?;

        let (shutdown, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        debug!(%addr, "Serving PDF for connector pickup");
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    /// The URL the host application should fetch.
    pub(crate) fn url(&self) -> String {
        format!("http://127.0.0.1:{}{SERVE_PATH}", self.addr.port())
    }

    /// Stops the server and waits for the task to drain.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        debug!("PDF server stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pdf_server_serves_bytes_once() {
        let payload = b"%PDF-1.7 fake".to_vec();
        let server = PdfServer::serve(payload.clone()).await.unwrap();
        let url = server.url();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.ends_with("/during_transfer.pdf"));

        let fetched = reqwest::get(&url).await.unwrap();
        assert_eq!(
            fetched.headers().get("content-type").unwrap(),
            "application/pdf"
        );
        assert_eq!(fetched.bytes().await.unwrap().as_ref(), payload.as_slice());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_pdf_server_stop_releases_port() {
        let server = PdfServer::serve(vec![1, 2, 3]).await.unwrap();
        let url = server.url();
        server.stop().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
