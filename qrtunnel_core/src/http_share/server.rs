//! HTTP server for file sharing
//!
//! Serves the listing page, single files and the combined archive on a
//! loopback port that the tunnel exposes publicly.

use crate::archive::ArchiveBuilder;
use crate::error::{Result, ShareError};
use crate::manifest::Manifest;
use axum::{
    Router,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::page;

/// Route serving the combined archive
pub const ARCHIVE_ROUTE: &str = "/download-all";

/// State shared by every request handler
pub struct ShareState {
    pub manifest: Arc<Manifest>,
    pub archive: Arc<ArchiveBuilder>,
    pub archive_name: String,
}

/// Handler for the listing page
async fn index_handler(State(state): State<Arc<ShareState>>) -> Html<String> {
    Html(page::listing_page(&state.manifest))
}

/// Handler for invalid routes - serves 404 page
async fn not_found_handler() -> (StatusCode, Html<String>) {
    (StatusCode::NOT_FOUND, Html(page::not_found_page()))
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Stream one manifest entry by display name
async fn file_handler(
    State(state): State<Arc<ShareState>>,
    Path(display_name): Path<String>,
) -> Result<Response> {
    let entry = state
        .manifest
        .get(&display_name)
        .ok_or_else(|| ShareError::NotFound(display_name.clone()))?;

    stream_file(
        &entry.absolute_path,
        "application/octet-stream",
        &entry.display_name,
    )
    .await
}

/// Stream the combined archive, building it on first request
async fn archive_handler(State(state): State<Arc<ShareState>>) -> Result<Response> {
    let archive = state.archive.get_archive().await?;
    stream_file(archive.path(), "application/zip", &state.archive_name).await
}

async fn stream_file(
    path: &std::path::Path,
    content_type: &'static str,
    download_name: &str,
) -> Result<Response> {
    let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ShareError::NotFound(download_name.to_string()),
        _ => ShareError::Server(format!("cannot open {}: {}", path.display(), e)),
    })?;
    let length = file
        .metadata()
        .await
        .map_err(|e| ShareError::Server(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    tracing::info!(file = %download_name, bytes = length, "Serving download");

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            page::content_disposition(download_name),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ShareError::Server(e.to_string()))
}

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'none'; style-src 'unsafe-inline'; img-src 'self' data:; base-uri 'none'; form-action 'none'; frame-ancestors 'none'",
        ),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

/// Build the axum router for a share
pub fn create_router(state: Arc<ShareState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/files/{display_name}", get(file_handler))
        .route(ARCHIVE_ROUTE, get(archive_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// How long aborted connections get to unwind before the serve task is dropped
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Accepted connection that fails all further I/O once `abort` is cancelled.
///
/// Cancellation wakes the connection task, so a write blocked on a slow
/// client ends too.
struct AbortableStream {
    inner: TcpStream,
    abort: Pin<Box<WaitForCancellationFutureOwned>>,
    aborted: bool,
}

impl AbortableStream {
    fn new(inner: TcpStream, abort: &CancellationToken) -> Self {
        Self {
            inner,
            abort: Box::pin(abort.clone().cancelled_owned()),
            aborted: false,
        }
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.aborted && self.abort.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        self.aborted
    }
}

fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transfer abandoned at shutdown")
}

impl AsyncRead for AbortableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AbortableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// TCP listener whose connections share one abort token.
struct AbortableListener {
    inner: TcpListener,
    abort: CancellationToken,
}

impl axum::serve::Listener for AbortableListener {
    type Io = AbortableStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = axum::serve::Listener::accept(&mut self.inner).await;
        (AbortableStream::new(stream, &self.abort), addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Bound,
    Serving,
    ShuttingDown,
    Stopped,
}

/// Owns the listening socket for the lifetime of a session.
pub struct FileServer {
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    phase: ServerPhase,
    shutdown: CancellationToken,
    abort: CancellationToken,
    stopped: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    task: Option<JoinHandle<()>>,
}

impl FileServer {
    /// Bind `host:port`; port 0 picks a free ephemeral port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ShareError::PortInUse { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ShareError::PortInUse { port, source })?;

        tracing::debug!("Bound local file server to {}", local_addr);

        Ok(Self {
            local_addr,
            listener: Some(listener),
            phase: ServerPhase::Bound,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            stopped: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
            task: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    /// Start accepting connections in a background task.
    pub fn serve(&mut self, router: Router) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ShareError::Server("server is not in the bound state".to_string()))?;

        let listener = AbortableListener {
            inner: listener,
            abort: self.abort.clone(),
        };
        let shutdown = self.shutdown.clone();
        let stopped = self.stopped.clone();
        let failure = self.failure.clone();
        let addr = self.local_addr;

        self.task = Some(tokio::spawn(async move {
            tracing::info!("HTTP server starting on http://{}", addr);

            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    tracing::info!("HTTP server shutting down gracefully");
                })
                .await;

            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                if let Ok(mut slot) = failure.lock() {
                    *slot = Some(e.to_string());
                }
            }
            stopped.cancel();
        }));
        self.phase = ServerPhase::Serving;
        Ok(())
    }

    /// Resolves once the serve task has ended, for whatever reason.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Error message if the serve loop ended with an error
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|slot| slot.clone())
    }

    /// Stop accepting new connections; in-flight transfers keep going.
    pub fn begin_shutdown(&mut self) {
        self.shutdown.cancel();
        if self.phase == ServerPhase::Serving {
            self.phase = ServerPhase::ShuttingDown;
        }
    }

    /// Wait for in-flight transfers up to `grace`, then abort them and release the socket.
    pub async fn wait_stopped(&mut self, grace: Duration) {
        self.begin_shutdown();
        self.listener.take();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("HTTP server task ended abnormally: {}", e),
                Err(_) => {
                    tracing::warn!(
                        "In-flight transfers still running after {:?}; abandoning them",
                        grace
                    );
                    self.abort.cancel();
                    if tokio::time::timeout(ABORT_WAIT, &mut task).await.is_err() {
                        task.abort();
                        let _ = task.await;
                    }
                }
            }
        }
        // connection tasks axum still owns fail on their next poll
        self.abort.cancel();

        self.phase = ServerPhase::Stopped;
        tracing::info!("HTTP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn empty_router() -> Router {
        let manifest = Arc::new(Manifest::default());
        let archive = Arc::new(ArchiveBuilder::new(manifest.clone()));
        create_router(Arc::new(ShareState {
            manifest,
            archive,
            archive_name: "files.zip".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_security_headers() {
        let response = empty_router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let headers = response.headers();
        assert!(headers.get("content-security-policy").is_some());
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
    }

    #[tokio::test]
    async fn test_cors_headers_absent() {
        let response = empty_router()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Origin", "http://evil.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let response = empty_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = empty_router()
            .oneshot(Request::builder().uri("/etc/passwd").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_and_release() {
        let mut server = FileServer::bind("127.0.0.1", 0).await.unwrap();
        let port = server.port();
        assert_ne!(port, 0);
        assert_eq!(server.phase(), ServerPhase::Bound);

        server.serve(empty_router()).unwrap();
        assert_eq!(server.phase(), ServerPhase::Serving);

        server.wait_stopped(Duration::from_secs(1)).await;
        assert_eq!(server.phase(), ServerPhase::Stopped);

        // socket must be free again
        let rebound = FileServer::bind("127.0.0.1", port).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_bind_taken_port_fails() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = FileServer::bind("127.0.0.1", port).await;
        assert!(matches!(result, Err(ShareError::PortInUse { .. })));
    }
}
