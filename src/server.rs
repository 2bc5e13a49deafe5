//! HTTP daemon: `GET` hands out an archive's index, `POST` its diff.
//!
//! Handlers keep no state between requests. Each transform runs on a
//! blocking worker that writes the gzip tar stream into a bounded channel;
//! the handler waits for the first chunk before committing to a status, so
//! failures that happen early (missing or corrupt archive, short bitmap on a
//! small archive) still get a proper error status.

use crate::bitmap::PresenceBitmap;
use crate::checksum::fingerprint_file;
use crate::config::ServerConfig;
use crate::diff::serve_diff;
use crate::error::{DiffError, DiffResult};
use crate::index::build_index;
use crate::paths::normalize_under_root;
use crate::protocol::{CHANNEL_DEPTH, CONTENT_TYPE, DEFAULT_PORT, FINGERPRINT_HEADER};
use crate::tar_stream::{finish_tgz, ChannelWriter, Chunk};
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::{self, StreamExt};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Builder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared, read-only server state.
#[derive(Debug)]
pub struct ServerState {
    root: PathBuf,
    config: ServerConfig,
}

impl ServerState {
    /// Validate the config and canonicalize the archive root.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        if !config.root.exists() {
            anyhow::bail!("Root directory does not exist: {}", config.root.display());
        }
        if !config.root.is_dir() {
            anyhow::bail!("Root path is not a directory: {}", config.root.display());
        }
        let root = std::fs::canonicalize(&config.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;
        Ok(Self { root, config })
    }

    /// Map a request name onto an existing archive under the root.
    fn resolve(&self, name: &str) -> DiffResult<PathBuf> {
        let path = normalize_under_root(&self.root, Path::new(name))
            .map_err(|e| DiffError::InvalidPath(format!("{}: {}", name, e)))?;
        if !path.is_file() {
            return Err(DiffError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    async fn fingerprint(&self, archive: &Path) -> DiffResult<Option<String>> {
        if !self.config.fingerprint {
            return Ok(None);
        }
        let archive = archive.to_path_buf();
        let fp = tokio::task::spawn_blocking(move || fingerprint_file(&archive))
            .await
            .map_err(|e| DiffError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))??;
        Ok(Some(fp))
    }
}

/// Status code a failed request is answered with.
pub fn status_for(err: &DiffError) -> StatusCode {
    match err {
        DiffError::NotFound(_) => StatusCode::NOT_FOUND,
        DiffError::InvalidPath(_) | DiffError::MalformedBitmap(_) => StatusCode::BAD_REQUEST,
        DiffError::ArchiveChanged { .. } => StatusCode::PRECONDITION_FAILED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DiffError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if self.is_server_error() {
            error!("request failed: {}", self);
        } else {
            warn!("request rejected: {}", self);
        }
        (status, format!("{}\n", self)).into_response()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let timeout = state.config.io_timeout();
    Router::new()
        .route("/*name", get(index_handler).post(diff_handler))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let addr = bind_addr(&config.bind);
    let state = Arc::new(ServerState::new(config)?);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(root = %state.root.display(), "deltatard listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")
}

/// Serve on an already bound listener; used by tests to run on an ephemeral port.
pub async fn serve_listener(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server error")
}

/// `host` alone binds the default port.
fn bind_addr(bind: &str) -> String {
    if bind.parse::<SocketAddr>().is_ok() || bind.contains(':') {
        bind.to_string()
    } else {
        format!("{}:{}", bind, DEFAULT_PORT)
    }
}

async fn index_handler(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let archive = match state.resolve(&name) {
        Ok(path) => path,
        Err(e) => return e.into_response(),
    };
    let fingerprint = match state.fingerprint(&archive).await {
        Ok(fp) => fp,
        Err(e) => return e.into_response(),
    };
    info!("index {}", name);

    let verbosity = state.config.verbosity;
    stream_archive(state.config.chunk_size, fingerprint, move |out| {
        let source = open_source(&archive)?;
        let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
        let stats = build_index(source, &mut builder, verbosity)?;
        finish_tgz(builder)?;
        debug!(
            entries = stats.entries,
            hashed = stats.hashed,
            "index of {} complete",
            archive.display()
        );
        Ok(())
    })
    .await
}

/// `POST /<name>`: stream the entries the bitmap asks for.
///
/// A bitmap too short for the archive is a 500 only while nothing has been
/// sent yet. If the first response chunk already went out, the 200 body is
/// aborted instead and the client fails reading the truncated gzip stream.
async fn diff_handler(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match prepare_diff(&state, &name, &headers, &body).await {
        Ok((archive, bitmap)) => {
            info!(
                "diff {} ({} files requested, {} bitmap bytes)",
                name,
                bitmap.count_set(),
                bitmap.len()
            );
            let verbosity = state.config.verbosity;
            stream_archive(state.config.chunk_size, None, move |out| {
                let source = open_source(&archive)?;
                let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
                let stats = serve_diff(source, &bitmap, &mut builder, verbosity)?;
                finish_tgz(builder)?;
                debug!(
                    sent = stats.sent,
                    bytes = stats.bytes_sent,
                    "diff of {} complete",
                    archive.display()
                );
                Ok(())
            })
            .await
        }
        Err(e) => e.into_response(),
    }
}

async fn prepare_diff(
    state: &ServerState,
    name: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> DiffResult<(PathBuf, PresenceBitmap)> {
    let archive = state.resolve(name)?;
    if body.is_empty() {
        return Err(DiffError::MalformedBitmap("empty request body".to_string()));
    }
    let bitmap = PresenceBitmap::decode_gz(body)?;
    if bitmap.is_empty() {
        return Err(DiffError::MalformedBitmap("bitmap has no bytes".to_string()));
    }

    let expected = headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(expected) = expected {
        if let Some(actual) = state.fingerprint(&archive).await? {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(DiffError::ArchiveChanged { expected, actual });
            }
        }
    }
    Ok((archive, bitmap))
}

/// Concatenated gzip members (pigz, bgzip, `cat a.gz b.gz`) read as one stream.
fn open_source(path: &Path) -> DiffResult<MultiGzDecoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DiffError::NotFound(path.display().to_string()),
        _ => DiffError::Io(e),
    })?;
    Ok(MultiGzDecoder::new(BufReader::new(file)))
}

/// Run `work` on a blocking worker and stream what it writes.
///
/// The status is decided by the first message: an error becomes an error
/// response; data starts a 200 body. A failure after that aborts the body.
async fn stream_archive<F>(chunk_size: usize, fingerprint: Option<String>, work: F) -> Response
where
    F: FnOnce(&mut ChannelWriter<DiffError>) -> DiffResult<()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Chunk<DiffError>>(CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx, chunk_size);
        let result = work(&mut writer).and_then(|()| writer.flush().map_err(DiffError::from));
        match result {
            Ok(()) => debug!("streamed {} bytes", writer.bytes_sent()),
            Err(e) => {
                if writer.bytes_sent() > 0 {
                    error!("response aborted after {} bytes: {}", writer.bytes_sent(), e);
                }
                writer.fail(e);
            }
        }
    });

    let first = match rx.recv().await {
        Some(Err(e)) => return e.into_response(),
        first => first,
    };
    let rest = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
    let body = Body::from_stream(stream::iter(first).chain(rest));

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    if let Some(fp) = fingerprint.and_then(|fp| HeaderValue::from_str(&fp).ok()) {
        headers.insert(HeaderName::from_static(FINGERPRINT_HEADER), fp);
    }
    response
}
