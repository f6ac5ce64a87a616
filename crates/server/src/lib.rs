//! Keel catalog file server: regular files only, gzip above a size threshold.

#![forbid(unsafe_code)]

pub mod content;

use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};

pub use content::{CatalogContent, ContentError};

/// Bodies smaller than this are never compressed.
pub const DEFAULT_GZIP_MIN_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub gzip_min_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)), gzip_min_size: DEFAULT_GZIP_MIN_SIZE }
    }
}

/// One published unpack: its directory and the indexed catalog objects found in it.
#[derive(Debug)]
pub struct ServedCatalog {
    pub root: PathBuf,
    pub content: CatalogContent,
}

/// Immutable view of which unpack directory serves which catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    pub epoch: u64,
    pub catalogs: BTreeMap<String, Arc<ServedCatalog>>,
}

/// Catalog roots shared between the unpack loop (writer) and request handlers (readers).
#[derive(Debug, Clone, Default)]
pub struct CatalogStore {
    index: Arc<ArcSwap<CatalogIndex>>,
}

impl CatalogStore {
    pub fn new() -> Self { Self::default() }

    pub fn current(&self) -> Arc<CatalogIndex> { self.index.load_full() }

    /// Index the content under `root` and point `catalog` at it; readers switch over atomically.
    /// Republishing the root already being served is a no-op.
    pub async fn publish(&self, catalog: &str, root: PathBuf) -> Result<(), ContentError> {
        if self.get(catalog).is_some_and(|c| c.root == root) {
            return Ok(());
        }
        let content = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || CatalogContent::load(&root))
                .await
                .map_err(|e| ContentError::Io { path: PathBuf::new(), source: std::io::Error::other(e) })??
        };
        info!(catalog = %catalog, root = %root.display(), metas = content.len(), "publishing catalog");
        let served = Arc::new(ServedCatalog { root, content });
        self.index.rcu(|cur| {
            let mut next = CatalogIndex::clone(cur);
            next.catalogs.insert(catalog.to_string(), served.clone());
            next.epoch = next.epoch.saturating_add(1);
            next
        });
        Ok(())
    }

    pub fn remove(&self, catalog: &str) {
        self.index.rcu(|cur| {
            let mut next = CatalogIndex::clone(cur);
            next.catalogs.remove(catalog);
            next.epoch = next.epoch.saturating_add(1);
            next
        });
    }

    fn get(&self, catalog: &str) -> Option<Arc<ServedCatalog>> {
        self.index.load().catalogs.get(catalog).cloned()
    }
}

#[derive(Clone)]
struct AppState {
    store: CatalogStore,
    gzip_min_size: usize,
}

/// Routes (GET and HEAD):
/// - `/catalogs/{catalog}/api/v1/all` - every catalog object as JSON lines
/// - `/catalogs/{catalog}/api/v1/metas?schema=&package=&name=` - the objects matching all given filters
/// - `/catalogs/{catalog}/{*path}` - a regular file below the catalog's unpack root
/// - `/healthz`
pub fn router(store: CatalogStore, gzip_min_size: usize) -> Router {
    Router::new()
        .route("/catalogs/{catalog}/{*path}", get(serve_catalog))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { store, gzip_min_size })
        .layer(middleware::from_fn(log_requests))
}

pub async fn serve(config: ServerConfig, store: CatalogStore, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| ServeError::Bind { addr: config.listen_addr, source })?;
    info!(addr = %config.listen_addr, "catalog server listening");
    axum::serve(listener, router(store, config.gzip_min_size))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServeError::Serve)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();
    let resp = next.run(req).await;
    counter!("catalog_http_requests_total", 1u64);
    info!(
        method = %method,
        url = %uri,
        status = resp.status().as_u16(),
        duration_ms = started.elapsed().as_secs_f64() * 1000.0,
        "handled request"
    );
    resp
}

/// Join `rel` below `root`, refusing anything that is not a plain relative path.
fn resolve(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim_start_matches('/'));
    let mut out = root.to_path_buf();
    for c in rel.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Whether `file` is a regular file reached from `root` through real directories only.
/// No component may be a symlink, so nothing outside `root` is ever reachable.
async fn is_contained_regular_file(root: &Path, file: &Path) -> bool {
    let Ok(rel) = file.strip_prefix(root) else {
        return false;
    };
    let mut cur = root.to_path_buf();
    let mut parts = rel.components().peekable();
    while let Some(part) = parts.next() {
        cur.push(part);
        let Ok(md) = tokio::fs::symlink_metadata(&cur).await else {
            return false;
        };
        let ft = md.file_type();
        let ok = if parts.peek().is_some() { ft.is_dir() } else { ft.is_file() };
        if !ok {
            return false;
        }
    }
    cur != root
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn http_date(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).format(HTTP_DATE_FORMAT).to_string()
}

/// True when the client's copy, dated by `If-Modified-Since`, is still current.
fn not_modified(headers: &HeaderMap, modified: SystemTime) -> bool {
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    else {
        return false;
    };
    DateTime::<Utc>::from(modified).timestamp() <= since.timestamp()
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => "application/jsonl",
        Some("json") => "application/json",
        Some("yaml") | Some("yml") => "application/yaml",
        _ => "application/octet-stream",
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|enc| {
            let mut parts = enc.trim().split(';');
            let name = parts.next().unwrap_or("").trim();
            let disabled = parts.any(|p| p.trim().replace(' ', "") == "q=0");
            (name.eq_ignore_ascii_case("gzip") || name == "*") && !disabled
        })
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

/// Encode `data` as the response body, gzipped when it is large enough and the client allows it.
/// HEAD requests get the headers only.
fn respond(state: &AppState, method: &Method, req_headers: &HeaderMap, mut resp_headers: HeaderMap, data: Vec<u8>) -> Response {
    resp_headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    let body = if data.len() >= state.gzip_min_size && accepts_gzip(req_headers) {
        match gzip(&data) {
            Ok(compressed) => {
                resp_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                compressed
            }
            Err(_) => data,
        }
    } else {
        data
    };
    if *method == Method::HEAD {
        return (StatusCode::OK, resp_headers).into_response();
    }
    (StatusCode::OK, resp_headers, Body::from(body)).into_response()
}

fn last_modified(modified: SystemTime) -> HeaderMap {
    let mut h = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&http_date(modified)) {
        h.insert(header::LAST_MODIFIED, v);
    }
    h
}

async fn serve_catalog(
    State(state): State<AppState>,
    method: Method,
    UrlPath((catalog, path)): UrlPath<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let Some(served) = state.store.get(&catalog) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match path.trim_start_matches('/') {
        "api/v1/all" => serve_all(&state, &method, &headers, &served),
        "api/v1/metas" => serve_metas(&state, &method, &headers, &served, &params),
        rel => serve_file(&state, &method, &headers, &served, rel).await,
    }
}

fn serve_all(state: &AppState, method: &Method, headers: &HeaderMap, served: &ServedCatalog) -> Response {
    let modified = served.content.modified();
    let mut resp_headers = last_modified(modified);
    if not_modified(headers, modified) {
        return (StatusCode::NOT_MODIFIED, resp_headers).into_response();
    }
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/jsonl"));
    respond(state, method, headers, resp_headers, served.content.all().to_vec())
}

fn serve_metas(state: &AppState, method: &Method, headers: &HeaderMap, served: &ServedCatalog, params: &[(String, String)]) -> Response {
    let (mut schema, mut package, mut name) = ("", "", "");
    for (key, value) in params {
        match key.as_str() {
            "schema" => schema = value.as_str(),
            "package" => package = value.as_str(),
            "name" => name = value.as_str(),
            other => {
                debug!(param = %other, "rejecting unknown query parameter");
                return (StatusCode::BAD_REQUEST, "Invalid parameters\n").into_response();
            }
        }
    }
    let modified = served.content.modified();
    let mut resp_headers = last_modified(modified);
    if not_modified(headers, modified) {
        return (StatusCode::NOT_MODIFIED, resp_headers).into_response();
    }
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/jsonl"));
    respond(state, method, headers, resp_headers, served.content.metas(schema, package, name).to_vec())
}

async fn serve_file(state: &AppState, method: &Method, headers: &HeaderMap, served: &ServedCatalog, rel: &str) -> Response {
    let Some(file) = resolve(&served.root, rel) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // Directories, symlinks and special files all look absent, at any depth.
    if !is_contained_regular_file(&served.root, &file).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    let data = match tokio::fs::read(&file).await {
        Ok(d) => d,
        Err(e) => {
            debug!(path = %file.display(), error = %e, "read failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&file)));
    respond(state, method, headers, resp_headers, data)
}
