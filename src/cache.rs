//! Content-addressed cache and embedded registry.
//!
//! The cache is a standard distribution filesystem tree:
//!
//! ```text
//! <root>/docker/registry/v2/
//! ├── blobs/sha256/<aa>/<full-hex>/data
//! └── repositories/<name>/_manifests/
//!     ├── revisions/sha256/<hex>/link
//!     └── tags/<tag>/current/link
//! ```
//!
//! An embedded registry serves this tree over HTTP on a loopback port so
//! the image-copy primitive can treat the cache like any other registry.
//! Deletion is enabled: manifests can be unlinked and blob files removed,
//! which the delete pipeline relies on.
//!
//! ## Ownership
//!
//! While the registry task runs it owns the cache tree; the coordinator
//! reads the tree directly only after [`RunningRegistry::stop`] has
//! completed, which the archive builder depends on for a quiescent view.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    BLOBS_SUBPATH, CACHE_ENV_VAR, DEFAULT_CACHE_SUBDIR, DOCKER_MANIFEST_MEDIA_TYPE,
    REGISTRY_BLOB_PREFIX,
};
use crate::error::{Error, Result};

// =============================================================================
// Cache Store
// =============================================================================

/// Filesystem access to the cache tree.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Opens (creating if needed) the cache at `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join(BLOBS_SUBPATH)).map_err(|e| Error::Storage {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        info!("cache initialized at {}", root.display());
        Ok(Self { root })
    }

    /// Resolves the cache root: `AIRLIFT_CACHE` override or
    /// `$HOME/.airlift/.cache`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_ENV_VAR) {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CACHE_SUBDIR)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob's data file.
    ///
    /// # Security
    ///
    /// The digest is validated (sha256 + hex) before any path is built, so
    /// a crafted digest cannot traverse outside the blob tree.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| Error::Format {
                context: "cache".to_string(),
                reason: format!("malformed digest '{}'", digest),
            })?;
        Ok(self
            .root
            .join(BLOBS_SUBPATH)
            .join(&hex[..2])
            .join(hex)
            .join("data"))
    }

    /// Checks blob existence.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Reads a blob.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Stores a blob after verifying its content digest.
    ///
    /// Writes go through a uniquely named temp file followed by an atomic
    /// rename, so concurrent writers of the same blob cannot corrupt it.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        if computed != digest {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                computed,
            });
        }
        let path = self.blob_path(digest)?;
        if path.exists() {
            debug!("blob {} already cached", digest);
            return Ok(());
        }
        let parent = path.parent().expect("blob path has a parent");
        fs::create_dir_all(parent).map_err(|e| Error::Storage {
            path: parent.to_path_buf(),
            reason: e.to_string(),
        })?;
        let temp = parent.join(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp, data).map_err(|e| Error::Storage {
            path: temp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            Error::Storage {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!("stored blob {} ({} bytes)", digest, data.len());
        Ok(())
    }

    /// Removes a blob's directory (`<aa>/<hex>/`). Missing blobs are not
    /// an error; forced cache deletion warns and continues.
    pub fn delete_blob(&self, digest: &str) -> Result<bool> {
        let path = self.blob_path(digest)?;
        let dir = path.parent().expect("blob path has a parent");
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir).map_err(|e| Error::Storage {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(true)
    }

    // =========================================================================
    // Manifest Links
    // =========================================================================

    fn manifests_dir(&self, name: &str) -> PathBuf {
        self.root
            .join(REGISTRY_BLOB_PREFIX)
            .join("repositories")
            .join(name)
            .join("_manifests")
    }

    /// Records a manifest revision and, for tag references, the tag link.
    pub fn link_manifest(&self, name: &str, reference: &str, digest: &str) -> Result<()> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let revision = self
            .manifests_dir(name)
            .join("revisions")
            .join("sha256")
            .join(hex)
            .join("link");
        write_link(&revision, digest)?;
        if !reference.starts_with("sha256:") {
            let tag_link = self
                .manifests_dir(name)
                .join("tags")
                .join(reference)
                .join("current")
                .join("link");
            write_link(&tag_link, digest)?;
        }
        Ok(())
    }

    /// Resolves a tag or digest reference to a manifest digest.
    pub fn resolve_manifest(&self, name: &str, reference: &str) -> Option<String> {
        if reference.starts_with("sha256:") {
            let hex = reference.strip_prefix("sha256:").unwrap_or(reference);
            let revision = self
                .manifests_dir(name)
                .join("revisions")
                .join("sha256")
                .join(hex)
                .join("link");
            return revision.exists().then(|| reference.to_string());
        }
        let tag_link = self
            .manifests_dir(name)
            .join("tags")
            .join(reference)
            .join("current")
            .join("link");
        fs::read_to_string(tag_link)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Unlinks a manifest revision and any tags pointing at it.
    pub fn delete_manifest(&self, name: &str, digest: &str) -> Result<bool> {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let revision = self
            .manifests_dir(name)
            .join("revisions")
            .join("sha256")
            .join(hex);
        let existed = revision.exists();
        if existed {
            fs::remove_dir_all(&revision).map_err(|e| Error::Storage {
                path: revision.clone(),
                reason: e.to_string(),
            })?;
        }
        let tags_dir = self.manifests_dir(name).join("tags");
        if let Ok(tags) = fs::read_dir(&tags_dir) {
            for tag in tags.filter_map(|t| t.ok()) {
                let link = tag.path().join("current").join("link");
                if let Ok(linked) = fs::read_to_string(&link) {
                    if linked.trim() == digest {
                        let _ = fs::remove_dir_all(tag.path());
                    }
                }
            }
        }
        Ok(existed)
    }

    /// Lists all repository names with manifests.
    pub fn list_repositories(&self) -> Vec<String> {
        let repos_root = self.root.join(REGISTRY_BLOB_PREFIX).join("repositories");
        let mut out = Vec::new();
        collect_repositories(&repos_root, &repos_root, &mut out);
        out.sort();
        out
    }
}

fn write_link(path: &Path, digest: &str) -> Result<()> {
    let parent = path.parent().expect("link path has a parent");
    fs::create_dir_all(parent).map_err(|e| Error::Storage {
        path: parent.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, digest).map_err(|e| Error::Storage {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn collect_repositories(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some("_manifests") {
            if let Ok(rel) = dir.strip_prefix(root) {
                out.push(rel.to_string_lossy().to_string());
            }
            continue;
        }
        collect_repositories(root, &path, out);
    }
}

// =============================================================================
// Embedded Registry
// =============================================================================

struct RegistryState {
    store: CacheStore,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    access_log: Option<Mutex<fs::File>>,
}

impl RegistryState {
    fn log_access(&self, method: &Method, path: &str, status: StatusCode) {
        if let Some(log) = &self.access_log {
            if let Ok(mut file) = log.lock() {
                let _ = writeln!(file, "{} {} {}", method, path, status.as_u16());
            }
        }
    }
}

/// Handle to the running embedded registry task.
pub struct RunningRegistry {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    /// `localhost:<port>`, usable as a registry host in image references.
    pub fqdn: String,
}

impl RunningRegistry {
    /// Requests a cooperative shutdown and waits for the server task to
    /// finish, leaving the cache tree quiescent.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
        info!("cache registry stopped");
    }
}

/// Starts the embedded registry on `127.0.0.1:<port>`.
///
/// The server owns a clone of the store handle; the returned
/// [`RunningRegistry`] must be stopped before the cache tree is read
/// directly (archive build).
pub async fn start_registry(
    store: CacheStore,
    port: u16,
    access_log: Option<PathBuf>,
) -> Result<RunningRegistry> {
    let access_log = match access_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    let state = Arc::new(RegistryState {
        store,
        uploads: Mutex::new(HashMap::new()),
        access_log,
    });

    let app = Router::new()
        .route("/v2/", any(api_version_check))
        .route("/v2/{*path}", any(dispatch))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::CacheRegistry(format!("unable to bind {}: {}", addr, e)))?;
    // port 0 lets the OS pick; report what was actually bound
    let actual_port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(port);
    let fqdn = format!("localhost:{}", actual_port);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = server.await {
            warn!("cache registry terminated with error: {}", e);
        }
    });

    info!("cache registry listening on {}", fqdn);
    Ok(RunningRegistry {
        shutdown: shutdown_tx,
        handle,
        fqdn,
    })
}

async fn api_version_check(State(state): State<Arc<RegistryState>>, method: Method) -> Response {
    state.log_access(&method, "/v2/", StatusCode::OK);
    Response::builder()
        .status(StatusCode::OK)
        .header("Docker-Distribution-API-Version", "registry/2.0")
        .body(Body::from("{}"))
        .expect("static response")
}

/// Single dispatch point for every `/v2/<name>/...` route. Repository
/// names may contain slashes, so the path is parsed manually instead of
/// relying on fixed segment counts.
async fn dispatch(
    State(state): State<Arc<RegistryState>>,
    method: Method,
    uri: Uri,
    body: bytes::Bytes,
) -> Response {
    let path = uri.path().trim_start_matches("/v2/").to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = route(&state, &method, &uri, &segments, body);
    state.log_access(&method, uri.path(), response.status());
    response
}

fn route(
    state: &RegistryState,
    method: &Method,
    uri: &Uri,
    segments: &[&str],
    body: bytes::Bytes,
) -> Response {
    // .../blobs/uploads/<uuid?> must be checked before .../blobs/<digest>
    if let Some(idx) = find_marker(segments, "blobs") {
        if segments.get(idx + 1) == Some(&"uploads") {
            let name = segments[..idx].join("/");
            let upload_id = segments.get(idx + 2).map(|s| s.to_string());
            return handle_upload(state, method, uri, &name, upload_id, body);
        }
        let name = segments[..idx].join("/");
        if let Some(digest) = segments.get(idx + 1) {
            return handle_blob(state, method, &name, digest);
        }
    }
    if let Some(idx) = find_marker(segments, "manifests") {
        let name = segments[..idx].join("/");
        if let Some(reference) = segments.get(idx + 1) {
            return handle_manifest(state, method, &name, reference, body);
        }
    }
    status_response(StatusCode::NOT_FOUND)
}

/// Index of the last route marker, so repository names containing the
/// marker word remain addressable.
fn find_marker(segments: &[&str], marker: &str) -> Option<usize> {
    segments.iter().rposition(|s| *s == marker)
}

fn handle_manifest(
    state: &RegistryState,
    method: &Method,
    name: &str,
    reference: &str,
    body: bytes::Bytes,
) -> Response {
    if *method == Method::GET || *method == Method::HEAD {
        let Some(digest) = state.store.resolve_manifest(name, reference) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        let Ok(data) = state.store.get_blob(&digest) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        let media_type = serde_json::from_slice::<serde_json::Value>(&data)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| DOCKER_MANIFEST_MEDIA_TYPE.to_string());
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, media_type)
            .header(header::CONTENT_LENGTH, data.len())
            .header("Docker-Content-Digest", &digest);
        let payload = if *method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(data)
        };
        return builder.body(payload).expect("manifest response");
    }
    if *method == Method::PUT {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if let Err(e) = state.store.put_blob(&digest, &body) {
            warn!("manifest put failed: {}", e);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if let Err(e) = state.store.link_manifest(name, reference, &digest) {
            warn!("manifest link failed: {}", e);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        return Response::builder()
            .status(StatusCode::CREATED)
            .header("Docker-Content-Digest", digest)
            .body(Body::empty())
            .expect("manifest put response");
    }
    if *method == Method::DELETE {
        return match state.store.delete_manifest(name, reference) {
            Ok(true) => status_response(StatusCode::ACCEPTED),
            Ok(false) => status_response(StatusCode::NOT_FOUND),
            Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        };
    }
    status_response(StatusCode::METHOD_NOT_ALLOWED)
}

fn handle_blob(state: &RegistryState, method: &Method, _name: &str, digest: &str) -> Response {
    if *method == Method::GET || *method == Method::HEAD {
        let Ok(data) = state.store.get_blob(digest) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .header("Docker-Content-Digest", digest);
        let payload = if *method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(data)
        };
        return builder.body(payload).expect("blob response");
    }
    if *method == Method::DELETE {
        return match state.store.delete_blob(digest) {
            Ok(true) => status_response(StatusCode::ACCEPTED),
            Ok(false) => status_response(StatusCode::NOT_FOUND),
            Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        };
    }
    status_response(StatusCode::METHOD_NOT_ALLOWED)
}

fn handle_upload(
    state: &RegistryState,
    method: &Method,
    uri: &Uri,
    name: &str,
    upload_id: Option<String>,
    body: bytes::Bytes,
) -> Response {
    if *method == Method::POST && upload_id.is_none() {
        let id = uuid::Uuid::now_v7().to_string();
        state
            .uploads
            .lock()
            .expect("uploads lock")
            .insert(id.clone(), Vec::new());
        return Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::LOCATION, format!("/v2/{}/blobs/uploads/{}", name, id))
            .header("Docker-Upload-UUID", id)
            .body(Body::empty())
            .expect("upload start response");
    }
    let Some(id) = upload_id else {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    };
    if *method == Method::PATCH {
        let mut uploads = state.uploads.lock().expect("uploads lock");
        let Some(buffer) = uploads.get_mut(&id) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        buffer.extend_from_slice(&body);
        let end = buffer.len().saturating_sub(1);
        return Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::LOCATION, format!("/v2/{}/blobs/uploads/{}", name, id))
            .header(header::RANGE, format!("0-{}", end))
            .body(Body::empty())
            .expect("upload patch response");
    }
    if *method == Method::PUT {
        let Some(digest) = query_param(uri, "digest") else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let mut uploads = state.uploads.lock().expect("uploads lock");
        let Some(mut buffer) = uploads.remove(&id) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        buffer.extend_from_slice(&body);
        return match state.store.put_blob(&digest, &buffer) {
            Ok(()) => Response::builder()
                .status(StatusCode::CREATED)
                .header("Docker-Content-Digest", digest)
                .body(Body::empty())
                .expect("upload complete response"),
            Err(Error::DigestMismatch { .. }) => status_response(StatusCode::BAD_REQUEST),
            Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
        };
    }
    if *method == Method::DELETE {
        state.uploads.lock().expect("uploads lock").remove(&id);
        return status_response(StatusCode::NO_CONTENT);
    }
    status_response(StatusCode::METHOD_NOT_ALLOWED)
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("status response")
}
