//! Mirror-aware HTTP transport.
//!
//! Wraps a [`reqwest::Client`] with a table of mirror entries. Requests
//! whose URL matches a mirror origin are rewritten to the first reachable
//! mirror endpoint; when no endpoint answers, the original request is
//! dispatched unchanged. The wrapper is stateless beyond its read-only
//! mirror table and is safe for concurrent use.
//!
//! The mirror table itself is synthesized from a containers registries
//! configuration (TOML), honoring the `CONTAINERS_REGISTRIES_CONF`
//! override.

use std::env;
use std::fs;
use std::path::PathBuf;

use reqwest::{Client, Request, Response, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::REGISTRIES_CONF_ENV_VAR;
use crate::error::{Error, Result};

/// An alternative location serving the same content as an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEndpoint {
    /// Host (and optional path prefix) of the mirror, without scheme.
    pub location: String,
    /// Selects https (true) or http (false) when rewriting.
    pub secure: bool,
}

/// Mirror table entry: an origin prefix and its ordered endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    /// Origin prefix, e.g. `quay.io/redhatgov`.
    pub origin: String,
    /// Endpoints tried in order; first success wins.
    pub endpoints: Vec<MirrorEndpoint>,
}

impl Mirror {
    /// True when a request URL falls under this mirror's origin.
    ///
    /// The match is a substring test on host OR path, which tolerates
    /// namespace-prefix registries but can match too permissively when
    /// origin paths are short.
    /// TODO: tighten to a prefix match on host-then-path once downstream
    /// configs have been audited for short origin paths.
    fn is_applicable_to(&self, url: &Url) -> bool {
        let Ok(origin) = Self::parse_prefixed(&self.origin, true) else {
            return false;
        };
        let host_matches = match (url.host_str(), origin.host_str()) {
            (Some(h), Some(o)) => h.contains(o),
            _ => false,
        };
        let origin_path = origin.path();
        let path_matches = origin_path != "/" && url.path().contains(origin_path);
        host_matches || path_matches
    }

    /// Parses a location that may lack a scheme.
    fn parse_prefixed(location: &str, secure: bool) -> std::result::Result<Url, url::ParseError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Url::parse(location)
        } else if secure {
            Url::parse(&format!("https://{}", location))
        } else {
            Url::parse(&format!("http://{}", location))
        }
    }

    /// Rewrites a URL onto one endpoint. Returns None when either side
    /// fails to parse; the caller skips to the next endpoint.
    fn rewrite(&self, url: &Url, endpoint: &MirrorEndpoint) -> Option<Url> {
        let origin = Self::parse_prefixed(&self.origin, true).ok()?;
        let target = Self::parse_prefixed(&endpoint.location, endpoint.secure).ok()?;

        let mut rewritten = url.to_string();
        if let (Some(from), Some(to)) = (origin.host_str(), target.host_str()) {
            let from_authority = match origin.port() {
                Some(p) => format!("{}:{}", from, p),
                None => from.to_string(),
            };
            let to_authority = match target.port() {
                Some(p) => format!("{}:{}", to, p),
                None => to.to_string(),
            };
            rewritten = rewritten.replacen(&from_authority, &to_authority, 1);
        }
        if origin.path() != "/" && target.path() != "/" {
            rewritten = rewritten.replacen(origin.path(), target.path(), 1);
        }
        if url.scheme() == "https" && !endpoint.secure {
            rewritten = rewritten.replacen("https:", "http:", 1);
        } else if url.scheme() == "http" && endpoint.secure {
            rewritten = rewritten.replacen("http:", "https:", 1);
        }
        Url::parse(&rewritten).ok()
    }
}

/// A [`reqwest::Client`] wrapper that consults the mirror table before
/// dispatching.
#[derive(Debug, Clone)]
pub struct MirroredClient {
    inner: Client,
    mirrors: Vec<Mirror>,
}

impl MirroredClient {
    /// Wraps `inner` with a mirror table. An empty table dispatches every
    /// request unchanged.
    pub fn new(inner: Client, mirrors: Vec<Mirror>) -> Self {
        Self { inner, mirrors }
    }

    /// Direct access to the wrapped client for requests that must not be
    /// redirected (e.g. loopback cache traffic).
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Dispatches a request, trying applicable mirror endpoints in order.
    ///
    /// Endpoint failures (transport error or unrewritable URL) are not
    /// fatal; they skip to the next endpoint. When every endpoint fails,
    /// the unrewritten request is dispatched.
    pub async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        for mirror in &self.mirrors {
            if !mirror.is_applicable_to(request.url()) {
                continue;
            }
            debug!("request {} matches mirror {}", request.url(), mirror.origin);
            for endpoint in &mirror.endpoints {
                let Some(url) = mirror.rewrite(request.url(), endpoint) else {
                    debug!("endpoint {} not rewritable; skipping", endpoint.location);
                    continue;
                };
                let Some(mut mirrored) = request.try_clone() else {
                    // Streaming bodies cannot be replayed against a mirror.
                    break;
                };
                *mirrored.url_mut() = url.clone();
                match self.inner.execute(mirrored).await {
                    Ok(response) => {
                        debug!("using {} as mirror of {}", url, request.url());
                        return Ok(response);
                    }
                    Err(e) => {
                        debug!("mirror endpoint {} failed: {}", url, e);
                        continue;
                    }
                }
            }
        }
        self.inner.execute(request).await
    }
}

// =============================================================================
// Registries Configuration
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegistriesConf {
    #[serde(default, rename = "registry")]
    registries: Vec<RegistryConf>,
}

#[derive(Debug, Deserialize)]
struct RegistryConf {
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default, rename = "mirror")]
    mirrors: Vec<EndpointConf>,
}

#[derive(Debug, Deserialize)]
struct EndpointConf {
    location: String,
    #[serde(default)]
    insecure: bool,
}

/// Default containers registries configuration path.
fn default_registries_conf() -> PathBuf {
    PathBuf::from("/etc/containers/registries.conf")
}

/// Loads every mirror entry from the containers registries configuration.
///
/// Returns an empty table when the configuration is absent; that is not
/// an error in a connected environment.
pub fn load_mirrors() -> Result<Vec<Mirror>> {
    let conf_path = env::var(REGISTRIES_CONF_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_registries_conf());
    if !conf_path.exists() {
        return Ok(Vec::new());
    }

    let data = fs::read_to_string(&conf_path)
        .map_err(|e| Error::io(format!("reading {}", conf_path.display()), e))?;
    let conf: RegistriesConf = toml::from_str(&data).map_err(|e| Error::Format {
        context: conf_path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut mirrors = Vec::new();
    for registry in conf.registries {
        let prefix = registry.prefix.or(registry.location).unwrap_or_default();
        if prefix.is_empty() || registry.mirrors.is_empty() {
            continue;
        }
        mirrors.push(Mirror {
            origin: prefix,
            endpoints: registry
                .mirrors
                .into_iter()
                .map(|m| MirrorEndpoint {
                    location: m.location,
                    secure: !m.insecure,
                })
                .collect(),
        });
    }
    Ok(mirrors)
}

/// Builds the mirror table applying to a single image reference.
pub fn find_mirrors(image_ref: &str) -> Result<Vec<Mirror>> {
    let mut mirrors = load_mirrors()?;
    mirrors.retain(|m| image_ref.starts_with(&m.origin));
    if mirrors.is_empty() {
        warn!("no mirror configuration matches {}", image_ref);
    }
    Ok(mirrors)
}
