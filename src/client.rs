//! Registry HTTP client.
//!
//! Speaks the distribution API (manifests, blobs, uploads, deletes) on top
//! of the mirror-aware transport. Handles the WWW-Authenticate bearer-token
//! dance transparently and caches tokens per registry+repository.
//!
//! Loopback registries (the embedded cache) are addressed over plain HTTP;
//! everything else defaults to HTTPS.

use std::collections::HashMap;

use reqwest::{header, Client, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::{DOCKER_MANIFEST_MEDIA_TYPE, HTTP_REQUEST_TIMEOUT, MAX_LAYER_SIZE};
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::transport::{Mirror, MirroredClient};

/// Accept header for manifest requests, covering every supported type.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// A fetched manifest: raw bytes plus the negotiated media type and the
/// registry-reported digest.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Distribution-API client with mirror routing and token caching.
pub struct RegistryClient {
    http: MirroredClient,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Builds a client with the given mirror table.
    pub fn new(mirrors: Vec<Mirror>) -> Result<Self> {
        let inner = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::RegistryRequest {
                reference: String::new(),
                reason: format!("building http client: {}", e),
            })?;
        Ok(Self {
            http: MirroredClient::new(inner, mirrors),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Scheme selection: loopback hosts are plain HTTP.
    fn base_url(registry: &str) -> String {
        if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
            format!("http://{}", registry)
        } else {
            format!("https://{}", registry)
        }
    }

    fn token_key(registry: &str, repository: &str) -> String {
        format!("{}/{}", registry, repository)
    }

    /// Issues a request, re-authenticating once on 401.
    async fn request(
        &self,
        method: Method,
        url: &str,
        registry: &str,
        repository: &str,
        accept: Option<&str>,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let key = Self::token_key(registry, repository);
        for attempt in 0..2 {
            let mut builder = self.http.inner().request(method.clone(), url);
            if let Some(accept) = accept {
                builder = builder.header(header::ACCEPT, accept);
            }
            if let Some(ct) = content_type {
                builder = builder.header(header::CONTENT_TYPE, ct);
            }
            if let Some(token) = self.tokens.lock().await.get(&key) {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            let request = builder.build().map_err(|e| Error::RegistryRequest {
                reference: url.to_string(),
                reason: e.to_string(),
            })?;
            let response =
                self.http
                    .execute(request)
                    .await
                    .map_err(|e| Error::RegistryRequest {
                        reference: url.to_string(),
                        reason: e.to_string(),
                    })?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string);
                if let Some(challenge) = challenge {
                    if let Some(token) = self.fetch_token(&challenge).await? {
                        self.tokens.lock().await.insert(key.clone(), token);
                        continue;
                    }
                }
            }
            return Ok(response);
        }
        unreachable!("request loop always returns within two attempts")
    }

    /// Performs the bearer-token exchange described by a WWW-Authenticate
    /// challenge. Returns None for non-bearer challenges.
    async fn fetch_token(&self, challenge: &str) -> Result<Option<String>> {
        let Some(params) = challenge.strip_prefix("Bearer ") else {
            return Ok(None);
        };
        let mut realm = None;
        let mut query = Vec::new();
        for part in params.split(',') {
            let Some((k, v)) = part.trim().split_once('=') else {
                continue;
            };
            let v = v.trim_matches('"');
            match k {
                "realm" => realm = Some(v.to_string()),
                _ => query.push((k.to_string(), v.to_string())),
            }
        }
        let Some(realm) = realm else {
            return Ok(None);
        };

        debug!("fetching bearer token from {}", realm);
        let response = self
            .http
            .inner()
            .get(&realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: realm.clone(),
                reason: format!("token request failed: {}", e),
            })?;
        let token: TokenResponse = response.json().await.map_err(|e| Error::RegistryRequest {
            reference: realm,
            reason: format!("token response unparseable: {}", e),
        })?;
        Ok(token.token.or(token.access_token))
    }

    // =========================================================================
    // Manifests
    // =========================================================================

    /// Fetches the manifest a reference points at.
    pub async fn get_manifest(&self, image: &ImageRef) -> Result<FetchedManifest> {
        let reference = image
            .digest
            .clone()
            .or_else(|| image.tag.clone())
            .ok_or_else(|| Error::InvalidImageReference {
                reference: image.to_string(),
                reason: "neither tag nor digest".to_string(),
            })?;
        self.get_manifest_ref(image, &reference).await
    }

    /// Fetches a manifest by explicit tag or digest.
    pub async fn get_manifest_ref(
        &self,
        image: &ImageRef,
        reference: &str,
    ) -> Result<FetchedManifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(&image.registry),
            image.path_component(),
            reference
        );
        let response = self
            .request(
                Method::GET,
                &url,
                &image.registry,
                &image.path_component(),
                Some(MANIFEST_ACCEPT),
                None,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("manifest fetch returned {}", response.status()),
            });
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or(DOCKER_MANIFEST_MEDIA_TYPE)
            .to_string();
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: image.to_string(),
                reason: e.to_string(),
            })?
            .to_vec();
        let digest = digest.unwrap_or_else(|| {
            use sha2::{Digest, Sha256};
            format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
        });
        Ok(FetchedManifest {
            bytes,
            media_type,
            digest,
        })
    }

    /// Uploads a manifest under a tag or digest reference.
    pub async fn put_manifest(
        &self,
        image: &ImageRef,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(&image.registry),
            image.path_component(),
            reference
        );
        let response = self
            .request(
                Method::PUT,
                &url,
                &image.registry,
                &image.path_component(),
                None,
                Some(bytes),
                Some(media_type),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("manifest put returned {}", response.status()),
            });
        }
        Ok(())
    }

    /// Deletes a manifest. Tag references are resolved to a digest first,
    /// as the distribution API only deletes by digest.
    pub async fn delete_manifest(&self, image: &ImageRef) -> Result<()> {
        let digest = match &image.digest {
            Some(d) => d.clone(),
            None => self.get_manifest(image).await?.digest,
        };
        let url = format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(&image.registry),
            image.path_component(),
            digest
        );
        let response = self
            .request(
                Method::DELETE,
                &url,
                &image.registry,
                &image.path_component(),
                None,
                None,
                None,
            )
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("manifest delete returned {}", response.status()),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Checks blob existence without downloading it.
    pub async fn has_blob(&self, image: &ImageRef, digest: &str) -> Result<bool> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            Self::base_url(&image.registry),
            image.path_component(),
            digest
        );
        let response = self
            .request(
                Method::HEAD,
                &url,
                &image.registry,
                &image.path_component(),
                None,
                None,
                None,
            )
            .await?;
        Ok(response.status().is_success())
    }

    /// Downloads a blob, bounded by [`MAX_LAYER_SIZE`].
    pub async fn get_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            Self::base_url(&image.registry),
            image.path_component(),
            digest
        );
        let response = self
            .request(
                Method::GET,
                &url,
                &image.registry,
                &image.path_component(),
                None,
                None,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("blob {} fetch returned {}", digest, response.status()),
            });
        }
        if let Some(length) = response.content_length() {
            if length > MAX_LAYER_SIZE {
                return Err(Error::RegistryRequest {
                    reference: image.to_string(),
                    reason: format!("blob {} exceeds {} bytes", digest, MAX_LAYER_SIZE),
                });
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: image.to_string(),
                reason: e.to_string(),
            })?
            .to_vec();
        Ok(bytes)
    }

    /// Uploads a blob via the monolithic upload flow: start an upload
    /// session, then complete it with the digest query parameter.
    pub async fn put_blob(&self, image: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()> {
        if self.has_blob(image, digest).await.unwrap_or(false) {
            debug!("blob {} already present on {}", digest, image.registry);
            return Ok(());
        }
        let start_url = format!(
            "{}/v2/{}/blobs/uploads/",
            Self::base_url(&image.registry),
            image.path_component()
        );
        let response = self
            .request(
                Method::POST,
                &start_url,
                &image.registry,
                &image.path_component(),
                None,
                None,
                None,
            )
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("upload start returned {}", response.status()),
            });
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| Error::RegistryRequest {
                reference: image.to_string(),
                reason: "upload start returned no Location".to_string(),
            })?;
        // The Location may be relative and may already carry session
        // query parameters.
        let separator = if location.contains('?') { '&' } else { '?' };
        let complete_url = if location.starts_with("http") {
            format!("{}{}digest={}", location, separator, digest)
        } else {
            format!(
                "{}{}{}digest={}",
                Self::base_url(&image.registry),
                location,
                separator,
                digest
            )
        };
        let response = self
            .request(
                Method::PUT,
                &complete_url,
                &image.registry,
                &image.path_component(),
                None,
                Some(data),
                Some("application/octet-stream"),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::RegistryRequest {
                reference: image.to_string(),
                reason: format!("upload complete returned {}", response.status()),
            });
        }
        Ok(())
    }
}
