//! Image reference parsing.
//!
//! Normalizes a reference string into its (transport, registry, namespace,
//! name, tag, digest) components. Parsing is pure: no filesystem or network
//! access, and no defaulting of registries beyond lowercasing.
//!
//! ## Accepted Forms
//!
//! | Input | Transport |
//! |-------|-----------|
//! | `quay.io/ns/img:v1` | none (bare) |
//! | `docker://quay.io/ns/img@sha256:...` | `docker://` |
//! | `oci:///path/to/layout` / `oci:/path` | `oci://` |
//! | `file:///path`, `dir:///path` | disk |
//!
//! Either a tag or a digest must be present after normalization; when both
//! are present the digest is authoritative.

use crate::constants::{
    DIGEST_TRUNC_LEN, DIR_PROTOCOL, DOCKER_PROTOCOL, FILE_PROTOCOL, MAX_IMAGE_REF_LEN,
    OCI_PROTOCOL, OCI_PROTOCOL_TRIMMED,
};
use crate::error::{Error, Result};

/// Transport scheme of an image reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Remote registry (`docker://`).
    Docker,
    /// OCI image layout on disk (`oci://` or `oci:`).
    Oci,
    /// Plain directory (`file://` or `dir://`).
    Dir,
    /// No prefix; treated as a registry reference.
    None,
}

impl Transport {
    /// Returns the canonical prefix string.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Docker => DOCKER_PROTOCOL,
            Self::Oci => OCI_PROTOCOL,
            Self::Dir => DIR_PROTOCOL,
            Self::None => "",
        }
    }

    /// True for disk-backed transports that never touch a registry.
    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Oci | Self::Dir)
    }
}

/// A parsed image reference.
///
/// Invariants enforced by [`ImageRef::parse`]:
/// - either `tag` or `digest` is present; when both are, the digest is
///   authoritative for content addressing
/// - `registry` and path components are lowercase
/// - `digest` is `sha256:<64 hex chars>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Transport the reference was written with.
    pub transport: Transport,
    /// Registry host, possibly with port (`quay.io`, `localhost:55000`).
    pub registry: String,
    /// Path components between registry and name, joined with `/`.
    pub namespace: String,
    /// Final path component.
    pub name: String,
    /// Tag, when present.
    pub tag: Option<String>,
    /// Digest, when present (`sha256:<hex>`).
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
            });
        }
        if reference.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        let (transport, rest) = Self::split_transport(reference);

        // Disk transports carry a path, not a registry reference. Keep the
        // path verbatim in `name` so callers can round-trip it.
        if transport.is_disk() {
            return Ok(Self {
                transport,
                registry: String::new(),
                namespace: String::new(),
                name: rest.to_string(),
                tag: None,
                digest: None,
            });
        }

        if !rest.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || c == '/'
                || c == ':'
                || c == '.'
                || c == '-'
                || c == '_'
                || c == '@'
        }) {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        // Split off the digest first: it is authoritative and its hex chars
        // would confuse tag detection.
        let (path_and_tag, digest) = match rest.split_once('@') {
            Some((p, d)) => (p, Some(Self::validate_digest(reference, d)?)),
            None => (rest, None),
        };

        // A colon after the last slash is a tag separator; earlier colons
        // belong to a registry port.
        let last_slash = path_and_tag.rfind('/');
        let tag_colon = match last_slash {
            Some(idx) => path_and_tag[idx..].find(':').map(|c| idx + c),
            None => path_and_tag.find(':'),
        };
        let (path, tag) = match tag_colon {
            Some(idx) => (
                &path_and_tag[..idx],
                Some(path_and_tag[idx + 1..].to_string()),
            ),
            None => (path_and_tag, None),
        };

        if tag.is_none() && digest.is_none() {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "neither tag nor digest present".to_string(),
            });
        }
        if let Some(t) = &tag {
            if t.is_empty() {
                return Err(Error::InvalidImageReference {
                    reference: reference.to_string(),
                    reason: "empty tag".to_string(),
                });
            }
        }

        let mut components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if components.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "no path components".to_string(),
            });
        }

        // First component is a registry when it looks like a host
        // (contains a dot or a port) or is localhost.
        let registry = if components.len() > 1
            && (components[0].contains('.')
                || components[0].contains(':')
                || components[0] == "localhost")
        {
            components.remove(0).to_lowercase()
        } else {
            String::new()
        };

        let name = components
            .pop()
            .ok_or_else(|| Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "missing image name".to_string(),
            })?
            .to_lowercase();
        let namespace = components.join("/").to_lowercase();

        Ok(Self {
            transport,
            registry,
            namespace,
            name,
            tag,
            digest,
        })
    }

    fn split_transport(reference: &str) -> (Transport, &str) {
        if let Some(rest) = reference.strip_prefix(DOCKER_PROTOCOL) {
            (Transport::Docker, rest)
        } else if let Some(rest) = reference.strip_prefix(OCI_PROTOCOL) {
            (Transport::Oci, rest)
        } else if let Some(rest) = reference.strip_prefix(OCI_PROTOCOL_TRIMMED) {
            (Transport::Oci, rest)
        } else if let Some(rest) = reference.strip_prefix(FILE_PROTOCOL) {
            (Transport::Dir, rest)
        } else if let Some(rest) = reference.strip_prefix(DIR_PROTOCOL) {
            (Transport::Dir, rest)
        } else {
            (Transport::None, reference)
        }
    }

    fn validate_digest(reference: &str, digest: &str) -> Result<String> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: format!("unsupported digest algorithm in '{}'", digest),
            })?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: format!("malformed digest '{}'", digest),
            });
        }
        Ok(format!("sha256:{}", hex.to_lowercase()))
    }

    /// True when the reference pins content by digest.
    pub fn is_by_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Namespace and name joined, without registry (`ns/img`).
    pub fn path_component(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// The digest hex truncated for use as a synthetic cache tag.
    ///
    /// Catalog images pinned by digest are stored in the cache under a tag
    /// derived from the first [`DIGEST_TRUNC_LEN`] hex characters.
    pub fn digest_truncated(&self) -> Option<String> {
        self.digest
            .as_ref()
            .and_then(|d| d.strip_prefix("sha256:"))
            .map(|hex| hex[..DIGEST_TRUNC_LEN.min(hex.len())].to_string())
    }

    /// Full reference including the transport prefix.
    pub fn reference_with_transport(&self) -> String {
        format!("{}{}", self.transport.prefix(), self.reference())
    }

    /// Reference without transport prefix.
    pub fn reference(&self) -> String {
        if self.transport.is_disk() {
            return self.name.clone();
        }
        let mut out = String::new();
        if !self.registry.is_empty() {
            out.push_str(&self.registry);
            out.push('/');
        }
        out.push_str(&self.path_component());
        // Digest is authoritative when both are present.
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        } else if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        out
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reference_with_transport())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged() {
        let r = ImageRef::parse("quay.io/redhatgov/pipeline:v1.2").unwrap();
        assert_eq!(r.transport, Transport::None);
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.namespace, "redhatgov");
        assert_eq!(r.name, "pipeline");
        assert_eq!(r.tag.as_deref(), Some("v1.2"));
        assert!(r.digest.is_none());
    }

    #[test]
    fn test_parse_by_digest() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let r = ImageRef::parse(&format!("docker://registry.example/ns/img@{}", digest)).unwrap();
        assert_eq!(r.transport, Transport::Docker);
        assert!(r.is_by_digest());
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(r.digest_truncated().unwrap(), "abababababab");
    }

    #[test]
    fn test_digest_authoritative_over_tag() {
        let digest = format!("sha256:{}", "cd".repeat(32));
        let r = ImageRef::parse(&format!("quay.io/ns/img:v1@{}", digest)).unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert!(r.reference().ends_with(&digest));
        assert!(!r.reference().contains(":v1"));
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let r = ImageRef::parse("localhost:55000/ns/img:latest").unwrap();
        assert_eq!(r.registry, "localhost:55000");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_lowercasing() {
        let r = ImageRef::parse("Quay.IO/NS/Img:V1").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.namespace, "ns");
        assert_eq!(r.name, "img");
        // tags keep their case
        assert_eq!(r.tag.as_deref(), Some("V1"));
    }

    #[test]
    fn test_missing_tag_and_digest_rejected() {
        assert!(ImageRef::parse("quay.io/ns/img").is_err());
    }

    #[test]
    fn test_bad_digest_rejected() {
        assert!(ImageRef::parse("quay.io/ns/img@sha256:zz").is_err());
        assert!(ImageRef::parse("quay.io/ns/img@md5:abcd").is_err());
    }

    #[test]
    fn test_disk_transports() {
        let r = ImageRef::parse("oci:///srv/layouts/catalog").unwrap();
        assert_eq!(r.transport, Transport::Oci);
        assert_eq!(r.name, "/srv/layouts/catalog");
        let r = ImageRef::parse("file:///srv/mirror").unwrap();
        assert_eq!(r.transport, Transport::Dir);
    }

    #[test]
    fn test_roundtrip_with_transport() {
        let input = "docker://quay.io/ns/img:v1";
        let r = ImageRef::parse(input).unwrap();
        assert_eq!(r.reference_with_transport(), input);
    }
}
