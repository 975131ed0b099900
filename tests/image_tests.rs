//! Tests for image reference parsing.
//!
//! Validates transport detection, tag/digest handling, lowercasing
//! invariants, and round-tripping.

use airlift::image::{ImageRef, Transport};

fn digest(byte: &str) -> String {
    format!("sha256:{}", byte.repeat(32))
}

// =============================================================================
// Transport Detection
// =============================================================================

#[test]
fn test_bare_reference_has_no_transport() {
    let r = ImageRef::parse("quay.io/ns/img:v1").unwrap();
    assert_eq!(r.transport, Transport::None);
    assert_eq!(r.reference_with_transport(), "quay.io/ns/img:v1");
}

#[test]
fn test_docker_transport() {
    let r = ImageRef::parse("docker://quay.io/ns/img:v1").unwrap();
    assert_eq!(r.transport, Transport::Docker);
    assert_eq!(r.reference(), "quay.io/ns/img:v1");
}

#[test]
fn test_oci_transport_keeps_path() {
    let r = ImageRef::parse("oci:///srv/layouts/catalog").unwrap();
    assert_eq!(r.transport, Transport::Oci);
    assert!(r.transport.is_disk());
    assert_eq!(r.name, "/srv/layouts/catalog");

    let trimmed = ImageRef::parse("oci:/srv/layouts/catalog").unwrap();
    assert_eq!(trimmed.transport, Transport::Oci);
}

#[test]
fn test_file_and_dir_transports() {
    assert_eq!(
        ImageRef::parse("file:///srv/mirror").unwrap().transport,
        Transport::Dir
    );
    assert_eq!(
        ImageRef::parse("dir:///srv/mirror").unwrap().transport,
        Transport::Dir
    );
}

// =============================================================================
// Components
// =============================================================================

#[test]
fn test_component_split() {
    let r = ImageRef::parse("registry.example/deep/nested/img:v2").unwrap();
    assert_eq!(r.registry, "registry.example");
    assert_eq!(r.namespace, "deep/nested");
    assert_eq!(r.name, "img");
    assert_eq!(r.path_component(), "deep/nested/img");
}

#[test]
fn test_no_registry_reference() {
    let r = ImageRef::parse("ubi9/ubi:latest").unwrap();
    assert_eq!(r.registry, "");
    assert_eq!(r.path_component(), "ubi9/ubi");
}

#[test]
fn test_localhost_with_port_is_a_registry() {
    let r = ImageRef::parse("localhost:55000/ns/img:v1").unwrap();
    assert_eq!(r.registry, "localhost:55000");
    assert_eq!(r.tag.as_deref(), Some("v1"));
}

// =============================================================================
// Tag and Digest Invariants
// =============================================================================

#[test]
fn test_tag_or_digest_required() {
    assert!(ImageRef::parse("quay.io/ns/img").is_err());
    assert!(ImageRef::parse("quay.io/ns/img:").is_err());
}

#[test]
fn test_digest_is_authoritative() {
    let d = digest("ab");
    let r = ImageRef::parse(&format!("quay.io/ns/img:v1@{}", d)).unwrap();
    assert!(r.is_by_digest());
    assert_eq!(r.reference(), format!("quay.io/ns/img@{}", d));
}

#[test]
fn test_digest_validation() {
    assert!(ImageRef::parse("quay.io/ns/img@sha256:dead").is_err());
    assert!(ImageRef::parse(&format!("quay.io/ns/img@sha512:{}", "ab".repeat(32))).is_err());
    assert!(ImageRef::parse(&format!("quay.io/ns/img@{}", digest("ab"))).is_ok());
}

#[test]
fn test_digest_truncation_for_cache_tags() {
    let r = ImageRef::parse(&format!("quay.io/ns/img@{}", digest("ab"))).unwrap();
    assert_eq!(r.digest_truncated().unwrap(), "abababababab");
    let tagged = ImageRef::parse("quay.io/ns/img:v1").unwrap();
    assert!(tagged.digest_truncated().is_none());
}

#[test]
fn test_registry_and_path_lowercased() {
    let r = ImageRef::parse("QUAY.io/Some/Repo:Tag").unwrap();
    assert_eq!(r.registry, "quay.io");
    assert_eq!(r.namespace, "some");
    assert_eq!(r.name, "repo");
    assert_eq!(r.tag.as_deref(), Some("Tag"), "tags keep their case");
}

#[test]
fn test_overly_long_reference_rejected() {
    let long = format!("quay.io/{}:v1", "a".repeat(600));
    assert!(ImageRef::parse(&long).is_err());
}

#[test]
fn test_invalid_characters_rejected() {
    assert!(ImageRef::parse("quay.io/ns/im g:v1").is_err());
    assert!(ImageRef::parse("quay.io/ns/img:v1;rm").is_err());
}
