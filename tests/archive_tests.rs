//! Tests for archive packaging and extraction.
//!
//! Round-trips a realistic cache + working-directory snapshot through the
//! chunked tar format and validates chunk numbering, path routing, and
//! file modes on the far side.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use airlift::archive::{ArchiveBuilder, ArchiveExtractor};
use airlift::constants::REGISTRY_BLOB_PREFIX;

fn write_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

fn snapshot() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let cache = tmp.path().join("cache");
    let work = tmp.path().join("working-dir");

    write_file(
        &cache,
        &format!("{}/blobs/sha256/ab/{}/data", REGISTRY_BLOB_PREFIX, "ab".repeat(32)),
        &[1u8; 2048],
    );
    write_file(
        &cache,
        &format!("{}/repositories/ns/img/_manifests/tags/v1/current/link", REGISTRY_BLOB_PREFIX),
        b"sha256:abcd",
    );
    write_file(
        &work,
        "hold-release/payload/release-manifests/image-references",
        br#"{"kind":"ImageStream","spec":{"tags":[]}}"#,
    );
    write_file(&work, "release-filters/0011223344", b"{}");

    (tmp, cache, work)
}

// =============================================================================
// Round Trip
// =============================================================================

#[test]
fn test_full_round_trip() {
    let (tmp, cache, work) = snapshot();
    let archive_dir = tmp.path().join("out");

    let chunks = ArchiveBuilder::new(
        archive_dir.clone(),
        cache.clone(),
        work.clone(),
        64 * 1024 * 1024,
        true,
    )
    .build("kind: ImageSetConfiguration\napiVersion: mirror.openshift.io/v2alpha1\n")
    .unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].ends_with("mirror_000001.tar"));

    let out = TempDir::new().unwrap();
    let out_cache = out.path().join("cache");
    let out_work = out.path().join("working-dir");
    ArchiveExtractor::new(archive_dir, out_cache.clone(), out_work.clone())
        .extract()
        .unwrap();

    // registry-tree entries land under the cache root
    let blob = out_cache.join(format!(
        "{}/blobs/sha256/ab/{}/data",
        REGISTRY_BLOB_PREFIX,
        "ab".repeat(32)
    ));
    assert_eq!(fs::read(&blob).unwrap(), vec![1u8; 2048]);
    let link = out_cache.join(format!(
        "{}/repositories/ns/img/_manifests/tags/v1/current/link",
        REGISTRY_BLOB_PREFIX
    ));
    assert_eq!(fs::read(&link).unwrap(), b"sha256:abcd");

    // working-dir entries land under the working root
    assert!(out_work
        .join("hold-release/payload/release-manifests/image-references")
        .exists());
    assert!(out_work.join("release-filters/0011223344").exists());
}

#[test]
fn test_extracted_files_are_owner_writable() {
    let (tmp, cache, work) = snapshot();
    let archive_dir = tmp.path().join("out");
    ArchiveBuilder::new(archive_dir.clone(), cache, work, 64 * 1024 * 1024, true)
        .build("config")
        .unwrap();

    let out = TempDir::new().unwrap();
    let out_cache = out.path().join("cache");
    let out_work = out.path().join("working-dir");
    ArchiveExtractor::new(archive_dir, out_cache.clone(), out_work)
        .extract()
        .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let blob = out_cache.join(format!(
            "{}/blobs/sha256/ab/{}/data",
            REGISTRY_BLOB_PREFIX,
            "ab".repeat(32)
        ));
        let mode = fs::metadata(&blob).unwrap().permissions().mode();
        assert_eq!(mode & 0o700, 0o700, "owner-rwx bits are always set");
    }
}

// =============================================================================
// Chunking
// =============================================================================

#[test]
fn test_multi_chunk_round_trip() {
    let tmp = TempDir::new().unwrap();
    let cache = tmp.path().join("cache");
    let work = tmp.path().join("working-dir");
    // four 300 KiB blobs under a 512 KiB bound: several chunks
    for i in 0..4u8 {
        let hex = format!("{:02x}", i).repeat(32);
        write_file(
            &cache,
            &format!("{}/blobs/sha256/{}/{}/data", REGISTRY_BLOB_PREFIX, &hex[..2], hex),
            &vec![i; 300 * 1024],
        );
    }
    fs::create_dir_all(&work).unwrap();

    let archive_dir = tmp.path().join("out");
    let chunks = ArchiveBuilder::new(
        archive_dir.clone(),
        cache.clone(),
        work.clone(),
        512 * 1024,
        true,
    )
    .build("config")
    .unwrap();
    assert!(chunks.len() >= 2, "chunks rotate under the size bound");
    for (i, chunk) in chunks.iter().enumerate() {
        assert!(chunk
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(&format!("{:06}.tar", i + 1)));
    }

    let out = TempDir::new().unwrap();
    ArchiveExtractor::new(
        archive_dir,
        out.path().join("cache"),
        out.path().join("working-dir"),
    )
    .extract()
    .unwrap();

    for i in 0..4u8 {
        let hex = format!("{:02x}", i).repeat(32);
        let path = out.path().join("cache").join(format!(
            "{}/blobs/sha256/{}/{}/data",
            REGISTRY_BLOB_PREFIX,
            &hex[..2],
            hex
        ));
        assert_eq!(fs::read(&path).unwrap(), vec![i; 300 * 1024]);
    }
}
