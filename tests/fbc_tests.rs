//! Tests for the FBC layer extractor.
//!
//! Builds synthetic catalog image layouts on disk (index, manifest,
//! config with the well-known label, gzip layers) and validates the
//! extraction pipeline end to end.

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use airlift::constants::CONFIGS_LABEL;
use airlift::error::Error;
use airlift::manifest::extract_catalog_configs;

// =============================================================================
// Layout Construction Helpers
// =============================================================================

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn write_blob(layout: &Path, data: &[u8]) -> String {
    let digest = digest_of(data);
    let hex = digest.strip_prefix("sha256:").unwrap();
    let dir = layout.join("blobs").join("sha256");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(hex), data).unwrap();
    digest
}

/// A gzip tar layer holding the given (path, contents) files.
fn build_layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// Assembles a complete catalog layout; `label` controls whether the
/// config carries the configs-directory label.
fn build_catalog_layout(layout: &Path, label: Option<&str>, layers: Vec<Vec<u8>>) {
    let config = match label {
        Some(dir) => format!(
            r#"{{"architecture":"amd64","os":"linux","config":{{"Labels":{{"{}":"{}"}}}}}}"#,
            CONFIGS_LABEL, dir
        ),
        None => r#"{"architecture":"amd64","os":"linux","config":{}}"#.to_string(),
    };
    let config_digest = write_blob(layout, config.as_bytes());

    let layer_entries: Vec<String> = layers
        .iter()
        .map(|layer| {
            let digest = write_blob(layout, layer);
            format!(
                r#"{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"{}","size":{}}}"#,
                digest,
                layer.len()
            )
        })
        .collect();

    let manifest = format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{}","size":{}}},"layers":[{}]}}"#,
        config_digest,
        config.len(),
        layer_entries.join(",")
    );
    let manifest_digest = write_blob(layout, manifest.as_bytes());

    let index = format!(
        r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"{}","size":{}}}]}}"#,
        manifest_digest,
        manifest.len()
    );
    fs::write(layout.join("index.json"), index).unwrap();
}

// =============================================================================
// Extraction
// =============================================================================

#[test]
fn test_extracts_configs_tree() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    let layer = build_layer(&[
        ("configs/foo/catalog.json", r#"{"schema": "olm.package", "name": "foo"}"#),
        ("etc/unrelated.conf", "ignored"),
    ]);
    build_catalog_layout(&layout, Some("/configs"), vec![layer]);

    let work = tmp.path().join("work");
    let configs_dir = extract_catalog_configs(&layout, &work).unwrap();

    assert!(configs_dir.ends_with("configs"));
    let extracted = fs::read_to_string(configs_dir.join("foo").join("catalog.json")).unwrap();
    assert!(extracted.contains("olm.package"));
    assert!(
        !work.join("etc").exists(),
        "paths outside the configs dir are not extracted"
    );
}

#[test]
fn test_multiple_layers_merge_into_one_tree() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    let layer_a = build_layer(&[("configs/a/catalog.json", r#"{"schema": "olm.package"}"#)]);
    let layer_b = build_layer(&[("configs/b/catalog.json", r#"{"schema": "olm.package"}"#)]);
    build_catalog_layout(&layout, Some("/configs"), vec![layer_a, layer_b]);

    let work = tmp.path().join("work");
    let configs_dir = extract_catalog_configs(&layout, &work).unwrap();
    assert!(configs_dir.join("a").join("catalog.json").exists());
    assert!(configs_dir.join("b").join("catalog.json").exists());
}

#[test]
fn test_missing_label_is_terminal() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    let layer = build_layer(&[("configs/foo/catalog.json", "{}")]);
    build_catalog_layout(&layout, None, vec![layer]);

    let err = extract_catalog_configs(&layout, &tmp.path().join("work")).unwrap_err();
    match err {
        Error::Format { reason, .. } => assert!(reason.contains(CONFIGS_LABEL)),
        other => panic!("expected Format error, got {:?}", other),
    }
}

#[test]
fn test_empty_configs_tree_reports_no_packages() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    // the layer has files, but none under the labeled directory
    let layer = build_layer(&[("etc/unrelated.conf", "ignored")]);
    build_catalog_layout(&layout, Some("/configs"), vec![layer]);

    let err = extract_catalog_configs(&layout, &tmp.path().join("work")).unwrap_err();
    match err {
        Error::Format { reason, .. } => assert!(reason.contains("no packages found")),
        other => panic!("expected Format error, got {:?}", other),
    }
}

#[test]
fn test_missing_layer_blob_is_terminal() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    let layer = build_layer(&[("configs/foo/catalog.json", "{}")]);
    build_catalog_layout(&layout, Some("/configs"), vec![layer.clone()]);

    // remove the layer blob after the manifest references it
    let hex = digest_of(&layer);
    let hex = hex.strip_prefix("sha256:").unwrap();
    fs::remove_file(layout.join("blobs").join("sha256").join(hex)).unwrap();

    let err = extract_catalog_configs(&layout, &tmp.path().join("work")).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn test_corrupt_layer_is_a_format_error() {
    let tmp = TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    fs::create_dir_all(&layout).unwrap();

    // not gzip at all
    build_catalog_layout(&layout, Some("/configs"), vec![b"not a gzip stream".to_vec()]);

    let err = extract_catalog_configs(&layout, &tmp.path().join("work")).unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
}
