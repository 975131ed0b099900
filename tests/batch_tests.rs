//! Tests for the batch copier.
//!
//! Validates fail-safe vs fail-fast classification: non-release failures
//! are accumulated into a single summarizing error while the batch keeps
//! going; a release failure aborts immediately.

use std::fs;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use airlift::api::{CollectorSchema, CopyFunction, CopyImage, ImageType, Mode};
use airlift::batch::Batch;
use airlift::cache::{start_registry, CacheStore, RunningRegistry};
use airlift::client::RegistryClient;
use airlift::constants::OCI_MANIFEST_MEDIA_TYPE;
use airlift::copier::{Copier, CopyOptions};
use airlift::error::Error;
use airlift::image::ImageRef;

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn start_test_registry() -> (TempDir, CacheStore, RunningRegistry) {
    let tmp = TempDir::new().unwrap();
    let store = CacheStore::open(tmp.path().to_path_buf()).unwrap();
    let registry = start_registry(store.clone(), 0, None).await.unwrap();
    (tmp, store, registry)
}

async fn push_test_image(client: &RegistryClient, fqdn: &str, repo: &str, tag: &str, seed: u8) {
    let layer = vec![seed; 64];
    let layer_digest = digest_of(&layer);
    let config = format!(r#"{{"architecture":"amd64","os":"linux","variant":"{}"}}"#, seed);
    let config_digest = digest_of(config.as_bytes());
    let manifest = format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"{}","size":{}}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"{}","size":{}}}]}}"#,
        OCI_MANIFEST_MEDIA_TYPE,
        config_digest,
        config.len(),
        layer_digest,
        layer.len()
    );
    let image = ImageRef::parse(&format!("docker://{}/{}:{}", fqdn, repo, tag)).unwrap();
    client.put_blob(&image, &layer_digest, layer).await.unwrap();
    client
        .put_blob(&image, &config_digest, config.into_bytes())
        .await
        .unwrap();
    client
        .put_manifest(&image, tag, OCI_MANIFEST_MEDIA_TYPE, manifest.into_bytes())
        .await
        .unwrap();
}

fn copy_entry(src_fqdn: &str, dst_fqdn: &str, repo: &str, image_type: ImageType) -> CopyImage {
    CopyImage {
        origin: format!("{}:v1", repo),
        source: format!("docker://{}/{}:v1", src_fqdn, repo),
        destination: format!("docker://{}/{}:v1", dst_fqdn, repo),
        image_type,
    }
}

// =============================================================================
// Fail-Safe
// =============================================================================

#[tokio::test]
async fn test_non_release_failures_accumulate() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, dst_store, dst) = start_test_registry().await;
    let logs = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    push_test_image(&client, &src.fqdn, "ok/one", "v1", 1).await;
    push_test_image(&client, &src.fqdn, "ok/two", "v1", 2).await;

    let mut schema = CollectorSchema::default();
    schema.extend(vec![
        copy_entry(&src.fqdn, &dst.fqdn, "ok/one", ImageType::OperatorRelatedImage),
        copy_entry(&src.fqdn, &dst.fqdn, "missing/a", ImageType::Generic),
        copy_entry(&src.fqdn, &dst.fqdn, "ok/two", ImageType::Generic),
        copy_entry(&src.fqdn, &dst.fqdn, "missing/b", ImageType::OperatorBundle),
    ]);

    let batch = Batch::new(
        Arc::new(Copier::new(Arc::clone(&client))),
        logs.path().to_path_buf(),
    );
    let err = batch
        .worker(&schema, CopyFunction::Copy, Mode::MirrorToDisk, &CopyOptions::default())
        .await
        .unwrap_err();

    // a single summarizing fail-safe error naming the error log
    let Error::SafeBatch(message) = err else {
        panic!("expected SafeBatch");
    };
    assert!(message.contains("mirroring_errors_"));

    // the two good images made it despite the failures
    let ok_one = ImageRef::parse(&format!("docker://{}/ok/one:v1", dst.fqdn)).unwrap();
    let ok_two = ImageRef::parse(&format!("docker://{}/ok/two:v1", dst.fqdn)).unwrap();
    assert!(client.get_manifest(&ok_one).await.is_ok());
    assert!(client.get_manifest(&ok_two).await.is_ok());
    assert!(!dst_store.list_repositories().iter().any(|r| r.starts_with("missing")));

    // the error log holds exactly the two failures
    let log_file = fs::read_dir(logs.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("mirroring_errors_"))
        .expect("error log written");
    let contents = fs::read_to_string(log_file.path()).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.contains("missing/a"));
    assert!(contents.contains("missing/b"));

    src.stop().await;
    dst.stop().await;
}

// =============================================================================
// Fail-Fast
// =============================================================================

#[tokio::test]
async fn test_release_failure_short_circuits() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, dst_store, dst) = start_test_registry().await;
    let logs = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    push_test_image(&client, &src.fqdn, "ok/before", "v1", 3).await;
    push_test_image(&client, &src.fqdn, "ok/after", "v1", 4).await;

    let mut schema = CollectorSchema::default();
    schema.extend(vec![
        copy_entry(&src.fqdn, &dst.fqdn, "ok/before", ImageType::OperatorBundle),
        copy_entry(&src.fqdn, &dst.fqdn, "missing/release", ImageType::OcpRelease),
        copy_entry(&src.fqdn, &dst.fqdn, "ok/after", ImageType::Generic),
    ]);

    let opts = CopyOptions::default();
    let batch = Batch::new(
        Arc::new(Copier::new(Arc::clone(&client))),
        logs.path().to_path_buf(),
    );
    let err = batch
        .worker(&schema, CopyFunction::Copy, Mode::MirrorToDisk, &opts)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnsafeBatch { .. }));
    assert!(opts.cancel.is_cancelled(), "remaining copies are cancelled");

    // nothing after the release failure was attempted
    assert!(!dst_store.list_repositories().contains(&"ok/after".to_string()));
    // and the release failure is in the log
    let log_file = fs::read_dir(logs.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("mirroring_errors_"))
        .expect("error log written");
    let contents = fs::read_to_string(log_file.path()).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("missing/release"));

    src.stop().await;
    dst.stop().await;
}

// =============================================================================
// Graph Image Tally
// =============================================================================

#[tokio::test]
async fn test_graph_image_is_tallied_not_copied_in_disk_modes() {
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let logs = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    // the graph entry points nowhere copyable; disk-producing modes must
    // not attempt it
    let mut schema = CollectorSchema::default();
    schema.extend(vec![CopyImage {
        origin: "graph-image".to_string(),
        source: format!("docker://{}/openshift/graph-image:latest", dst.fqdn),
        destination: format!("docker://{}/openshift/graph-image:latest", dst.fqdn),
        image_type: ImageType::CincinnatiGraph,
    }]);

    let batch = Batch::new(
        Arc::new(Copier::new(Arc::clone(&client))),
        logs.path().to_path_buf(),
    );
    let copied = batch
        .worker(&schema, CopyFunction::Copy, Mode::MirrorToDisk, &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(copied.len(), 1);
    assert_eq!(copied.total_release_images, 1);

    dst.stop().await;
}
