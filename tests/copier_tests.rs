//! Tests for the image copy primitive.
//!
//! Spins up embedded registries as source and destination and validates
//! the registry-to-registry, registry-to-layout, and layout-to-registry
//! paths, plus the blob gatherer's closure over what was copied.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use airlift::api::CopyFunction;
use airlift::blobgather::BlobGatherer;
use airlift::cache::{start_registry, CacheStore, RunningRegistry};
use airlift::client::RegistryClient;
use airlift::constants::OCI_MANIFEST_MEDIA_TYPE;
use airlift::copier::{Copier, CopyOptions};
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

async fn push_test_image(
    client: &RegistryClient,
    fqdn: &str,
    repo: &str,
    tag: &str,
    seed: u8,
) -> (String, String, String) {
    let layer = vec![seed; 256];
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
    let manifest_digest = digest_of(manifest.as_bytes());

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
    (manifest_digest, layer_digest, config_digest)
}

// =============================================================================
// Registry to Registry
// =============================================================================

#[tokio::test]
async fn test_registry_to_registry_copy() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, dst_store, dst) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    let (manifest_digest, layer_digest, config_digest) =
        push_test_image(&client, &src.fqdn, "ns/img", "v1", 11).await;

    let copier = Copier::new(Arc::clone(&client));
    copier
        .run(
            &format!("docker://{}/ns/img:v1", src.fqdn),
            &format!("docker://{}/ns/img:v1", dst.fqdn),
            CopyFunction::Copy,
            &CopyOptions::default(),
        )
        .await
        .unwrap();

    let dst_image = ImageRef::parse(&format!("docker://{}/ns/img:v1", dst.fqdn)).unwrap();
    let fetched = client.get_manifest(&dst_image).await.unwrap();
    assert_eq!(fetched.digest, manifest_digest);
    assert!(dst_store.has_blob(&layer_digest));
    assert!(dst_store.has_blob(&config_digest));

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_copy_is_idempotent() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    push_test_image(&client, &src.fqdn, "ns/img", "v1", 12).await;
    let copier = Copier::new(Arc::clone(&client));
    let src_ref = format!("docker://{}/ns/img:v1", src.fqdn);
    let dst_ref = format!("docker://{}/ns/img:v1", dst.fqdn);

    copier
        .run(&src_ref, &dst_ref, CopyFunction::Copy, &CopyOptions::default())
        .await
        .unwrap();
    // second run finds every blob already present
    copier
        .run(&src_ref, &dst_ref, CopyFunction::Copy, &CopyOptions::default())
        .await
        .unwrap();

    src.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_copy_of_missing_image_fails() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    let copier = Copier::new(Arc::clone(&client));
    let result = copier
        .run(
            &format!("docker://{}/ns/absent:v1", src.fqdn),
            &format!("docker://{}/ns/absent:v1", dst.fqdn),
            CopyFunction::Copy,
            &CopyOptions::default(),
        )
        .await;
    assert!(result.is_err());

    src.stop().await;
    dst.stop().await;
}

// =============================================================================
// OCI Layout Paths
// =============================================================================

#[tokio::test]
async fn test_registry_to_layout_to_registry() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());
    let layout_tmp = TempDir::new().unwrap();
    let layout = layout_tmp.path().join("catalog-layout");

    let (manifest_digest, _, _) =
        push_test_image(&client, &src.fqdn, "redhat/index", "v4.15", 13).await;

    let copier = Copier::new(Arc::clone(&client));
    copier
        .run(
            &format!("docker://{}/redhat/index:v4.15", src.fqdn),
            &format!("oci://{}", layout.display()),
            CopyFunction::Copy,
            &CopyOptions::default(),
        )
        .await
        .unwrap();

    // the layout is complete on disk
    assert!(layout.join("index.json").exists());
    assert!(layout.join("oci-layout").exists());
    let index = airlift::manifest::read_index(&layout).unwrap();
    assert_eq!(index.manifests[0].digest, manifest_digest);

    // push it back out to a different registry
    copier
        .run(
            &format!("oci://{}", layout.display()),
            &format!("docker://{}/mirrored/index:v4.15", dst.fqdn),
            CopyFunction::Copy,
            &CopyOptions::default(),
        )
        .await
        .unwrap();

    let pushed = ImageRef::parse(&format!("docker://{}/mirrored/index:v4.15", dst.fqdn)).unwrap();
    let fetched = client.get_manifest(&pushed).await.unwrap();
    assert_eq!(fetched.digest, manifest_digest);

    src.stop().await;
    dst.stop().await;
}

// =============================================================================
// Delete Function
// =============================================================================

#[tokio::test]
async fn test_delete_function_removes_manifest() {
    let (_tmp, _store, registry) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    push_test_image(&client, &registry.fqdn, "ns/img", "v1", 14).await;
    let reference = format!("docker://{}/ns/img:v1", registry.fqdn);

    let copier = Copier::new(Arc::clone(&client));
    copier
        .run("delete-yaml", &reference, CopyFunction::Delete, &CopyOptions::default())
        .await
        .unwrap();

    let image = ImageRef::parse(&reference).unwrap();
    assert!(client.get_manifest(&image).await.is_err());
    registry.stop().await;
}

// =============================================================================
// Blob Gathering
// =============================================================================

#[tokio::test]
async fn test_gathered_blobs_are_the_manifest_closure() {
    let (_tmp, _store, registry) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    let (manifest_digest, layer_digest, config_digest) =
        push_test_image(&client, &registry.fqdn, "ns/img", "v1", 15).await;

    let gatherer = BlobGatherer::new(&client);
    let blobs = gatherer
        .gather(&format!("docker://{}/ns/img:v1", registry.fqdn))
        .await
        .unwrap();

    let mut expected = vec![manifest_digest, layer_digest, config_digest];
    expected.sort();
    assert_eq!(blobs, expected, "closure holds exactly the reachable digests");
    registry.stop().await;
}

#[tokio::test]
async fn test_cancellation_surfaces_before_copying() {
    let (_src_tmp, _src_store, src) = start_test_registry().await;
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    push_test_image(&client, &src.fqdn, "ns/img", "v1", 16).await;
    let opts = CopyOptions::default();
    opts.cancel.cancel();

    let copier = Copier::new(Arc::clone(&client));
    let result = copier
        .run(
            &format!("docker://{}/ns/img:v1", src.fqdn),
            "docker://localhost:1/ns/img:v1",
            CopyFunction::Copy,
            &opts,
        )
        .await;
    assert!(matches!(result.unwrap_err(), airlift::error::Error::Cancelled(_)));
    src.stop().await;
}
