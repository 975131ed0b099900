//! Tests for the delete pipeline.
//!
//! Drives generate and execute end to end against embedded registries:
//! the generated YAML carries each image's blob closure, execute removes
//! destination manifests, and forced cache deletion removes blob files.

use std::fs;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use airlift::api::{CopyImage, DeleteImageList, ImageType};
use airlift::batch::Batch;
use airlift::blobgather::BlobGatherer;
use airlift::cache::{start_registry, CacheStore, RunningRegistry};
use airlift::client::RegistryClient;
use airlift::config::DeleteImageSetConfig;
use airlift::constants::{MIRROR_API_VERSION, OCI_MANIFEST_MEDIA_TYPE};
use airlift::copier::{Copier, CopyOptions};
use airlift::delete::DeletePipeline;
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
    let layer = vec![seed; 96];
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

fn delete_config() -> DeleteImageSetConfig {
    DeleteImageSetConfig {
        kind: "DeleteImageSetConfiguration".to_string(),
        api_version: MIRROR_API_VERSION.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Generate
// =============================================================================

#[tokio::test]
async fn test_generate_writes_contract_with_blob_closure() {
    let (_cache_tmp, cache_store, cache) = start_test_registry().await;
    let work = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    let (manifest_digest, layer_digest, config_digest) =
        push_test_image(&client, &cache.fqdn, "ns/img", "v1", 21).await;

    let images = vec![CopyImage {
        origin: "registry.example/ns/img:v1".to_string(),
        source: format!("docker://{}/ns/img:v1", cache.fqdn),
        destination: "ns/img:v1".to_string(),
        image_type: ImageType::Generic,
    }];

    let pipeline = DeletePipeline {
        working_dir: work.path().to_path_buf(),
        cache: cache_store,
        delete_yaml_file: None,
        delete_id: None,
        force_cache_delete: false,
    };
    let gatherer = BlobGatherer::new(&client);
    let path = pipeline
        .write_delete_metadata(&images, &gatherer, &delete_config())
        .await
        .unwrap();

    let list: DeleteImageList =
        serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(list.kind, "DeleteImageList");
    assert_eq!(list.api_version, MIRROR_API_VERSION);
    assert_eq!(list.items.len(), 1);

    let item = &list.items[0];
    assert_eq!(item.image_name, "registry.example/ns/img:v1");
    assert_eq!(item.image_reference, "ns/img:v1");
    let mut expected = vec![manifest_digest, layer_digest, config_digest];
    expected.sort();
    assert_eq!(item.related_blobs, expected);

    // the config snapshot sits next to the list
    assert!(work
        .path()
        .join("delete")
        .join("delete-imageset-config.yaml")
        .exists());
    cache.stop().await;
}

#[tokio::test]
async fn test_generate_with_delete_id_versions_the_files() {
    let (_cache_tmp, cache_store, cache) = start_test_registry().await;
    let work = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    let pipeline = DeletePipeline {
        working_dir: work.path().to_path_buf(),
        cache: cache_store,
        delete_yaml_file: None,
        delete_id: Some("jan".to_string()),
        force_cache_delete: false,
    };
    let gatherer = BlobGatherer::new(&client);
    let path = pipeline
        .write_delete_metadata(&[], &gatherer, &delete_config())
        .await
        .unwrap();

    assert!(path.ends_with("delete/delete-images-jan.yaml"));
    assert!(work
        .path()
        .join("delete")
        .join("delete-imageset-config-jan.yaml")
        .exists());
    cache.stop().await;
}

// =============================================================================
// Execute
// =============================================================================

#[tokio::test]
async fn test_execute_deletes_destination_manifests() {
    let (_cache_tmp, cache_store, cache) = start_test_registry().await;
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let work = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    // the image lives in both the cache and the destination
    let (_, layer_digest, _) = push_test_image(&client, &cache.fqdn, "ns/img", "v1", 22).await;
    push_test_image(&client, &dst.fqdn, "ns/img", "v1", 22).await;

    let images = vec![CopyImage {
        origin: "registry.example/ns/img:v1".to_string(),
        source: format!("docker://{}/ns/img:v1", cache.fqdn),
        destination: "ns/img:v1".to_string(),
        image_type: ImageType::Generic,
    }];

    let pipeline = DeletePipeline {
        working_dir: work.path().to_path_buf(),
        cache: cache_store.clone(),
        delete_yaml_file: None,
        delete_id: None,
        force_cache_delete: true,
    };
    let gatherer = BlobGatherer::new(&client);
    pipeline
        .write_delete_metadata(&images, &gatherer, &delete_config())
        .await
        .unwrap();

    // execute: read back, purge cache blobs, delete from the destination
    let list = pipeline.read_delete_metadata().unwrap();
    pipeline.delete_cache_blobs(&list).unwrap();

    let batch = Batch::new(
        Arc::new(Copier::new(Arc::clone(&client))),
        logs.path().to_path_buf(),
    );
    pipeline
        .delete_registry_images(
            &list,
            &format!("docker://{}", dst.fqdn),
            &batch,
            &CopyOptions::default(),
        )
        .await
        .unwrap();

    // destination no longer serves the manifest
    let dst_image = ImageRef::parse(&format!("docker://{}/ns/img:v1", dst.fqdn)).unwrap();
    assert!(client.get_manifest(&dst_image).await.is_err());

    // forced cache deletion removed the blob files
    assert!(!cache_store.has_blob(&layer_digest));

    cache.stop().await;
    dst.stop().await;
}

#[tokio::test]
async fn test_execute_failures_are_fail_safe() {
    let (_dst_tmp, _dst_store, dst) = start_test_registry().await;
    let (_cache_tmp, cache_store, cache) = start_test_registry().await;
    let logs = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let client = Arc::new(RegistryClient::new(vec![]).unwrap());

    // one deletable image, one that was never pushed
    push_test_image(&client, &dst.fqdn, "ns/real", "v1", 23).await;
    let list = DeleteImageList {
        kind: "DeleteImageList".to_string(),
        api_version: MIRROR_API_VERSION.to_string(),
        items: vec![
            airlift::api::DeleteItem {
                image_name: "absent".to_string(),
                image_reference: "ns/absent:v1".to_string(),
                image_type: ImageType::Generic,
                related_blobs: vec![],
            },
            airlift::api::DeleteItem {
                image_name: "real".to_string(),
                image_reference: "ns/real:v1".to_string(),
                image_type: ImageType::Generic,
                related_blobs: vec![],
            },
        ],
    };

    let pipeline = DeletePipeline {
        working_dir: work.path().to_path_buf(),
        cache: cache_store,
        delete_yaml_file: None,
        delete_id: None,
        force_cache_delete: false,
    };
    let batch = Batch::new(
        Arc::new(Copier::new(Arc::clone(&client))),
        logs.path().to_path_buf(),
    );
    let result = pipeline
        .delete_registry_images(
            &list,
            &format!("docker://{}", dst.fqdn),
            &batch,
            &CopyOptions::default(),
        )
        .await;

    // the absent image resolves through get-then-delete: the manifest
    // fetch fails and is recorded as a fail-safe error
    assert!(matches!(
        result.unwrap_err(),
        airlift::error::Error::SafeBatch(_)
    ));
    // the real one is gone regardless
    let real = ImageRef::parse(&format!("docker://{}/ns/real:v1", dst.fqdn)).unwrap();
    assert!(client.get_manifest(&real).await.is_err());

    cache.stop().await;
    dst.stop().await;
}
