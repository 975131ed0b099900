//! Constants for the mirroring engine.
//!
//! All limits, timeouts, protocol prefixes, and well-known path names are
//! defined here to ensure consistency and prevent magic numbers throughout
//! the codebase.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single layer blob (512 MiB).
/// Prevents disk exhaustion from malicious images.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Default archive chunk size when the image-set config does not set one (4 GiB).
pub const DEFAULT_ARCHIVE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

// =============================================================================
// Concurrency Limits
// =============================================================================

/// Maximum concurrent layer downloads for a single image.
pub const MAX_LAYER_DOWNLOADS_PER_IMAGE: usize = 10;

/// Maximum concurrent downloads across a whole batch.
pub const MAX_BATCH_DOWNLOADS: usize = 200;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for a single manifest or blob request.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for the embedded registry to answer its readiness probe.
pub const REGISTRY_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Transport Prefixes
// =============================================================================

/// Registry transport prefix.
pub const DOCKER_PROTOCOL: &str = "docker://";

/// OCI layout transport prefix.
pub const OCI_PROTOCOL: &str = "oci://";

/// OCI layout transport prefix without slashes (as written by some tools).
pub const OCI_PROTOCOL_TRIMMED: &str = "oci:";

/// Local directory transport prefix.
pub const FILE_PROTOCOL: &str = "file://";

/// Local directory transport prefix (alternate spelling).
pub const DIR_PROTOCOL: &str = "dir://";

// =============================================================================
// Cache Registry
// =============================================================================

/// Default loopback port for the embedded cache registry.
pub const DEFAULT_CACHE_PORT: u16 = 55000;

/// Environment variable overriding the cache root directory.
pub const CACHE_ENV_VAR: &str = "AIRLIFT_CACHE";

/// Environment variable overriding the containers registries configuration.
pub const REGISTRIES_CONF_ENV_VAR: &str = "CONTAINERS_REGISTRIES_CONF";

/// Default cache directory under `$HOME` when `AIRLIFT_CACHE` is unset.
pub const DEFAULT_CACHE_SUBDIR: &str = ".airlift/.cache";

/// Distribution filesystem prefix of the blob tree inside the cache root.
pub const REGISTRY_BLOB_PREFIX: &str = "docker/registry/v2";

/// Blob data tree under the registry prefix.
pub const BLOBS_SUBPATH: &str = "docker/registry/v2/blobs/sha256";

// =============================================================================
// Working Directory Layout
// =============================================================================

/// Working directory name embedded in archive entry paths.
pub const WORKING_DIR: &str = "working-dir";

/// Run logs, including the registry access log and batch error logs.
pub const LOGS_SUBDIR: &str = "logs";

/// OCI layouts of pulled release payloads.
pub const RELEASE_IMAGES_SUBDIR: &str = "release-images";

/// Extracted release manifests.
pub const HOLD_RELEASE_SUBDIR: &str = "hold-release";

/// OCI layouts of pulled operator catalogs.
pub const OPERATOR_IMAGES_SUBDIR: &str = "operator-images";

/// Extracted operator catalog trees.
pub const HOLD_OPERATOR_SUBDIR: &str = "hold-operator";

/// Cached update-graph answers keyed by platform filter.
pub const RELEASE_FILTERS_SUBDIR: &str = "release-filters";

/// Signature blobs.
pub const SIGNATURES_SUBDIR: &str = "signatures";

/// Delete-mode contracts.
pub const DELETE_SUBDIR: &str = "delete";

/// Final image-mapping output for downstream cluster-resource renderers.
pub const CLUSTER_RESOURCES_SUBDIR: &str = "cluster-resources";

/// Working copy of the registries.d tree.
pub const CONTAINERS_SUBDIR: &str = "containers";

/// registries.d directory name.
pub const REGISTRIES_D_SUBDIR: &str = "registries.d";

/// Relative path of the payload manifest list inside an extracted release.
pub const RELEASE_MANIFESTS_DIR: &str = "release-manifests";

/// File enumerating every image of a release payload.
pub const IMAGE_REFERENCES_FILE: &str = "image-references";

/// Delete image list file name.
pub const DELETE_IMAGES_YAML: &str = "delete-images.yaml";

/// Delete image-set config snapshot file name.
pub const DELETE_IMAGESET_CONFIG_YAML: &str = "delete-imageset-config.yaml";

// =============================================================================
// Archive Format
// =============================================================================

/// Archive chunk file prefix: `mirror_000001.tar`.
pub const ARCHIVE_FILE_PREFIX: &str = "mirror";

/// Name of the image-set config entry embedded in the first chunk.
pub const ARCHIVE_CONFIG_ENTRY: &str = "image-set-config.yaml";

// =============================================================================
// Catalog Constants
// =============================================================================

/// Label on a catalog image config naming the declarative-config directory.
pub const CONFIGS_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Truncation length applied to digests when synthesizing cache tags.
pub const DIGEST_TRUNC_LEN: usize = 12;

/// Repository path of the synthetic graph-data image inside the cache.
pub const GRAPH_IMAGE_NAME: &str = "openshift/graph-image";

// =============================================================================
// Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type.
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker schema-2 manifest media type.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema-2 manifest list media type.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image config media type.
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Docker layer media type (gzip compressed).
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

// =============================================================================
// API Versions
// =============================================================================

/// API version written into delete metadata and config snapshots.
pub const MIRROR_API_VERSION: &str = "mirror.openshift.io/v2alpha1";
