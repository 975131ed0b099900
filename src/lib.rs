//! # airlift
//!
//! **Disconnected-registry mirroring engine.**
//!
//! airlift collects the container images a cluster platform needs —
//! release payloads, operator catalogs with their bundle-referenced
//! images, and user-named additional images — materializes them into a
//! local content-addressed cache fronted by an embedded registry, packs
//! the cache into portable tar chunks for transport across an air gap,
//! and replays them into a destination registry on the far side. A
//! symmetric delete workflow prunes previously mirrored content from the
//! cache and the destination.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Mode Orchestrator                        │
//! │   MirrorToDisk │ DiskToMirror │ MirrorToMirror │ Delete │ Prepare│
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Collectors                     Batch Copier                    │
//! │  ├── release (update graph)     ├── fail-fast: release images   │
//! │  ├── operator (FBC filtering)   └── fail-safe: everything else  │
//! │  └── additional (passthrough)                                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Copy Primitive          Embedded Cache Registry                │
//! │  docker:// ⇄ oci://      docker/registry/v2 blob tree over HTTP │
//! │  mirror-aware transport  deletion-enabled, loopback only        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Archive Builder/Extractor        Blob Gatherer                 │
//! │  mirror_NNNNNN.tar chunks         transitive digest closure     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline Ordering
//!
//! Within a run, collection strictly precedes copying; copying strictly
//! precedes archive building (MirrorToDisk) or mapping emission
//! (DiskToMirror). The delete pipeline reads its metadata contract before
//! any mutation. The embedded registry owns the cache tree while it runs
//! and is stopped before the archive builder walks the blobs.

pub mod api;
pub mod archive;
pub mod batch;
pub mod blobgather;
pub mod cache;
pub mod catalog;
pub mod cincinnati;
pub mod client;
pub mod collector;
pub mod config;
pub mod constants;
pub mod copier;
pub mod delete;
pub mod error;
pub mod executor;
pub mod image;
pub mod manifest;
pub mod signature;
pub mod transport;

pub use api::{
    CollectorSchema, CopyFunction, CopyImage, DeleteImageList, DeleteItem, ImageType, Mode,
    RelatedImage,
};
pub use archive::{ArchiveBuilder, ArchiveExtractor};
pub use batch::Batch;
pub use blobgather::BlobGatherer;
pub use cache::{start_registry, CacheStore, RunningRegistry};
pub use catalog::Catalog;
pub use client::RegistryClient;
pub use config::{DeleteImageSetConfig, ImageSetConfig, PackageFilter};
pub use copier::{Copier, CopyOptions};
pub use delete::DeletePipeline;
pub use error::{Error, Result};
pub use executor::{validate_mirror_mode, Executor, ExecutorOptions};
pub use image::{ImageRef, Transport};
pub use transport::{Mirror, MirrorEndpoint, MirroredClient};
