//! Operator catalog resolution.
//!
//! Loads a File-Based Catalog (declarative config) tree extracted from a
//! catalog image and filters its bundles against user package selectors to
//! produce the flat set of images to mirror.
//!
//! ## Selection Semantics
//!
//! For each package filter:
//! - no channel list selects the package's default channel; a listed
//!   channel that does not exist is an error
//! - `full = true` selects every bundle of the selected channels
//! - no version bounds selects only the channel head (the entry no other
//!   entry replaces)
//! - bounds select bundles whose `olm.package` property version falls in
//!   the inclusive range; one-sided bounds are supported; a bundle without
//!   a version property is skipped with a warning
//!
//! The result is `(bundle.image) ∪ (bundle.relatedImages[*].image)`,
//! deduplicated by image reference, first occurrence winning on name ties.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::api::RelatedImage;
use crate::config::PackageFilter;
use crate::error::{Error, Result};

// =============================================================================
// Declarative Config Model
// =============================================================================

/// One declarative-config document. The `schema` field decides which of
/// the optional fields are meaningful.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclarativeConfig {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub default_channel: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub entries: Option<Vec<ChannelEntry>>,
    #[serde(default)]
    pub properties: Option<Vec<Property>>,
    #[serde(default)]
    pub related_images: Option<Vec<RelatedImage>>,
}

/// A channel entry: a bundle name and its upgrade-graph relations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default)]
    pub replaces: Option<String>,
    #[serde(default)]
    pub skips: Option<Vec<String>>,
    #[serde(default)]
    pub skip_range: Option<String>,
}

/// A typed bundle property; `olm.package` carries the version.
#[derive(Debug, Clone, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub prop_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// An image selected out of a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImage {
    pub name: String,
    pub image: String,
    /// True when this is a bundle image rather than a related image.
    pub is_bundle: bool,
}

// =============================================================================
// Catalog Loading
// =============================================================================

/// A loaded catalog: packages, channels, and bundles indexed by name.
#[derive(Debug, Default)]
pub struct Catalog {
    /// package name -> package document
    packages: BTreeMap<String, DeclarativeConfig>,
    /// (package name, channel name) -> channel document
    channels: HashMap<(String, String), DeclarativeConfig>,
    /// bundle name -> bundle document
    bundles: HashMap<String, DeclarativeConfig>,
}

impl Catalog {
    /// Loads every JSON/YAML document under `configs_dir`.
    ///
    /// JSON files may hold a concatenated stream of documents (the usual
    /// `catalog.json` shape); YAML files may hold multiple documents.
    /// Documents with an unrecognized `schema` are ignored.
    pub fn load(configs_dir: &Path) -> Result<Self> {
        let mut catalog = Self::default();

        for file in WalkDir::new(configs_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = file.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            match ext.as_str() {
                "json" => {
                    let data = fs::read(path)
                        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
                    let stream =
                        serde_json::Deserializer::from_slice(&data).into_iter::<DeclarativeConfig>();
                    for doc in stream {
                        let doc = doc.map_err(|e| Error::Format {
                            context: path.display().to_string(),
                            reason: e.to_string(),
                        })?;
                        catalog.classify(doc);
                    }
                }
                "yaml" | "yml" => {
                    let data = fs::read_to_string(path)
                        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
                    for raw in data.split("\n---") {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        let doc: DeclarativeConfig =
                            serde_yaml::from_str(raw).map_err(|e| Error::Format {
                                context: path.display().to_string(),
                                reason: e.to_string(),
                            })?;
                        catalog.classify(doc);
                    }
                }
                _ => {}
            }
        }

        Ok(catalog)
    }

    fn classify(&mut self, doc: DeclarativeConfig) {
        match doc.schema.as_str() {
            "olm.package" => {
                self.packages.insert(doc.name.clone(), doc);
            }
            "olm.channel" => {
                self.channels
                    .insert((doc.package.clone(), doc.name.clone()), doc);
            }
            "olm.bundle" => {
                self.bundles.insert(doc.name.clone(), doc);
            }
            other => debug!("ignoring document with schema '{}'", other),
        }
    }

    /// Names of all packages in the catalog.
    pub fn package_names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// The version carried by a bundle's `olm.package` property.
    fn bundle_version(&self, bundle_name: &str) -> Option<semver::Version> {
        let bundle = self.bundles.get(bundle_name)?;
        let props = bundle.properties.as_ref()?;
        for prop in props {
            if prop.prop_type == "olm.package" {
                if let Some(version) = prop.value.get("version").and_then(|v| v.as_str()) {
                    let trimmed = version.trim_start_matches('v');
                    match semver::Version::parse(trimmed) {
                        Ok(v) => return Some(v),
                        Err(e) => {
                            warn!("bundle {}: unparseable version '{}': {}", bundle_name, version, e);
                            return None;
                        }
                    }
                }
            }
        }
        None
    }

    /// The channel head: the entry no other entry replaces.
    ///
    /// When the replaces graph is ambiguous the first unreplaced entry in
    /// document order is used and a warning is logged.
    fn channel_head<'a>(&self, channel: &'a DeclarativeConfig) -> Result<&'a ChannelEntry> {
        let entries = channel.entries.as_deref().unwrap_or(&[]);
        if entries.is_empty() {
            return Err(Error::Format {
                context: format!("channel {}/{}", channel.package, channel.name),
                reason: "channel has no entries".to_string(),
            });
        }
        let replaced: HashSet<&str> = entries
            .iter()
            .filter_map(|e| e.replaces.as_deref())
            .collect();
        let mut heads = entries.iter().filter(|e| !replaced.contains(e.name.as_str()));
        let head = heads.next().ok_or_else(|| Error::Format {
            context: format!("channel {}/{}", channel.package, channel.name),
            reason: "no channel head: replaces relations form a cycle".to_string(),
        })?;
        if heads.next().is_some() {
            warn!(
                "channel {}/{} has multiple heads; using {}",
                channel.package, channel.name, head.name
            );
        }
        Ok(head)
    }

    // =========================================================================
    // Filtering
    // =========================================================================

    /// Applies a package filter and returns the selected images.
    pub fn filter_package(&self, filter: &PackageFilter, full: bool) -> Result<Vec<SelectedImage>> {
        let package = self.packages.get(&filter.name).ok_or_else(|| {
            Error::NotFound(format!("package '{}' not found in catalog", filter.name))
        })?;

        // Resolve the channel list: explicit names, or the default channel.
        let mut selected_channels: Vec<(&DeclarativeConfig, Option<String>, Option<String>)> =
            Vec::new();
        if filter.channels.is_empty() {
            let default = package.default_channel.as_deref().ok_or_else(|| {
                Error::Format {
                    context: filter.name.clone(),
                    reason: "package has no default channel".to_string(),
                }
            })?;
            let channel = self
                .channels
                .get(&(filter.name.clone(), default.to_string()))
                .ok_or_else(|| Error::ChannelNotFound {
                    channel: default.to_string(),
                    package: filter.name.clone(),
                })?;
            selected_channels.push((channel, filter.min_version.clone(), filter.max_version.clone()));
        } else {
            for chn in &filter.channels {
                let channel = self
                    .channels
                    .get(&(filter.name.clone(), chn.name.clone()))
                    .ok_or_else(|| Error::ChannelNotFound {
                        channel: chn.name.clone(),
                        package: filter.name.clone(),
                    })?;
                // Channel-level bounds override package-level bounds.
                let min = chn.min_version.clone().or_else(|| filter.min_version.clone());
                let max = chn.max_version.clone().or_else(|| filter.max_version.clone());
                selected_channels.push((channel, min, max));
            }
        }

        let mut bundle_names: Vec<String> = Vec::new();
        let mut seen_bundles: HashSet<String> = HashSet::new();

        for (channel, min, max) in &selected_channels {
            let chosen: Vec<String> = if full {
                channel
                    .entries
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .map(|e| e.name.clone())
                    .collect()
            } else if min.is_none() && max.is_none() {
                vec![self.channel_head(channel)?.name.clone()]
            } else {
                self.select_by_range(channel, min.as_deref(), max.as_deref())?
            };

            for name in chosen {
                if seen_bundles.insert(name.clone()) {
                    bundle_names.push(name);
                }
            }
        }

        self.images_of_bundles(&bundle_names)
    }

    /// Head-only selection over every package (no filters configured).
    pub fn filter_all(&self) -> Result<Vec<SelectedImage>> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for name in self.package_names() {
            let filter = PackageFilter {
                name,
                ..Default::default()
            };
            for img in self.filter_package(&filter, false)? {
                if seen.insert(img.image.clone()) {
                    out.push(img);
                }
            }
        }
        Ok(out)
    }

    fn select_by_range(
        &self,
        channel: &DeclarativeConfig,
        min: Option<&str>,
        max: Option<&str>,
    ) -> Result<Vec<String>> {
        let parse_bound = |bound: Option<&str>| -> Result<Option<semver::Version>> {
            match bound {
                None => Ok(None),
                Some(raw) => semver::Version::parse(raw.trim_start_matches('v'))
                    .map(Some)
                    .map_err(|e| Error::Validation(format!("bad version bound '{}': {}", raw, e))),
            }
        };
        let min = parse_bound(min)?;
        let max = parse_bound(max)?;

        let mut selected = Vec::new();
        for entry in channel.entries.as_deref().unwrap_or(&[]) {
            let Some(version) = self.bundle_version(&entry.name) else {
                warn!(
                    "bundle {} has no olm.package version property; skipping",
                    entry.name
                );
                continue;
            };
            let above_min = min.as_ref().map(|m| version >= *m).unwrap_or(true);
            let below_max = max.as_ref().map(|m| version <= *m).unwrap_or(true);
            if above_min && below_max {
                selected.push(entry.name.clone());
            }
        }
        Ok(selected)
    }

    /// Resolves bundle names into their image set, deduplicated by image.
    fn images_of_bundles(&self, bundle_names: &[String]) -> Result<Vec<SelectedImage>> {
        let mut out: Vec<SelectedImage> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for name in bundle_names {
            let Some(bundle) = self.bundles.get(name) else {
                warn!("channel entry '{}' has no bundle document; skipping", name);
                continue;
            };
            if let Some(image) = &bundle.image {
                if seen.insert(image.clone()) {
                    out.push(SelectedImage {
                        name: bundle.name.clone(),
                        image: image.clone(),
                        is_bundle: true,
                    });
                }
            }
            for related in bundle.related_images.as_deref().unwrap_or(&[]) {
                if seen.insert(related.image.clone()) {
                    out.push(SelectedImage {
                        name: related.name.clone(),
                        image: related.image.clone(),
                        is_bundle: false,
                    });
                }
            }
        }
        Ok(out)
    }
}
