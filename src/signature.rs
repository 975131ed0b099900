//! Per-registry signature-attachment configuration (registries.d).
//!
//! The copy primitive honors sigstore attachments only for registries that
//! opt in through registries.d. This module copies the user's existing
//! `~/.config/containers/registries.d` tree under the working directory so
//! system-wide settings are preserved, then adds minimal entries for the
//! cache and destination registries. The working copy is authoritative for
//! the rest of the process.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CONTAINERS_SUBDIR, DIR_PROTOCOL, DOCKER_PROTOCOL, FILE_PROTOCOL, OCI_PROTOCOL_TRIMMED,
    REGISTRIES_D_SUBDIR,
};
use crate::error::{Error, Result};

/// registries.d file payload: `docker: { <host>: { use-sigstore-attachments: true } }`.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryConfiguration {
    docker: BTreeMap<String, RegistryNamespace>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryNamespace {
    #[serde(rename = "use-sigstore-attachments")]
    use_sigstore_attachments: bool,
}

/// Relative path of the per-user registries.d tree.
const USER_REGISTRIES_D: &str = ".config/containers/registries.d";

/// Prepares the working registries.d directory and registers the cache
/// and destination registries. Returns the authoritative directory path.
pub fn set_registry_configuration(
    working_dir: &Path,
    cache_registry_url: &str,
    destination_url: &str,
) -> Result<PathBuf> {
    let registries_dir = working_dir.join(CONTAINERS_SUBDIR).join(REGISTRIES_D_SUBDIR);
    fs::create_dir_all(&registries_dir)
        .map_err(|e| Error::io(format!("creating {}", registries_dir.display()), e))?;

    // Preserve any per-user configuration by copying it into the working
    // tree first; the working copy is what the process consults.
    if let Some(home) = dirs::home_dir() {
        let user_dir = home.join(USER_REGISTRIES_D);
        if user_dir.is_dir() {
            copy_dir_contents(&user_dir, &registries_dir)?;
        }
    }

    add_registry(&registries_dir, cache_registry_url)?;
    add_registry(&registries_dir, destination_url)?;
    Ok(registries_dir)
}

/// Writes `<host>.yaml` enabling sigstore attachments, unless the file
/// already exists (existing configuration wins) or the URL is disk-like.
fn add_registry(registries_dir: &Path, registry_url: &str) -> Result<()> {
    if registry_url.starts_with(FILE_PROTOCOL)
        || registry_url.starts_with(DIR_PROTOCOL)
        || registry_url.starts_with(OCI_PROTOCOL_TRIMMED)
    {
        // Disk destinations have no registry to configure.
        return Ok(());
    }

    let host = registry_url
        .strip_prefix(DOCKER_PROTOCOL)
        .unwrap_or(registry_url);
    if host.is_empty() {
        return Ok(());
    }

    let config_path = registries_dir.join(format!("{}.yaml", host));
    if config_path.exists() {
        debug!("registries.d entry {} already present", config_path.display());
        return Ok(());
    }

    let mut docker = BTreeMap::new();
    docker.insert(
        host.to_string(),
        RegistryNamespace {
            use_sigstore_attachments: true,
        },
    );
    let payload = serde_yaml::to_string(&RegistryConfiguration { docker }).map_err(|e| {
        Error::Format {
            context: config_path.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    fs::write(&config_path, payload)
        .map_err(|e| Error::io(format!("writing {}", config_path.display()), e))?;
    debug!("wrote registries.d entry {}", config_path.display());
    Ok(())
}

/// Recursively copies the contents of `from` into `to`.
fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in
        fs::read_dir(from).map_err(|e| Error::io(format!("reading {}", from.display()), e))?
    {
        let entry = entry.map_err(|e| Error::io(format!("reading {}", from.display()), e))?;
        let target = to.join(entry.file_name());
        let path = entry.path();
        if path.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("creating {}", target.display()), e))?;
            copy_dir_contents(&path, &target)?;
        } else {
            fs::copy(&path, &target)
                .map_err(|e| Error::io(format!("copying to {}", target.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_adds_cache_and_destination_entries() {
        let tmp = TempDir::new().unwrap();
        let dir = set_registry_configuration(
            tmp.path(),
            "docker://localhost:55000",
            "docker://dst.example",
        )
        .unwrap();

        let cache = fs::read_to_string(dir.join("localhost:55000.yaml")).unwrap();
        assert!(cache.contains("localhost:55000"));
        assert!(cache.contains("use-sigstore-attachments: true"));
        assert!(dir.join("dst.example.yaml").exists());
    }

    #[test]
    fn test_disk_destinations_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = set_registry_configuration(
            tmp.path(),
            "docker://localhost:55000",
            "file:///srv/mirror",
        )
        .unwrap();
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_existing_entry_is_left_untouched() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(CONTAINERS_SUBDIR).join(REGISTRIES_D_SUBDIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("dst.example.yaml"), "custom: true\n").unwrap();

        set_registry_configuration(tmp.path(), "docker://localhost:55000", "docker://dst.example")
            .unwrap();
        let contents = fs::read_to_string(dir.join("dst.example.yaml")).unwrap();
        assert_eq!(contents, "custom: true\n");
    }
}
