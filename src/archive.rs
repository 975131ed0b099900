//! Chunked tar packaging of the cache and working directory.
//!
//! The builder walks the cache blob tree and the working directory,
//! streaming regular files into numbered chunks (`mirror_000001.tar`,
//! zero-padded, starting at 1). A chunk is closed when the next file would
//! exceed the configured size. Files larger than the chunk size fail the
//! build in strict mode; in permissive mode they overflow the current
//! chunk. The effective image-set config is embedded at the top of the
//! first chunk for reproducibility; it is informational and never read
//! back by the extractor.
//!
//! Symbolic links are not emitted. Entry modes are the original mode OR'd
//! with owner-rwx, so every extracted file can be rewritten on the next
//! run.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tar::{Builder, Header};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::constants::{ARCHIVE_CONFIG_ENTRY, ARCHIVE_FILE_PREFIX, REGISTRY_BLOB_PREFIX, WORKING_DIR};
use crate::error::{Error, Result};

/// Owner-rwx bits OR'd into every entry mode.
const OWNER_RWX: u32 = 0o700;

fn chunk_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}_{:06}.tar", ARCHIVE_FILE_PREFIX, index))
}

// =============================================================================
// Builder
// =============================================================================

/// Builds the portable archive chunks.
pub struct ArchiveBuilder {
    /// Directory the chunks are written into.
    archive_dir: PathBuf,
    /// Cache root; its `docker/registry/v2` tree is archived.
    cache_root: PathBuf,
    /// Working directory; archived under the `working-dir/` prefix.
    working_dir: PathBuf,
    /// Chunk size bound in bytes.
    archive_size: u64,
    /// Fail on single files exceeding `archive_size`.
    strict: bool,
    /// Incremental builds: only cache blobs modified on or after this
    /// date are archived. Working-dir metadata is always included.
    since: Option<chrono::NaiveDate>,
}

struct ChunkWriter {
    archive_dir: PathBuf,
    index: usize,
    current: Builder<File>,
    current_size: u64,
    has_entries: bool,
    produced: Vec<PathBuf>,
}

impl ChunkWriter {
    fn new(archive_dir: &Path) -> Result<Self> {
        fs::create_dir_all(archive_dir)
            .map_err(|e| Error::io(format!("creating {}", archive_dir.display()), e))?;
        let path = chunk_path(archive_dir, 1);
        let file = File::create(&path)
            .map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
        Ok(Self {
            archive_dir: archive_dir.to_path_buf(),
            index: 1,
            current: Builder::new(file),
            current_size: 0,
            has_entries: false,
            produced: vec![path],
        })
    }

    fn rotate(&mut self) -> Result<()> {
        let builder = std::mem::replace(&mut self.current, Builder::new(
            File::create(chunk_path(&self.archive_dir, self.index + 1))
                .map_err(|e| Error::io("creating archive chunk".to_string(), e))?,
        ));
        builder
            .into_inner()
            .and_then(|mut f| f.flush().map(|_| f))
            .map_err(|e| Error::io("closing archive chunk".to_string(), e))?;
        self.index += 1;
        self.produced.push(chunk_path(&self.archive_dir, self.index));
        self.current_size = 0;
        self.has_entries = false;
        debug!("opened archive chunk {:06}", self.index);
        Ok(())
    }

    fn append_file(&mut self, entry_name: &str, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path)
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
        let mut header = Header::new_gnu();
        header.set_metadata(&metadata);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(metadata.permissions().mode() | OWNER_RWX);
        }
        #[cfg(not(unix))]
        header.set_mode(OWNER_RWX);
        header.set_size(metadata.len());
        header.set_cksum();
        let file = File::open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        self.current
            .append_data(&mut header, entry_name, file)
            .map_err(|e| Error::io(format!("archiving {}", entry_name), e))?;
        self.current_size += metadata.len();
        self.has_entries = true;
        Ok(())
    }

    fn append_bytes(&mut self, entry_name: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644 | OWNER_RWX);
        header.set_cksum();
        self.current
            .append_data(&mut header, entry_name, data)
            .map_err(|e| Error::io(format!("archiving {}", entry_name), e))?;
        self.current_size += data.len() as u64;
        self.has_entries = true;
        Ok(())
    }

    fn finish(self) -> Result<Vec<PathBuf>> {
        self.current
            .into_inner()
            .and_then(|mut f| f.flush().map(|_| f))
            .map_err(|e| Error::io("closing archive chunk".to_string(), e))?;
        Ok(self.produced)
    }
}

impl ArchiveBuilder {
    pub fn new(
        archive_dir: PathBuf,
        cache_root: PathBuf,
        working_dir: PathBuf,
        archive_size: u64,
        strict: bool,
    ) -> Self {
        Self {
            archive_dir,
            cache_root,
            working_dir,
            archive_size,
            strict,
            since: None,
        }
    }

    /// Restricts the cache walk to blobs modified on or after `date`.
    pub fn with_since(mut self, date: Option<chrono::NaiveDate>) -> Self {
        self.since = date;
        self
    }

    /// Builds the chunks, embedding `image_set_config` at the top of the
    /// first one. Returns the chunk paths in order.
    pub fn build(&self, image_set_config: &str) -> Result<Vec<PathBuf>> {
        let mut writer = ChunkWriter::new(&self.archive_dir)?;
        writer.append_bytes(ARCHIVE_CONFIG_ENTRY, image_set_config.as_bytes())?;

        // cache blob tree first, then the working-dir metadata
        let registry_tree = self.cache_root.join(REGISTRY_BLOB_PREFIX);
        self.append_tree(&mut writer, &registry_tree, &self.cache_root, None, self.since)?;
        self.append_tree(
            &mut writer,
            &self.working_dir,
            &self.working_dir,
            Some(WORKING_DIR),
            None,
        )?;

        let produced = writer.finish()?;
        info!(
            "archive built: {} chunk(s) under {}",
            produced.len(),
            self.archive_dir.display()
        );
        Ok(produced)
    }

    /// Walks `root`, archiving regular files. Entry names are relative to
    /// `base`, optionally re-rooted under `prefix`.
    fn append_tree(
        &self,
        writer: &mut ChunkWriter,
        root: &Path,
        base: &Path,
        prefix: Option<&str>,
        since: Option<chrono::NaiveDate>,
    ) -> Result<()> {
        if !root.exists() {
            return Ok(());
        }
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                // symlinks and directories are not emitted
                continue;
            }
            let path = entry.path();
            if let Some(cutoff) = since {
                let fresh = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .map(|mtime| {
                        chrono::DateTime::<chrono::Local>::from(mtime).date_naive() >= cutoff
                    })
                    .unwrap_or(true);
                if !fresh {
                    debug!("skipping {} (older than --since)", path.display());
                    continue;
                }
            }
            let relative = path.strip_prefix(base).unwrap_or(path);
            let entry_name = match prefix {
                Some(p) => format!("{}/{}", p, relative.display()),
                None => relative.display().to_string(),
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            if size > self.archive_size {
                if self.strict {
                    return Err(Error::ArchiveFileTooLarge {
                        path: path.to_path_buf(),
                        size,
                        limit: self.archive_size,
                    });
                }
                // Permissive: the oversized file overflows the current
                // chunk rather than forcing a rotation of its own.
                writer.append_file(&entry_name, path)?;
                continue;
            }
            if writer.has_entries && writer.current_size + size > self.archive_size {
                writer.rotate()?;
            }
            writer.append_file(&entry_name, path)?;
        }
        Ok(())
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Reverses [`ArchiveBuilder`]: replays chunks into the cache and working
/// directories.
pub struct ArchiveExtractor {
    /// Directory containing the numbered chunks.
    archive_dir: PathBuf,
    cache_root: PathBuf,
    working_dir: PathBuf,
}

impl ArchiveExtractor {
    pub fn new(archive_dir: PathBuf, cache_root: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            cache_root,
            working_dir,
        }
    }

    /// Extracts every chunk in numeric order. Entries that belong to
    /// neither the registry tree nor the working directory (including the
    /// embedded image-set config) are ignored.
    pub fn extract(&self) -> Result<()> {
        let first = chunk_path(&self.archive_dir, 1);
        if !first.exists() {
            return Err(Error::NotFound(format!(
                "archive chunk {}",
                first.display()
            )));
        }
        fs::create_dir_all(&self.working_dir)
            .map_err(|e| Error::io(format!("creating {}", self.working_dir.display()), e))?;
        fs::create_dir_all(&self.cache_root)
            .map_err(|e| Error::io(format!("creating {}", self.cache_root.display()), e))?;

        let mut index = 1;
        loop {
            let path = chunk_path(&self.archive_dir, index);
            if !path.exists() {
                break;
            }
            info!("extracting {}", path.display());
            self.extract_chunk(&path)?;
            index += 1;
        }
        Ok(())
    }

    fn extract_chunk(&self, chunk: &Path) -> Result<()> {
        let file = File::open(chunk)
            .map_err(|e| Error::io(format!("opening {}", chunk.display()), e))?;
        let mut archive = tar::Archive::new(file);
        let entries = archive.entries().map_err(|e| Error::Format {
            context: chunk.display().to_string(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            let mut entry = entry.map_err(|e| Error::Format {
                context: chunk.display().to_string(),
                reason: e.to_string(),
            })?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let entry_path = entry
                .path()
                .map_err(|e| Error::Format {
                    context: chunk.display().to_string(),
                    reason: e.to_string(),
                })?
                .into_owned();
            let name = entry_path.to_string_lossy().to_string();
            if name.contains("..") || name.starts_with('/') {
                return Err(Error::Format {
                    context: chunk.display().to_string(),
                    reason: format!("path traversal in entry '{}'", name),
                });
            }

            let target = if let Some(rest) = name
                .strip_prefix(WORKING_DIR)
                .and_then(|r| r.strip_prefix('/'))
            {
                self.working_dir.join(rest)
            } else if name.starts_with(REGISTRY_BLOB_PREFIX) {
                self.cache_root.join(&name)
            } else {
                // embedded config and anything unrecognized
                debug!("ignoring archive entry {}", name);
                continue;
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
            let mode = entry.header().mode().unwrap_or(0o644) | OWNER_RWX;
            let mut out = File::create(&target)
                .map_err(|e| Error::io(format!("creating {}", target.display()), e))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| Error::io(format!("writing {}", target.display()), e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
            }
            #[cfg(not(unix))]
            let _ = mode;
        }
        Ok(())
    }
}
