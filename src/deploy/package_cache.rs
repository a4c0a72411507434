//! Change-aware cache of encoded script packages
//!
//! A package is the ordered list of files pushed to a device for one script.
//! Building it means reading and base64-encoding every file, so the result is
//! cached per script and reused while the on-disk fingerprint (relative path,
//! size and mtime of every file) is unchanged.
//!
//! The walk and the file reads run outside the cache lock. The fingerprint is
//! taken from the same listing the package is built from and stored together
//! with it in one insert, so a stored pair always belongs together; a file
//! that changes mid-build just causes another rebuild on the next call.

use crate::error::PackageError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Files at or above this size are not inlined and travel as staged transfers
pub const LARGE_FILE_THRESHOLD: u64 = 128 * 1024;

/// Device-side directory scripts are installed under
pub const SCRIPT_TARGET_ROOT: &str = "lua/scripts";

const CACHE_MAX_ENTRIES: usize = 64;
const CACHE_TRIM_TO: usize = 48;

/// One file of a script package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    /// Target path on the device, `/`-separated
    pub name: String,
    /// Where the file was read from
    pub source_path: PathBuf,
    /// Base64 content; `None` for large files
    pub data: Option<String>,
    pub size: u64,
    /// The package's `main.json` manifest
    pub is_main_json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PackageKey {
    root: PathBuf,
    display_name: String,
    is_dir: bool,
    piled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceFile {
    path: PathBuf,
    /// `/`-separated path below the script root; empty for a single file
    relative: String,
    size: u64,
    modified_ns: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(Vec<(String, u64, u128)>);

impl Fingerprint {
    fn of(listing: &[SourceFile]) -> Self {
        Self(
            listing
                .iter()
                .map(|f| (f.relative.clone(), f.size, f.modified_ns))
                .collect(),
        )
    }
}

struct CachedPackage {
    fingerprint: Fingerprint,
    files: Vec<ScriptFile>,
}

/// Caches encoded script packages keyed by script path and layout
pub struct ScriptPackageCache {
    entries: RwLock<HashMap<PackageKey, CachedPackage>>,
    large_file_threshold: u64,
}

impl ScriptPackageCache {
    pub fn new() -> Self {
        Self::with_large_file_threshold(LARGE_FILE_THRESHOLD)
    }

    pub fn with_large_file_threshold(large_file_threshold: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            large_file_threshold,
        }
    }

    /// Return the package for a script, rebuilding it if anything on disk changed
    ///
    /// `piled` packages are already laid out relative to the device root;
    /// other directories are installed under `lua/scripts/<display_name>/`.
    pub async fn collect(
        &self,
        root: &Path,
        display_name: &str,
        is_dir: bool,
        piled: bool,
    ) -> Result<Vec<ScriptFile>, PackageError> {
        let listing = list_sources(root, is_dir).await?;
        let fingerprint = Fingerprint::of(&listing);
        let key = PackageKey {
            root: root.to_path_buf(),
            display_name: display_name.to_string(),
            is_dir,
            piled,
        };

        if let Some(cached) = self.entries.read().await.get(&key) {
            if cached.fingerprint == fingerprint {
                debug!("Script package cache hit: {}", root.display());
                return Ok(cached.files.clone());
            }
        }

        let files = self.build(&listing, display_name, is_dir, piled).await?;
        debug!(
            "Rebuilt script package {} ({} files)",
            root.display(),
            files.len()
        );

        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() + 1 >= CACHE_MAX_ENTRIES {
            let excess = entries.len() + 1 - CACHE_TRIM_TO;
            let victims: Vec<PackageKey> = entries.keys().take(excess).cloned().collect();
            for victim in victims {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key,
            CachedPackage {
                fingerprint,
                files: files.clone(),
            },
        );

        Ok(files)
    }

    /// Number of cached packages
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn build(
        &self,
        listing: &[SourceFile],
        display_name: &str,
        is_dir: bool,
        piled: bool,
    ) -> Result<Vec<ScriptFile>, PackageError> {
        let mut files = Vec::with_capacity(listing.len());
        for source in listing {
            let name = target_name(display_name, &source.relative, is_dir, piled);
            let data = if source.size < self.large_file_threshold {
                let content = fs::read(&source.path)
                    .await
                    .map_err(|e| PackageError::io(&source.path, e))?;
                Some(BASE64.encode(content))
            } else {
                None
            };
            files.push(ScriptFile {
                is_main_json: is_main_json(&name),
                name,
                source_path: source.path.clone(),
                data,
                size: source.size,
            });
        }
        Ok(files)
    }
}

impl Default for ScriptPackageCache {
    fn default() -> Self {
        Self::new()
    }
}

fn target_name(display_name: &str, relative: &str, is_dir: bool, piled: bool) -> String {
    let display_name = normalize_separators(display_name);
    match (is_dir, piled) {
        (false, _) => format!("{SCRIPT_TARGET_ROOT}/{display_name}"),
        (true, true) => relative.to_string(),
        (true, false) => format!("{SCRIPT_TARGET_ROOT}/{display_name}/{relative}"),
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

fn is_main_json(name: &str) -> bool {
    name == "lua/scripts/main.json" || name.ends_with("/main.json")
}

fn modified_ns(metadata: &std::fs::Metadata) -> u128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// List the files making up a script, in deterministic order
///
/// Directories are walked depth-first with entries sorted by name. Directory
/// symlinks are skipped; file symlinks are followed.
async fn list_sources(root: &Path, is_dir: bool) -> Result<Vec<SourceFile>, PackageError> {
    let metadata = fs::metadata(root)
        .await
        .map_err(|e| PackageError::io(root, e))?;

    if !is_dir {
        if metadata.is_dir() {
            return Err(PackageError::NotAFile(root.to_path_buf()));
        }
        return Ok(vec![SourceFile {
            path: root.to_path_buf(),
            relative: String::new(),
            size: metadata.len(),
            modified_ns: modified_ns(&metadata),
        }]);
    }
    if !metadata.is_dir() {
        return Err(PackageError::NotADirectory(root.to_path_buf()));
    }

    let mut listing = Vec::new();
    // Pending paths, reversed so the smallest name is popped first
    let mut stack = sorted_children(root).await?;
    stack.reverse();

    while let Some(path) = stack.pop() {
        let link_meta = fs::symlink_metadata(&path)
            .await
            .map_err(|e| PackageError::io(&path, e))?;

        let metadata = if link_meta.file_type().is_symlink() {
            let resolved = fs::metadata(&path)
                .await
                .map_err(|e| PackageError::io(&path, e))?;
            if resolved.is_dir() {
                continue;
            }
            resolved
        } else if link_meta.is_dir() {
            let mut children = sorted_children(&path).await?;
            children.reverse();
            stack.extend(children);
            continue;
        } else {
            link_meta
        };

        let relative = path
            .strip_prefix(root)
            .map(|p| normalize_separators(&p.to_string_lossy()))
            .unwrap_or_default();
        listing.push(SourceFile {
            relative,
            size: metadata.len(),
            modified_ns: modified_ns(&metadata),
            path,
        });
    }

    Ok(listing)
}

async fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut reader = fs::read_dir(dir)
        .await
        .map_err(|e| PackageError::io(dir, e))?;
    let mut children = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| PackageError::io(dir, e))?
    {
        children.push(entry.path());
    }
    children.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(children)
}
