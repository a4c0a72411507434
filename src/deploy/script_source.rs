//! Resolving controller-supplied script names under the scripts directory

use crate::error::{LaunchError, PackageError};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// A script located on disk and how it is laid out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub path: PathBuf,
    /// `/`-separated name relative to the scripts directory
    pub display_name: String,
    pub is_dir: bool,
    /// Directory already laid out as `lua/scripts/...`
    pub piled: bool,
    /// Name passed to `script/run`
    pub run_name: String,
}

/// Resolve `raw_name` under `scripts_dir`, refusing anything that escapes it
pub async fn resolve_script(scripts_dir: &Path, raw_name: &str) -> Result<ScriptSource, LaunchError> {
    let display_name = sanitize_name(raw_name)?;
    let path = scripts_dir.join(&display_name);

    let metadata = fs::metadata(&path)
        .await
        .map_err(|e| PackageError::io(&path, e))?;
    let is_dir = metadata.is_dir();
    let piled = is_dir && exists(&path.join("lua").join("scripts")).await;

    let run_name = if piled {
        if exists(&path.join("lua").join("scripts").join("main.lua")).await {
            "main.lua".to_string()
        } else {
            "main.xxt".to_string()
        }
    } else {
        display_name.clone()
    };

    Ok(ScriptSource {
        path,
        display_name,
        is_dir,
        piled,
        run_name,
    })
}

fn sanitize_name(raw_name: &str) -> Result<String, LaunchError> {
    let invalid = || LaunchError::InvalidScriptName(raw_name.to_string());

    let name = raw_name.trim().replace('\\', "/");
    let name = name.trim_end_matches('/');
    if name.is_empty() || name.starts_with('/') {
        return Err(invalid());
    }
    // Drive-absolute paths such as `C:/...`
    if name.as_bytes().get(1) == Some(&b':') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}
