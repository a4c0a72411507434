//! Error types for the deployment path

use fleet_shared::codec::CodecError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors building a script package
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("script path is a directory: {0}")]
    NotAFile(PathBuf),
}

impl PackageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors starting a deployment
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("deployment id is required")]
    MissingDeploymentId,

    #[error("no target devices")]
    NoTargets,

    #[error("invalid script name: {0}")]
    InvalidScriptName(String),

    #[error("device {0} already has a script start in flight")]
    Busy(String),

    #[error("staged file is outside the temp area: {0}")]
    NotStaged(PathBuf),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("failed to encode script push: {0}")]
    Encode(#[from] CodecError),
}
