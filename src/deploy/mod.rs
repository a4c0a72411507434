//! Script deployment to groups of devices
//!
//! This module handles:
//! - Fan-out/fan-in tracking of multi-device script starts
//! - Reference counting of staged files shared between transfers
//! - Caching of encoded script packages
//! - Resolving script names inside the scripts directory
//! - The push-then-start workflow tying them together

mod launcher;
mod package_cache;
mod pending;
mod script_source;
mod temp_ref;

pub use launcher::{DeployReport, DeployRequest, PeerDirectory, ScriptLauncher, StagedArtifact};
pub use package_cache::{ScriptFile, ScriptPackageCache, LARGE_FILE_THRESHOLD, SCRIPT_TARGET_ROOT};
pub use pending::{Completion, PendingStartCoordinator, ReadyStart, StartOutcome};
pub use script_source::{resolve_script, ScriptSource};
pub use temp_ref::{is_staged_path, SharedTempRefs, TEMP_DIR_NAME};
