//! Server configuration

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration for the control server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the peer listener binds to
    pub listen_addr: String,
    /// Shared signing secret
    pub secret: String,
    /// Directory script names are resolved against
    pub scripts_dir: PathBuf,
    /// Delay before an unreferenced staged file is deleted
    pub temp_grace: Duration,
    /// How long a script start may wait for its targets; zero disables the timer
    pub start_wait: Duration,
    /// Log signature mismatch details (never enable in production)
    pub auth_debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:46980".into(),
            secret: String::new(),
            scripts_dir: PathBuf::from("scripts"),
            temp_grace: Duration::from_secs(10),
            start_wait: Duration::from_secs(6 * 60),
            auth_debug: false,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from `FLEET_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("FLEET_LISTEN").filter(|v| !v.trim().is_empty()) {
            config.listen_addr = addr.trim().to_string();
        }
        if let Some(secret) = lookup("FLEET_SECRET") {
            config.secret = secret;
        }
        if let Some(dir) = lookup("FLEET_SCRIPTS_DIR").filter(|v| !v.trim().is_empty()) {
            config.scripts_dir = PathBuf::from(dir.trim());
        }
        if let Some(ms) = parse_u64(&lookup, "FLEET_TEMP_GRACE_MS") {
            config.temp_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "FLEET_START_WAIT_SECS") {
            config.start_wait = Duration::from_secs(secs);
        }
        config.auth_debug =
            env_flag(lookup("FLEET_DEBUG").as_deref()) || env_flag(lookup("FLEET_AUTH_DEBUG").as_deref());

        config
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a non-negative integer", key, raw);
            None
        }
    }
}

/// Interpret a debug switch: boolean words are honored, any other non-empty value enables
pub fn env_flag(value: Option<&str>) -> bool {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return false;
    };
    match value.to_ascii_lowercase().as_str() {
        "0" | "f" | "false" | "no" | "off" => false,
        _ => true,
    }
}
