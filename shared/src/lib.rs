//! Fleet Control Shared Wire Types
//!
//! This crate provides the channel message type, frame codec and request
//! signing primitives used between the control server, devices and
//! controller consoles.

pub mod codec;
pub mod signing;

mod message;

use std::time::{SystemTime, UNIX_EPOCH};

pub use message::Message;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get current timestamp in whole seconds since Unix epoch
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Authentication parameters shared by every signed channel
pub mod auth {
    /// Accepted clock skew between signer and verifier, in seconds
    pub const SKEW_SECS: i64 = 60;

    /// How long a consumed nonce blocks reuse, in seconds
    pub const NONCE_TTL_SECS: i64 = 120;

    /// Interval of the background sweep over consumed nonces, in seconds
    pub const NONCE_SWEEP_INTERVAL_SECS: u64 = 30;

    /// Query keys that carry the signature itself and never take part in it
    pub const QUERY_TS_KEY: &str = "ts";
    pub const QUERY_NONCE_KEY: &str = "nonce";
    pub const QUERY_SIGN_KEY: &str = "sign";

    /// Nonce namespace for HTTP requests
    pub const HTTP_NAMESPACE: &str = "http";

    /// Nonce namespace for persistent-channel messages
    pub const CHANNEL_NAMESPACE: &str = "ws";
}

/// Message type identifiers
pub mod msg_type {
    /// First message on every connection; identifies the peer
    pub const HELLO: &str = "app/hello";

    /// Server -> device: stage the files of a script package
    pub const SCRIPT_PUSH: &str = "script/push";

    /// Device -> server: outcome of a `script/push`
    pub const SCRIPT_PUSH_REPORT: &str = "script/push/report";

    /// Server -> device: start the staged script
    pub const SCRIPT_RUN: &str = "script/run";

    /// Controller -> server: push a script to a set of devices and start it
    pub const SCRIPT_DEPLOY: &str = "script/deploy";

    /// Server -> controllers: human-readable status line about a device
    pub const DEVICE_MESSAGE: &str = "device/message";

    /// Server -> peer: the previous message was refused
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_helpers_agree() {
        let secs = now_secs();
        let ms = now_ms();
        assert!(secs > 0);
        assert!((ms / 1000) as i64 - secs <= 1);
    }
}
