//! Request and message authentication
//!
//! This module handles:
//! - Timestamp freshness and HMAC signature checks
//! - Canonical request paths immune to query reordering
//! - Per-channel nonce replay protection with a background sweep

mod canonical;
mod nonce;
mod signature;

pub use canonical::canonical_path;
pub use nonce::{NonceLedger, NonceSweeper};
pub use signature::SignatureAuthenticator;
