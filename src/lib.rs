//! Fleet control plane
//!
//! Coordination and protection layer for pushing scripts to groups of
//! devices: replay-safe request signing, fan-out/fan-in start tracking,
//! shared staged-file lifetimes and a change-aware script package cache.

pub mod auth;
pub mod config;
pub mod deploy;
pub mod error;
pub mod session;
