//! Session management for connected devices and controllers
//!
//! This module handles:
//! - Tracking every identified peer session by id
//! - Framed message reads and queued writes per connection
//! - Routing messages to one device or to every controller

mod connection;
mod manager;

pub use connection::{PeerRole, PeerSession, SessionHandle};
pub use manager::SessionManager;
