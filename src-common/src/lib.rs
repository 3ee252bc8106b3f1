//! Sotto Common Library
//!
//! Shared types and IPC protocol for communication between the sotto CLI
//! and service components.

pub mod ipc;
pub mod logging;
pub mod security;
pub mod types;

pub use types::*;
