//! Security modules for IPC peer authentication.

pub mod peer_verify;
