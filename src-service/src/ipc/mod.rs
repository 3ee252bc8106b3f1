//! IPC server, session registry, and request handlers.

pub mod handlers;
pub mod registry;
pub mod server;

pub use server::run_server;
