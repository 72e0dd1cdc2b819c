//! Proxy gate
//!
//! The HTTP front door: serves its own health/control/terminal endpoints and forwards
//! everything else under the mount to the backend, gating while it is not ready.

pub mod cors;
pub mod gate;
pub mod internal;
pub mod log_buffer;
pub mod models_metadata;
pub mod proxy;
pub mod server;
pub mod terminal_api;
pub mod websocket;

pub use log_buffer::{get_global_log_buffer, initialize_global_log_buffer, LogBuffer, LogBufferLayer, LogEntry};
pub use cors::cors_headers;
pub use server::{configure_app, GateContext, GateServer};
