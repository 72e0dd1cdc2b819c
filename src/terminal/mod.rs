//! Interactive terminal sessions
//!
//! Shells run in pseudo-terminals; output is fanned out to any number of stream
//! subscribers, and sessions nobody touches for a while are closed.

pub mod manager;
pub mod registry;
pub mod session;

pub use manager::{TerminalManager, TerminalStream};
pub use registry::IdleRegistry;
pub use session::{TerminalEvent, TerminalSession};
