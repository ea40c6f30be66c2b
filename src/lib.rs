// Library exports for langbridge
// This allows the modules to be imported in tests and by host editors

pub mod config;
pub mod edits;
pub mod error;
pub mod events;
pub mod lsp;
pub mod manager;
pub mod sync;
pub mod workspace;

pub use error::{BridgeError, Result};
pub use manager::{ServerManager, ServerRecord};
