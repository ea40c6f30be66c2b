//! Document synchronization with language servers

mod document;
mod versions;

pub use document::{DocumentSync, SyncContext};
pub use versions::VersionTable;
