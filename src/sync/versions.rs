//! Document version table
//!
//! One counter per file path, shared by every document sync regardless of
//! which view or server it serves, so views over the same buffer never send
//! diverging versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct VersionTable {
    versions: Mutex<HashMap<PathBuf, i32>>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, i32>> {
        self.versions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current version, starting a new document at 1
    pub fn current(&self, path: &Path) -> i32 {
        *self.lock().entry(path.to_path_buf()).or_insert(1)
    }

    /// Bump and return the version to send with the next change
    pub fn increment(&self, path: &Path) -> i32 {
        let mut versions = self.lock();
        let version = versions.entry(path.to_path_buf()).or_insert(1);
        *version += 1;
        *version
    }

    /// Carry a document's counter over to its new path
    pub fn rename(&self, old: &Path, new: &Path) {
        let mut versions = self.lock();
        if let Some(version) = versions.remove(old) {
            let entry = versions.entry(new.to_path_buf()).or_insert(version);
            *entry = (*entry).max(version);
        }
    }

    pub fn get(&self, path: &Path) -> Option<i32> {
        self.lock().get(path).copied()
    }
}
