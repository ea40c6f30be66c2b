//! Project root resolution
//!
//! Maps a document path to the project root whose server owns it.

use std::path::{Component, Path, PathBuf};

/// Strategy deciding which project a document belongs to
pub trait ProjectRootResolver: Send + Sync {
    fn resolve(&self, document: &Path) -> PathBuf;
}

/// Nearest ancestor containing a marker file, falling back to the workspace root
pub struct MarkerRootResolver {
    markers: Vec<String>,
    workspace_root: PathBuf,
}

impl MarkerRootResolver {
    pub fn new(markers: Vec<String>, workspace_root: impl AsRef<Path>) -> Self {
        Self {
            markers,
            workspace_root: normalize_path(workspace_root.as_ref()),
        }
    }
}

impl ProjectRootResolver for MarkerRootResolver {
    fn resolve(&self, document: &Path) -> PathBuf {
        let document = normalize_path(document);
        let inside_workspace = document.starts_with(&self.workspace_root);

        for dir in document.ancestors().skip(1) {
            if self.markers.iter().any(|marker| dir.join(marker).exists()) {
                return dir.to_path_buf();
            }
            if inside_workspace && dir == self.workspace_root {
                break;
            }
        }

        if inside_workspace {
            return self.workspace_root.clone();
        }

        document
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.workspace_root.clone())
    }
}

/// Canonical form of a path used as a project identity key
///
/// Existing paths are canonicalized; otherwise `.` and `..` are folded
/// lexically so the same root is never keyed two ways.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
