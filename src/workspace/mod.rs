//! Host-side document model
//!
//! The workspace tracks open buffers and the editor views showing them. Several
//! views may share one buffer; view ids are stable and only ever increase.

mod buffer;

pub use buffer::{
    offset_at, range_length, BufferChangeEvent, BufferId, CheckpointId, PathChangeEvent, SaveEvent, TextBuffer,
    TextChange, WillSaveHook,
};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::Result;
use crate::lsp::root::normalize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// One editor showing a buffer
#[derive(Debug)]
pub struct EditorView {
    id: ViewId,
    buffer: Arc<TextBuffer>,
}

impl EditorView {
    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn buffer(&self) -> &Arc<TextBuffer> {
        &self.buffer
    }
}

#[derive(Default)]
struct WorkspaceState {
    views: BTreeMap<ViewId, Arc<EditorView>>,
    buffers: HashMap<BufferId, Weak<TextBuffer>>,
    // Buffers kept alive without a view, e.g. files edited by a server
    retained: BTreeMap<BufferId, Arc<TextBuffer>>,
}

pub struct Workspace {
    root: PathBuf,
    next_buffer: AtomicU64,
    next_view: AtomicU64,
    state: Mutex<WorkspaceState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Map a file extension to its LSP language identifier
pub fn extension_to_language_id(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "rs" => Some("rust"),
        "go" => Some("go"),
        "ts" | "mts" | "cts" => Some("typescript"),
        "tsx" => Some("typescriptreact"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "jsx" => Some("javascriptreact"),
        "py" | "pyi" => Some("python"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" => Some("cpp"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "lua" => Some("lua"),
        "sh" | "bash" => Some("shellscript"),
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "toml" => Some("toml"),
        "md" => Some("markdown"),
        _ => None,
    }
}

pub fn language_for_path(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(extension_to_language_id)
        .map(str::to_string)
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            root: normalize_path(root.as_ref()),
            next_buffer: AtomicU64::new(1),
            next_view: AtomicU64::new(1),
            state: Mutex::new(WorkspaceState::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a buffer that is not backed by disk (yet)
    pub fn create_buffer(&self, text: &str, path: Option<PathBuf>, language_id: Option<String>) -> Arc<TextBuffer> {
        self.insert_buffer(text, path.map(|path| normalize_path(&path)), language_id)
    }

    fn insert_buffer(&self, text: &str, path: Option<PathBuf>, language_id: Option<String>) -> Arc<TextBuffer> {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::SeqCst));
        let buffer = Arc::new(TextBuffer::new(id, text, path, language_id));
        lock(&self.state).buffers.insert(id, Arc::downgrade(&buffer));
        buffer
    }

    /// The live buffer for `path`, if one exists
    pub fn buffer_for_path(&self, path: &Path) -> Option<Arc<TextBuffer>> {
        let path = normalize_path(path);
        let mut state = lock(&self.state);
        state.buffers.retain(|_, buffer| buffer.strong_count() > 0);
        state
            .buffers
            .values()
            .filter_map(Weak::upgrade)
            .find(|buffer| buffer.path().as_deref() == Some(path.as_path()))
    }

    /// Reuse the live buffer for `path` or load it from disk
    pub async fn open_buffer(&self, path: &Path) -> Result<Arc<TextBuffer>> {
        if let Some(buffer) = self.buffer_for_path(path) {
            return Ok(buffer);
        }

        let path = normalize_path(path);
        let text = tokio::fs::read_to_string(&path).await?;

        // Another caller may have loaded it while we were reading
        if let Some(buffer) = self.buffer_for_path(&path) {
            return Ok(buffer);
        }
        let language_id = language_for_path(&path);
        Ok(self.insert_buffer(&text, Some(path), language_id))
    }

    /// Keep a buffer alive until [`Workspace::release_buffer`] is called
    pub fn retain_buffer(&self, buffer: &Arc<TextBuffer>) {
        let mut state = lock(&self.state);
        state.buffers.insert(buffer.id(), Arc::downgrade(buffer));
        state.retained.insert(buffer.id(), Arc::clone(buffer));
    }

    /// Drop the workspace's own reference; returns whether one was held
    pub fn release_buffer(&self, id: BufferId) -> bool {
        lock(&self.state).retained.remove(&id).is_some()
    }

    /// Buffers held by the workspace rather than by a view, oldest first
    pub fn retained_buffers(&self) -> Vec<Arc<TextBuffer>> {
        lock(&self.state).retained.values().cloned().collect()
    }

    pub fn open_view(&self, buffer: &Arc<TextBuffer>) -> Arc<EditorView> {
        let id = ViewId(self.next_view.fetch_add(1, Ordering::SeqCst));
        let view = Arc::new(EditorView {
            id,
            buffer: Arc::clone(buffer),
        });

        let mut state = lock(&self.state);
        state.buffers.insert(buffer.id(), Arc::downgrade(buffer));
        state.views.insert(id, Arc::clone(&view));
        view
    }

    /// Remove a view; the buffer lives on while anything else holds it
    pub fn close_view(&self, id: ViewId) -> Option<Arc<EditorView>> {
        lock(&self.state).views.remove(&id)
    }

    pub fn view(&self, id: ViewId) -> Option<Arc<EditorView>> {
        lock(&self.state).views.get(&id).cloned()
    }

    pub fn views(&self) -> Vec<Arc<EditorView>> {
        lock(&self.state).views.values().cloned().collect()
    }

    /// Ids of the open views over a buffer, smallest first
    pub fn views_for_buffer(&self, buffer: BufferId) -> Vec<ViewId> {
        lock(&self.state)
            .views
            .values()
            .filter(|view| view.buffer.id() == buffer)
            .map(|view| view.id)
            .collect()
    }

    /// The view responsible for notifications about a buffer
    pub fn primary_view_for_buffer(&self, buffer: BufferId) -> Option<ViewId> {
        self.views_for_buffer(buffer).into_iter().next()
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace").field("root", &self.root).finish()
    }
}
