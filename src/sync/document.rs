//! Per-view document synchronization
//!
//! A [`DocumentSync`] ties one editor view to one server connection. Every
//! view over a buffer gets its own sync, but only the primary view (the lowest
//! live view id for that buffer) ever sends anything, so a shared buffer is
//! opened once, changed with one version sequence, and closed once.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::versions::VersionTable;
use crate::edits::EditApplier;
use crate::error::Result;
use crate::events::{NotificationLevel, SubscriptionGroup, UserNotification};
use crate::lsp::capabilities::{ChangeMode, SaveMode, SyncBehaviors};
use crate::lsp::connection::Connection;
use crate::lsp::protocol::{
    path_to_uri, DidChangeTextDocumentParams, FileChangeType, FileEvent, TextDocumentContentChangeEvent,
    TextDocumentItem, VersionedTextDocumentIdentifier, SAVE_REASON_MANUAL,
};
use crate::workspace::{
    range_length, BufferChangeEvent, BufferId, EditorView, PathChangeEvent, SaveEvent, TextBuffer, TextChange,
    ViewId, WillSaveHook, Workspace,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by every document sync attached to one server
pub struct SyncContext {
    pub connection: Arc<Connection>,
    pub behaviors: SyncBehaviors,
    pub versions: Arc<VersionTable>,
    pub workspace: Arc<Workspace>,
    pub notifications: broadcast::Sender<UserNotification>,
    pub will_save_timeout: Duration,
    /// When false, renames are also reported as watched-file delete + create
    pub host_reports_file_renames: bool,
    opened: Mutex<HashSet<PathBuf>>,
    attached: Mutex<HashMap<BufferId, BTreeSet<ViewId>>>,
}

impl SyncContext {
    pub fn new(
        connection: Arc<Connection>,
        behaviors: SyncBehaviors,
        versions: Arc<VersionTable>,
        workspace: Arc<Workspace>,
        notifications: broadcast::Sender<UserNotification>,
        will_save_timeout: Duration,
        host_reports_file_renames: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            behaviors,
            versions,
            workspace,
            notifications,
            will_save_timeout,
            host_reports_file_renames,
            opened: Mutex::new(HashSet::new()),
            attached: Mutex::new(HashMap::new()),
        })
    }

    /// Whether `path` has been opened on this server
    pub fn is_open(&self, path: &Path) -> bool {
        lock(&self.opened).contains(path)
    }

    pub fn open_documents(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.opened).iter().cloned().collect();
        paths.sort();
        paths
    }

    fn attach(&self, view: ViewId, buffer: BufferId) {
        lock(&self.attached).entry(buffer).or_default().insert(view);
    }

    /// Returns true when `view` was the last one attached for `buffer`
    fn detach(&self, view: ViewId, buffer: BufferId) -> bool {
        let mut attached = lock(&self.attached);
        let Some(views) = attached.get_mut(&buffer) else {
            return false;
        };
        views.remove(&view);
        if views.is_empty() {
            attached.remove(&buffer);
            return true;
        }
        false
    }

    fn notify_user(&self, notification: UserNotification) {
        // No receivers is fine
        let _ = self.notifications.send(notification);
    }
}

struct SyncHandle {
    view: ViewId,
    buffer_id: BufferId,
    buffer: Weak<TextBuffer>,
    context: Arc<SyncContext>,
}

impl SyncHandle {
    fn is_primary(&self) -> bool {
        self.context.workspace.primary_view_for_buffer(self.buffer_id) == Some(self.view)
    }

    /// The buffer's path, if the document is open on the server
    fn open_path(&self, buffer: &TextBuffer) -> Option<PathBuf> {
        let path = buffer.path()?;
        if self.context.behaviors.open_close && !self.context.is_open(&path) {
            return None;
        }
        Some(path)
    }

    fn open_if_needed(&self) -> Result<bool> {
        if !self.context.behaviors.open_close || !self.is_primary() {
            return Ok(false);
        }
        let Some(buffer) = self.buffer.upgrade() else {
            return Ok(false);
        };
        let Some(path) = buffer.path() else {
            return Ok(false);
        };
        if !lock(&self.context.opened).insert(path.clone()) {
            return Ok(false);
        }

        let version = self.context.versions.current(&path);
        debug!(server = %self.context.connection.label(), "didOpen {} v{}", path.display(), version);
        self.context.connection.did_open(TextDocumentItem {
            uri: path_to_uri(&path),
            language_id: buffer.language_id().unwrap_or_else(|| "plaintext".to_string()),
            version,
            text: buffer.text(),
        })?;
        Ok(true)
    }

    fn close_path(&self, path: &Path) -> Result<bool> {
        if !lock(&self.context.opened).remove(path) {
            return Ok(false);
        }
        debug!(server = %self.context.connection.label(), "didClose {}", path.display());
        self.context.connection.did_close(&path_to_uri(path))?;
        Ok(true)
    }

    fn send_changes(&self, path: &Path, content_changes: Vec<TextDocumentContentChangeEvent>) -> Result<()> {
        // Bumped before sending so a reader never sees a stale version
        let version = self.context.versions.increment(path);
        trace!("didChange {} v{} ({} changes)", path.display(), version, content_changes.len());
        self.context.connection.did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: path_to_uri(path),
                version,
            },
            content_changes,
        })
    }

    fn send_full_changes(&self) -> Result<bool> {
        if !self.is_primary() {
            return Ok(false);
        }
        let Some(buffer) = self.buffer.upgrade() else {
            return Ok(false);
        };
        let Some(path) = self.open_path(&buffer) else {
            return Ok(false);
        };

        self.send_changes(
            &path,
            vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: buffer.text(),
            }],
        )?;
        Ok(true)
    }

    fn send_incremental_changes(&self, changes: &[TextChange]) -> Result<bool> {
        if changes.is_empty() || !self.is_primary() {
            return Ok(false);
        }
        let Some(buffer) = self.buffer.upgrade() else {
            return Ok(false);
        };
        let Some(path) = self.open_path(&buffer) else {
            return Ok(false);
        };

        // Host order is top to bottom; servers apply them in sequence, bottom first
        let content_changes = changes
            .iter()
            .rev()
            .map(|change| TextDocumentContentChangeEvent {
                range: Some(change.old_range),
                range_length: Some(range_length(change)),
                text: change.new_text.clone(),
            })
            .collect();
        self.send_changes(&path, content_changes)?;
        Ok(true)
    }

    fn handle_change(&self, event: &BufferChangeEvent) {
        let result = match self.context.behaviors.change {
            ChangeMode::None => return,
            ChangeMode::Full => self.send_full_changes(),
            ChangeMode::Incremental => self.send_incremental_changes(&event.changes),
        };
        if let Err(e) = result {
            warn!("Failed to send didChange for {}: {}", self.view, e);
        }
    }

    fn handle_path_change(&self, event: &PathChangeEvent) {
        if !self.is_primary() {
            return;
        }
        if let Err(e) = self.rename(event.old_path.as_deref(), event.new_path.as_deref()) {
            warn!("Failed to report rename for {}: {}", self.view, e);
        }
    }

    fn rename(&self, old_path: Option<&Path>, new_path: Option<&Path>) -> Result<()> {
        if let Some(old_path) = old_path {
            self.close_path(old_path)?;
        }

        if let (Some(old_path), Some(new_path)) = (old_path, new_path) {
            self.context.versions.rename(old_path, new_path);
            if !self.context.host_reports_file_renames {
                self.context.connection.did_change_watched_files(vec![
                    FileEvent {
                        uri: path_to_uri(old_path),
                        kind: FileChangeType::Deleted,
                    },
                    FileEvent {
                        uri: path_to_uri(new_path),
                        kind: FileChangeType::Created,
                    },
                ])?;
            }
        }

        self.open_if_needed()?;
        Ok(())
    }

    fn handle_save(&self, event: &SaveEvent) {
        if !self.is_primary() {
            return;
        }
        if self.context.behaviors.open_close && !self.context.is_open(&event.path) {
            return;
        }

        let text = match (self.context.behaviors.save, self.buffer.upgrade()) {
            (SaveMode::NotifyWithText, Some(buffer)) => Some(buffer.text()),
            _ => None,
        };
        if let Err(e) = self.context.connection.did_save(&path_to_uri(&event.path), text) {
            warn!("Failed to send didSave for {}: {}", event.path.display(), e);
        }
    }
}

/// Runs the server's will-save handshake before a buffer is written
struct WillSaveForwarder {
    handle: Arc<SyncHandle>,
}

impl WillSaveForwarder {
    fn report_failure(&self, path: &Path, reason: String) {
        warn!("willSaveWaitUntil for {} failed: {}", path.display(), reason);
        self.handle.context.notify_user(
            UserNotification::new(
                NotificationLevel::Warning,
                format!("Saved {} without the language server's edits", path.display()),
            )
            .with_detail(reason),
        );
    }
}

#[async_trait]
impl WillSaveHook for WillSaveForwarder {
    async fn will_save(&self, buffer: &Arc<TextBuffer>) {
        let handle = &self.handle;
        if !handle.is_primary() {
            return;
        }
        let Some(path) = handle.open_path(buffer) else {
            return;
        };
        let uri = path_to_uri(&path);
        let mode = handle.context.behaviors.will_save;
        let connection = &handle.context.connection;

        if mode.notifies() {
            if let Err(e) = connection.will_save(&uri, SAVE_REASON_MANUAL) {
                warn!("Failed to send willSave for {}: {}", path.display(), e);
            }
        }

        if mode.waits() {
            match connection
                .will_save_wait_until(&uri, SAVE_REASON_MANUAL, handle.context.will_save_timeout)
                .await
            {
                Ok(edits) if edits.is_empty() => {}
                Ok(edits) => {
                    debug!("Applying {} edits before saving {}", edits.len(), path.display());
                    let outcome = EditApplier::apply_to_buffer(buffer, edits);
                    if !outcome.applied {
                        self.report_failure(&path, outcome.failure_reason.unwrap_or_default());
                    }
                }
                Err(e) => self.report_failure(&path, e.to_string()),
            }
        }
    }
}

/// Synchronization of one editor view with one server
pub struct DocumentSync {
    handle: Arc<SyncHandle>,
    subscriptions: SubscriptionGroup,
}

impl DocumentSync {
    /// Start observing `view` and open its document if this view is primary
    pub fn attach(view: &EditorView, context: Arc<SyncContext>) -> Self {
        let buffer = view.buffer();
        let behaviors = context.behaviors;
        context.attach(view.id(), buffer.id());

        let handle = Arc::new(SyncHandle {
            view: view.id(),
            buffer_id: buffer.id(),
            buffer: Arc::downgrade(buffer),
            context,
        });

        let mut subscriptions = SubscriptionGroup::new();
        if behaviors.change != ChangeMode::None {
            let h = Arc::clone(&handle);
            subscriptions.add(buffer.on_did_change(move |event| h.handle_change(event)));
        }
        let h = Arc::clone(&handle);
        subscriptions.add(buffer.on_did_change_path(move |event| h.handle_path_change(event)));
        if behaviors.save != SaveMode::Skip {
            let h = Arc::clone(&handle);
            subscriptions.add(buffer.on_did_save(move |event| h.handle_save(event)));
        }
        if behaviors.will_save.notifies() || behaviors.will_save.waits() {
            subscriptions.add(buffer.on_will_save(Arc::new(WillSaveForwarder {
                handle: Arc::clone(&handle),
            })));
        }

        if let Err(e) = handle.open_if_needed() {
            warn!("Failed to send didOpen for {}: {}", view.id(), e);
        }

        Self { handle, subscriptions }
    }

    pub fn view_id(&self) -> ViewId {
        self.handle.view
    }

    pub fn buffer_id(&self) -> BufferId {
        self.handle.buffer_id
    }

    /// Whether this view currently speaks for its buffer
    pub fn is_primary(&self) -> bool {
        self.handle.is_primary()
    }

    /// Send the whole text as one change; returns false when nothing was sent
    pub fn send_full_changes(&self) -> Result<bool> {
        self.handle.send_full_changes()
    }

    /// Send host changes, given top to bottom; returns false when nothing was sent
    pub fn send_incremental_changes(&self, changes: &[TextChange]) -> Result<bool> {
        self.handle.send_incremental_changes(changes)
    }

    /// Stop observing the view, closing the document if no other view holds it
    pub fn detach(mut self) {
        self.subscriptions.dispose();
        let handle = &self.handle;
        if !handle.context.detach(handle.view, handle.buffer_id) {
            return;
        }

        let path = handle.buffer.upgrade().and_then(|buffer| buffer.path());
        if let Some(path) = path {
            if let Err(e) = handle.close_path(&path) {
                debug!("Failed to send didClose for {}: {}", path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for DocumentSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSync")
            .field("view", &self.handle.view)
            .field("buffer", &self.handle.buffer_id)
            .finish()
    }
}
