//! Text buffers
//!
//! A [`TextBuffer`] is the unit of document state shared by every editor view
//! showing it. Positions use LSP coordinates: 0-based lines and UTF-16 code
//! unit columns. A position past the end of its line, or inside a surrogate
//! pair, is invalid and is never clipped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BridgeError, Result};
use crate::events::{Emitter, Subscription};
use crate::lsp::protocol::{Position, Range, TextEdit};
use crate::lsp::root::normalize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Marker for grouped undo and rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointId(u64);

/// One replacement reported by a change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    /// Replaced range, in the coordinates of the text before the event
    pub old_range: Range,
    pub old_text: String,
    pub new_text: String,
}

/// Changes produced by one host operation, ordered top to bottom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferChangeEvent {
    pub changes: Vec<TextChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChangeEvent {
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEvent {
    pub path: PathBuf,
}

/// Runs before a buffer is written to disk and may edit it
#[async_trait]
pub trait WillSaveHook: Send + Sync {
    async fn will_save(&self, buffer: &Arc<TextBuffer>);
}

#[derive(Debug, Clone)]
struct Primitive {
    old_range: Range,
    new_range: Range,
    old_text: String,
    new_text: String,
}

struct BufferState {
    text: String,
    path: Option<PathBuf>,
    language_id: Option<String>,
    undo_groups: Vec<Vec<Primitive>>,
    checkpoints: HashMap<u64, usize>,
}

pub struct TextBuffer {
    id: BufferId,
    state: Mutex<BufferState>,
    next_checkpoint: AtomicU64,
    next_hook: AtomicU64,
    will_save_hooks: Arc<Mutex<Vec<(u64, Arc<dyn WillSaveHook>)>>>,
    did_change: Emitter<BufferChangeEvent>,
    did_change_path: Emitter<PathChangeEvent>,
    did_save: Emitter<SaveEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Byte offset of an LSP position, if the position exists in `text`
pub fn offset_at(text: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        line_start += text[line_start..].find('\n')? + 1;
    }

    let line_end = text[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(text.len());

    let mut units = 0u32;
    for (index, ch) in text[line_start..line_end].char_indices() {
        if units == position.character {
            return Some(line_start + index);
        }
        units += ch.len_utf16() as u32;
        if units > position.character {
            return None;
        }
    }

    (units == position.character).then_some(line_end)
}

/// LSP position reached after walking `text` from `start`
fn advance(start: Position, text: &str) -> Position {
    let mut position = start;
    for ch in text.chars() {
        if ch == '\n' {
            position.line += 1;
            position.character = 0;
        } else {
            position.character += ch.len_utf16() as u32;
        }
    }
    position
}

fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

impl BufferState {
    fn byte_range(&self, range: Range) -> Result<std::ops::Range<usize>> {
        let start = offset_at(&self.text, range.start);
        let end = offset_at(&self.text, range.end);
        match (start, end) {
            (Some(start), Some(end)) if start <= end => Ok(start..end),
            _ => Err(BridgeError::InvalidEdit(format!(
                "range {}:{}-{}:{} is outside the buffer",
                range.start.line, range.start.character, range.end.line, range.end.character
            ))),
        }
    }

    fn replace(&mut self, range: Range, new_text: &str) -> Result<Primitive> {
        let bytes = self.byte_range(range)?;
        let old_text = self.text[bytes.clone()].to_string();
        self.text.replace_range(bytes, new_text);

        Ok(Primitive {
            old_range: range,
            new_range: Range::new(range.start, advance(range.start, new_text)),
            old_text,
            new_text: new_text.to_string(),
        })
    }

    fn undo_primitive(&mut self, primitive: &Primitive) -> Result<TextChange> {
        self.replace(primitive.new_range, &primitive.old_text)?;
        Ok(TextChange {
            old_range: primitive.new_range,
            old_text: primitive.new_text.clone(),
            new_text: primitive.old_text.clone(),
        })
    }
}

impl TextBuffer {
    pub fn new(id: BufferId, text: impl Into<String>, path: Option<PathBuf>, language_id: Option<String>) -> Self {
        Self {
            id,
            state: Mutex::new(BufferState {
                text: text.into(),
                path,
                language_id,
                undo_groups: Vec::new(),
                checkpoints: HashMap::new(),
            }),
            next_checkpoint: AtomicU64::new(1),
            next_hook: AtomicU64::new(1),
            will_save_hooks: Arc::new(Mutex::new(Vec::new())),
            did_change: Emitter::new(),
            did_change_path: Emitter::new(),
            did_save: Emitter::new(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn text(&self) -> String {
        lock(&self.state).text.clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        lock(&self.state).path.clone()
    }

    pub fn language_id(&self) -> Option<String> {
        lock(&self.state).language_id.clone()
    }

    pub fn set_language_id(&self, language_id: Option<String>) {
        lock(&self.state).language_id = language_id;
    }

    pub fn line_count(&self) -> u32 {
        lock(&self.state).text.split('\n').count() as u32
    }

    pub fn is_valid_position(&self, position: Position) -> bool {
        offset_at(&lock(&self.state).text, position).is_some()
    }

    pub fn text_in_range(&self, range: Range) -> Result<String> {
        let state = lock(&self.state);
        let bytes = state.byte_range(range)?;
        Ok(state.text[bytes].to_string())
    }

    /// Replace one range, emitting a single change
    pub fn set_text_in_range(&self, range: Range, new_text: &str) -> Result<Range> {
        let (primitive, change) = {
            let mut state = lock(&self.state);
            let primitive = state.replace(range, new_text)?;
            state.undo_groups.push(vec![primitive.clone()]);
            let change = TextChange {
                old_range: primitive.old_range,
                old_text: primitive.old_text.clone(),
                new_text: primitive.new_text.clone(),
            };
            (primitive, change)
        };

        self.did_change.emit(&BufferChangeEvent {
            changes: vec![change],
        });
        Ok(primitive.new_range)
    }

    /// Apply several non-overlapping edits as one operation
    ///
    /// The edits are applied bottom to top and reported top to bottom in one
    /// change event. Nothing is applied if any range is invalid or overlaps
    /// another.
    pub fn edit(&self, edits: Vec<TextEdit>) -> Result<()> {
        let mut edits = edits;
        edits.sort_by(|a, b| b.range.cmp(&a.range));

        let changes = {
            let mut state = lock(&self.state);
            for (index, edit) in edits.iter().enumerate() {
                state.byte_range(edit.range)?;
                if index > 0 && edit.range.end > edits[index - 1].range.start {
                    return Err(BridgeError::InvalidEdit("overlapping edit ranges".to_string()));
                }
            }

            let mut primitives = Vec::with_capacity(edits.len());
            for edit in &edits {
                primitives.push(state.replace(edit.range, &edit.new_text)?);
            }

            let changes: Vec<TextChange> = primitives
                .iter()
                .rev()
                .map(|p| TextChange {
                    old_range: p.old_range,
                    old_text: p.old_text.clone(),
                    new_text: p.new_text.clone(),
                })
                .collect();
            state.undo_groups.push(primitives);
            changes
        };

        if !changes.is_empty() {
            self.did_change.emit(&BufferChangeEvent { changes });
        }
        Ok(())
    }

    /// Replace the whole text
    pub fn set_text(&self, text: &str) -> Result<()> {
        let end = {
            let state = lock(&self.state);
            advance(Position::default(), &state.text)
        };
        self.set_text_in_range(Range::new(Position::default(), end), text)
            .map(|_| ())
    }

    pub fn create_checkpoint(&self) -> CheckpointId {
        let id = self.next_checkpoint.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        let depth = state.undo_groups.len();
        state.checkpoints.insert(id, depth);
        CheckpointId(id)
    }

    /// Merge every change since the checkpoint into one undo step
    pub fn group_changes_since_checkpoint(&self, checkpoint: CheckpointId) -> bool {
        let mut state = lock(&self.state);
        let Some(depth) = state.checkpoints.get(&checkpoint.0).copied() else {
            return false;
        };
        if depth > state.undo_groups.len() {
            return false;
        }

        let merged: Vec<Primitive> = state.undo_groups.drain(depth..).flatten().collect();
        if !merged.is_empty() {
            state.undo_groups.push(merged);
        }
        state.checkpoints.retain(|_, d| *d <= depth);
        true
    }

    /// Undo every change made since the checkpoint
    pub fn revert_to_checkpoint(&self, checkpoint: CheckpointId) -> bool {
        let (reverted, changes) = {
            let mut state = lock(&self.state);
            let Some(depth) = state.checkpoints.remove(&checkpoint.0) else {
                return false;
            };
            if depth > state.undo_groups.len() {
                return false;
            }

            let groups: Vec<Vec<Primitive>> = state.undo_groups.drain(depth..).collect();
            let mut changes = Vec::new();
            let mut ok = true;
            for primitive in groups.iter().rev().flat_map(|group| group.iter().rev()) {
                match state.undo_primitive(primitive) {
                    Ok(change) => changes.push(change),
                    Err(_) => ok = false,
                }
            }
            state.checkpoints.retain(|_, d| *d <= depth);
            (ok, changes)
        };

        for change in changes {
            self.did_change.emit(&BufferChangeEvent {
                changes: vec![change],
            });
        }
        reverted
    }

    /// Undo the most recent undo step
    pub fn undo(&self) -> bool {
        let changes = {
            let mut state = lock(&self.state);
            let Some(group) = state.undo_groups.pop() else {
                return false;
            };
            let depth = state.undo_groups.len();
            state.checkpoints.retain(|_, d| *d <= depth);

            let mut changes = Vec::new();
            for primitive in group.iter().rev() {
                if let Ok(change) = state.undo_primitive(primitive) {
                    changes.push(change);
                }
            }
            changes
        };

        for change in changes {
            self.did_change.emit(&BufferChangeEvent {
                changes: vec![change],
            });
        }
        true
    }

    pub fn set_path(&self, path: Option<PathBuf>) {
        let path = path.map(|path| normalize_path(&path));
        let old_path = {
            let mut state = lock(&self.state);
            if state.path == path {
                return;
            }
            std::mem::replace(&mut state.path, path.clone())
        };

        self.did_change_path.emit(&PathChangeEvent {
            old_path,
            new_path: path,
        });
    }

    /// Run will-save hooks, write the text to disk, then report the save
    pub async fn save(self: &Arc<Self>) -> Result<()> {
        let hooks: Vec<Arc<dyn WillSaveHook>> = lock(&self.will_save_hooks)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook.will_save(self).await;
        }

        let (path, text) = {
            let state = lock(&self.state);
            let path = state
                .path
                .clone()
                .ok_or_else(|| BridgeError::Io("buffer has no path".to_string()))?;
            (path, state.text.clone())
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, text).await?;
        tracing::debug!("Saved {}", path.display());

        self.did_save.emit(&SaveEvent { path });
        Ok(())
    }

    /// Give the buffer a new path and save it there
    pub async fn save_as(self: &Arc<Self>, path: &Path) -> Result<()> {
        self.set_path(Some(path.to_path_buf()));
        self.save().await
    }

    pub fn on_did_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BufferChangeEvent) + Send + Sync + 'static,
    {
        self.did_change.subscribe(handler)
    }

    pub fn on_did_change_path<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PathChangeEvent) + Send + Sync + 'static,
    {
        self.did_change_path.subscribe(handler)
    }

    pub fn on_did_save<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SaveEvent) + Send + Sync + 'static,
    {
        self.did_save.subscribe(handler)
    }

    pub fn on_will_save(&self, hook: Arc<dyn WillSaveHook>) -> Subscription {
        let id = self.next_hook.fetch_add(1, Ordering::SeqCst);
        lock(&self.will_save_hooks).push((id, hook));

        let hooks = Arc::downgrade(&self.will_save_hooks);
        Subscription::new(move || {
            if let Some(hooks) = hooks.upgrade() {
                lock(&hooks).retain(|(hook_id, _)| *hook_id != id);
            }
        })
    }
}

/// UTF-16 length of replaced text, as `rangeLength` expects
pub fn range_length(change: &TextChange) -> u32 {
    utf16_len(&change.old_text)
}

impl std::fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextBuffer")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish()
    }
}
