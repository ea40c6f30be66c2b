//! Multi-buffer edit application
//!
//! An [`EditBatch`] is applied all-or-nothing: every edit is validated before
//! any buffer changes, each touched buffer gets a checkpoint, and a failure
//! while applying reverts every buffer touched so far.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::lsp::protocol::{uri_to_path, DocumentChange, TextEdit, WorkspaceEdit};
use crate::workspace::{BufferId, CheckpointId, TextBuffer, Workspace};

/// Edits to apply as one unit, in the order they were added
#[derive(Default)]
pub struct EditBatch {
    entries: Vec<(Arc<TextBuffer>, TextEdit)>,
}

impl EditBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: &Arc<TextBuffer>, edit: TextEdit) {
        self.entries.push((Arc::clone(buffer), edit));
    }

    pub fn extend(&mut self, buffer: &Arc<TextBuffer>, edits: impl IntoIterator<Item = TextEdit>) {
        for edit in edits {
            self.push(buffer, edit);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Edits grouped per buffer, buffers in first-seen order
    fn grouped(self) -> Vec<(Arc<TextBuffer>, Vec<TextEdit>)> {
        let mut groups: Vec<(Arc<TextBuffer>, Vec<TextEdit>)> = Vec::new();
        for (buffer, edit) in self.entries {
            match groups.iter_mut().find(|(b, _)| b.id() == buffer.id()) {
                Some((_, edits)) => edits.push(edit),
                None => groups.push((buffer, vec![edit])),
            }
        }
        groups
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Pending,
    Validating,
    Applying,
    Committed,
    RolledBack,
}

/// A buffer and the checkpoint taken before the batch touched it
#[derive(Debug, Clone)]
pub struct BufferCheckpoint {
    pub buffer: Arc<TextBuffer>,
    pub checkpoint: CheckpointId,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub state: ApplyState,
    pub failure_reason: Option<String>,
    /// Kept so a larger operation can undo this batch if a later step fails
    pub checkpoints: Vec<BufferCheckpoint>,
}

impl ApplyOutcome {
    fn rolled_back(reason: String) -> Self {
        Self {
            applied: false,
            state: ApplyState::RolledBack,
            failure_reason: Some(reason),
            checkpoints: Vec::new(),
        }
    }

    /// Revert every buffer this batch committed to
    pub fn rollback(&self) {
        for entry in self.checkpoints.iter().rev() {
            entry.buffer.revert_to_checkpoint(entry.checkpoint);
        }
    }
}

/// Check one buffer's edits; returns them sorted bottom to top
fn validate(buffer: &TextBuffer, mut edits: Vec<TextEdit>) -> Result<Vec<TextEdit>> {
    edits.sort_by(|a, b| b.range.cmp(&a.range));

    let mut previous: Option<&TextEdit> = None;
    for edit in &edits {
        let range = edit.range;
        if range.start > range.end {
            return Err(BridgeError::InvalidEdit(format!(
                "range starts after it ends at line {}",
                range.start.line
            )));
        }
        if !buffer.is_valid_position(range.start) || !buffer.is_valid_position(range.end) {
            return Err(BridgeError::InvalidEdit(format!(
                "invalid range {}:{}-{}:{}",
                range.start.line, range.start.character, range.end.line, range.end.character
            )));
        }
        if let Some(previous) = previous {
            if range.end > previous.range.start {
                return Err(BridgeError::InvalidEdit("found overlapping edit ranges".to_string()));
            }
        }
        previous = Some(edit);
    }

    Ok(edits)
}

pub struct EditApplier;

impl EditApplier {
    pub fn apply(batch: EditBatch) -> ApplyOutcome {
        let mut state = ApplyState::Pending;
        debug!("Applying edit batch of {} edits ({:?})", batch.len(), state);
        let groups = batch.grouped();

        state = ApplyState::Validating;
        let mut validated = Vec::with_capacity(groups.len());
        for (buffer, edits) in groups {
            match validate(&buffer, edits) {
                Ok(edits) => validated.push((buffer, edits)),
                Err(e) => {
                    warn!("Rejecting edit batch for {:?} while {:?}: {}", buffer.path(), state, e);
                    return ApplyOutcome::rolled_back(e.to_string());
                }
            }
        }

        state = ApplyState::Applying;
        let mut checkpoints: Vec<BufferCheckpoint> = Vec::with_capacity(validated.len());
        for (buffer, edits) in &validated {
            let checkpoint = buffer.create_checkpoint();
            checkpoints.push(BufferCheckpoint {
                buffer: Arc::clone(buffer),
                checkpoint,
            });

            for edit in edits {
                if let Err(e) = buffer.set_text_in_range(edit.range, &edit.new_text) {
                    warn!("Edit failed while {:?}, rolling back {} buffers: {}", state, checkpoints.len(), e);
                    for entry in checkpoints.iter().rev() {
                        entry.buffer.revert_to_checkpoint(entry.checkpoint);
                    }
                    return ApplyOutcome::rolled_back(e.to_string());
                }
            }
        }

        for entry in &checkpoints {
            entry.buffer.group_changes_since_checkpoint(entry.checkpoint);
        }

        state = ApplyState::Committed;
        ApplyOutcome {
            applied: true,
            state,
            failure_reason: None,
            checkpoints,
        }
    }

    /// Apply edits to a single buffer
    pub fn apply_to_buffer(buffer: &Arc<TextBuffer>, edits: Vec<TextEdit>) -> ApplyOutcome {
        let mut batch = EditBatch::new();
        batch.extend(buffer, edits);
        Self::apply(batch)
    }

    /// Apply a protocol workspace edit, loading unopened files from disk
    pub async fn apply_workspace_edit(workspace: &Workspace, edit: &WorkspaceEdit) -> ApplyOutcome {
        let mut per_document: Vec<(String, Vec<TextEdit>)> = Vec::new();

        if let Some(document_changes) = &edit.document_changes {
            for change in document_changes {
                match change {
                    DocumentChange::Edit(edit) => {
                        per_document.push((edit.text_document.uri.clone(), edit.edits.clone()));
                    }
                    DocumentChange::Operation(operation) => {
                        let kind = operation.get("kind").and_then(|k| k.as_str()).unwrap_or("unknown");
                        return ApplyOutcome::rolled_back(format!("unsupported resource operation '{}'", kind));
                    }
                }
            }
        } else if let Some(changes) = &edit.changes {
            let mut uris: Vec<&String> = changes.keys().collect();
            uris.sort();
            for uri in uris {
                per_document.push((uri.clone(), changes[uri].clone()));
            }
        }

        let mut batch = EditBatch::new();
        let mut seen: Vec<BufferId> = Vec::new();
        let mut unopened: Vec<Arc<TextBuffer>> = Vec::new();
        for (uri, edits) in per_document {
            let Some(path) = uri_to_path(&uri) else {
                return ApplyOutcome::rolled_back(format!("unsupported document uri {}", uri));
            };
            let buffer = match workspace.open_buffer(&path).await {
                Ok(buffer) => buffer,
                Err(e) => return ApplyOutcome::rolled_back(format!("cannot open {}: {}", path.display(), e)),
            };
            if !seen.contains(&buffer.id()) {
                seen.push(buffer.id());
                if workspace.views_for_buffer(buffer.id()).is_empty() {
                    unopened.push(Arc::clone(&buffer));
                }
            }
            batch.extend(&buffer, edits);
        }

        debug!("Workspace edit touches {} buffers", seen.len());
        let outcome = Self::apply(batch);

        // Edited buffers with no view would otherwise drop with the outcome
        if outcome.applied {
            for buffer in &unopened {
                workspace.retain_buffer(buffer);
            }
        }
        outcome
    }
}
