//! Synchronization behaviors negotiated with a server
//!
//! `textDocumentSync` is interpreted once, when the server finishes
//! initializing; document syncs consult the resulting [`SyncBehaviors`]
//! instead of re-reading capability flags.

use super::protocol::{SaveCapability, ServerCapabilities, TextDocumentSyncCapability};

/// How document changes are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// No change notifications
    None,
    /// Entire text on every change
    Full,
    /// Only the changed ranges
    Incremental,
}

impl ChangeMode {
    fn from_kind(kind: u8) -> Self {
        match kind {
            1 => ChangeMode::Full,
            2 => ChangeMode::Incremental,
            _ => ChangeMode::None,
        }
    }
}

/// What `didSave` carries, when it is sent at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Skip,
    Notify,
    NotifyWithText,
}

/// What a server expects to hear about documents before and after saving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WillSaveMode {
    Skip,
    Notify,
    WaitUntil,
    NotifyAndWaitUntil,
}

impl WillSaveMode {
    pub fn notifies(self) -> bool {
        matches!(self, WillSaveMode::Notify | WillSaveMode::NotifyAndWaitUntil)
    }

    pub fn waits(self) -> bool {
        matches!(self, WillSaveMode::WaitUntil | WillSaveMode::NotifyAndWaitUntil)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBehaviors {
    pub open_close: bool,
    pub change: ChangeMode,
    pub will_save: WillSaveMode,
    pub save: SaveMode,
}

impl SyncBehaviors {
    pub fn disabled() -> Self {
        Self {
            open_close: false,
            change: ChangeMode::None,
            will_save: WillSaveMode::Skip,
            save: SaveMode::Skip,
        }
    }

    pub fn from_capabilities(capabilities: &ServerCapabilities) -> Self {
        match &capabilities.text_document_sync {
            None => Self::disabled(),
            Some(TextDocumentSyncCapability::Kind(kind)) => {
                let change = ChangeMode::from_kind(*kind);
                let active = change != ChangeMode::None;
                Self {
                    open_close: active,
                    change,
                    will_save: WillSaveMode::Skip,
                    save: if active { SaveMode::Notify } else { SaveMode::Skip },
                }
            }
            Some(TextDocumentSyncCapability::Options(options)) => {
                let change = options.change.map(ChangeMode::from_kind).unwrap_or(ChangeMode::None);
                let open_close = options.open_close.unwrap_or(change != ChangeMode::None);

                let will_save = match (
                    options.will_save.unwrap_or(false),
                    options.will_save_wait_until.unwrap_or(false),
                ) {
                    (false, false) => WillSaveMode::Skip,
                    (true, false) => WillSaveMode::Notify,
                    (false, true) => WillSaveMode::WaitUntil,
                    (true, true) => WillSaveMode::NotifyAndWaitUntil,
                };

                let save = match &options.save {
                    None | Some(SaveCapability::Supported(false)) => SaveMode::Skip,
                    Some(SaveCapability::Supported(true)) => SaveMode::Notify,
                    Some(SaveCapability::Options(save)) => {
                        if save.include_text.unwrap_or(false) {
                            SaveMode::NotifyWithText
                        } else {
                            SaveMode::Notify
                        }
                    }
                };

                Self {
                    open_close,
                    change,
                    will_save,
                    save,
                }
            }
        }
    }

    /// Whether documents need a sync attached at all
    pub fn is_active(&self) -> bool {
        self.open_close || self.change != ChangeMode::None
    }
}
