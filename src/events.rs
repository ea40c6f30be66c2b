//! Event emitters and scoped subscription handles
//!
//! Every `subscribe` call returns a [`Subscription`]; dropping it removes the
//! handler. Components collect their handles in a [`SubscriptionGroup`] so all
//! of them are released together on teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Handlers<T> {
    entries: Vec<(u64, Handler<T>)>,
}

/// A list of handlers for one kind of event
pub struct Emitter<T> {
    handlers: Arc<Mutex<Handlers<T>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Handlers {
                entries: Vec::new(),
            })),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler; it stays registered while the returned handle lives
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.handlers).entries.push((id, Arc::new(handler)));

        let handlers: Weak<Mutex<Handlers<T>>> = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                lock(&handlers).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Call every handler in registration order
    ///
    /// Handlers run outside the internal lock, so they may subscribe or
    /// unsubscribe while being called.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = lock(&self.handlers)
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).entries.len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that runs its release action exactly once, on drop or `dispose`
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// All subscriptions owned by one component
#[derive(Debug, Default)]
pub struct SubscriptionGroup {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Release every handle, most recent first
    pub fn dispose(&mut self) {
        while let Some(subscription) = self.subscriptions.pop() {
            subscription.dispose();
        }
    }
}

impl Drop for SubscriptionGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Severity of a message meant for the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl NotificationLevel {
    /// Map a `window/showMessage` type
    pub fn from_message_type(kind: u8) -> Self {
        match kind {
            1 => NotificationLevel::Error,
            2 => NotificationLevel::Warning,
            _ => NotificationLevel::Info,
        }
    }
}

/// Something the host should show to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotification {
    pub level: NotificationLevel,
    pub message: String,
    pub detail: Option<String>,
    pub dismissable: bool,
}

impl UserNotification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            detail: None,
            dismissable: true,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
