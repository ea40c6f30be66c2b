//! Server lifecycle manager
//!
//! Owns the project root → server map and the view → root routing table.
//! It is the only place that starts or stops server processes, and it
//! guarantees at most one live server per normalized project root.

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::edits::EditApplier;
use crate::error::{BridgeError, Result};
use crate::events::{NotificationLevel, SubscriptionGroup, UserNotification};
use crate::lsp::capabilities::SyncBehaviors;
use crate::lsp::connection::{Connection, RequestHandler};
use crate::lsp::protocol::*;
use crate::lsp::root::{normalize_path, MarkerRootResolver, ProjectRootResolver};
use crate::lsp::starter::{ServerProcess, ServerStarter, StartedServer};
use crate::sync::{DocumentSync, SyncContext, VersionTable};
use crate::workspace::{EditorView, ViewId, Workspace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a long-running operation as busy until dropped
#[must_use = "the operation is reported finished when the guard is dropped"]
pub struct BusyGuard {
    finish: Option<Box<dyn FnOnce() + Send>>,
}

impl BusyGuard {
    pub fn new<F>(finish: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            finish: Some(Box::new(finish)),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(finish) = self.finish.take() {
            finish();
        }
    }
}

/// Progress hook wrapped around server start and initialization
pub trait BusyReporter: Send + Sync {
    fn begin(&self, message: &str) -> BusyGuard;
}

/// Reports busy operations through tracing
pub struct LogBusyReporter;

impl BusyReporter for LogBusyReporter {
    fn begin(&self, message: &str) -> BusyGuard {
        info!("{}...", message);
        let message = message.to_string();
        BusyGuard::new(move || debug!("{} finished", message))
    }
}

/// Maps user settings before they are sent to a server
pub type SettingsMapper = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A file system event reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedFileChange {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatchedFileChange {
    fn into_events(self) -> Vec<(PathBuf, FileChangeType)> {
        match self {
            WatchedFileChange::Created(path) => vec![(path, FileChangeType::Created)],
            WatchedFileChange::Changed(path) => vec![(path, FileChangeType::Changed)],
            WatchedFileChange::Deleted(path) => vec![(path, FileChangeType::Deleted)],
            WatchedFileChange::Renamed { from, to } => {
                vec![(from, FileChangeType::Deleted), (to, FileChangeType::Created)]
            }
        }
    }
}

/// One running, initialized server
pub struct ServerRecord {
    /// Normalized project root; identity key
    project_root: PathBuf,
    pid: Option<u32>,
    process: tokio::sync::Mutex<Box<dyn ServerProcess>>,
    connection: Arc<Connection>,
    /// Fixed once initialization completes
    capabilities: ServerCapabilities,
    server_info: Option<ServerInfo>,
    behaviors: SyncBehaviors,
    /// Restarts that preceded this record for the same root
    restart_count: u32,
    stop_requested: AtomicBool,
    context: Arc<SyncContext>,
    syncs: Mutex<BTreeMap<ViewId, DocumentSync>>,
    handlers: Mutex<SubscriptionGroup>,
}

impl ServerRecord {
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn behaviors(&self) -> SyncBehaviors {
        self.behaviors
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn sync_context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    pub fn attached_views(&self) -> Vec<ViewId> {
        lock(&self.syncs).keys().copied().collect()
    }

    pub fn is_attached(&self, view: ViewId) -> bool {
        lock(&self.syncs).contains_key(&view)
    }

    fn attach(&self, view: &EditorView) {
        if !self.behaviors.is_active() || self.is_stopping() {
            return;
        }
        let mut syncs = lock(&self.syncs);
        if syncs.contains_key(&view.id()) {
            return;
        }
        debug!("Attaching {} to server for {}", view.id(), self.project_root.display());
        syncs.insert(view.id(), DocumentSync::attach(view, Arc::clone(&self.context)));
    }

    fn detach(&self, view: ViewId) {
        let sync = lock(&self.syncs).remove(&view);
        if let Some(sync) = sync {
            sync.detach();
        }
    }

    /// Drop every sync without notifying the server
    fn release_syncs(&self) {
        let syncs = std::mem::take(&mut *lock(&self.syncs));
        drop(syncs);
        lock(&self.handlers).dispose();
    }

    /// shutdown → exit → wait → terminate
    async fn shutdown(&self, timeout: Duration) {
        self.release_syncs();

        if !self.connection.is_closed() {
            if let Err(e) = self.connection.shutdown(timeout).await {
                debug!("Shutdown request for {} failed: {}", self.project_root.display(), e);
            }
            if let Err(e) = self.connection.exit() {
                debug!("Exit notification for {} failed: {}", self.project_root.display(), e);
            }
        }

        let mut process = self.process.lock().await;
        if !process.wait_for_exit(timeout).await {
            warn!(
                "Language server for {} did not exit in {:?}, terminating",
                self.project_root.display(),
                timeout
            );
            process.terminate(timeout).await;
        }
    }
}

impl std::fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRecord")
            .field("project_root", &self.project_root)
            .field("pid", &self.pid)
            .field("restart_count", &self.restart_count)
            .finish()
    }
}

type StartFuture = Shared<BoxFuture<'static, Result<Arc<ServerRecord>>>>;

#[derive(Default)]
struct ManagerState {
    active: HashMap<PathBuf, Arc<ServerRecord>>,
    starting: HashMap<PathBuf, StartFuture>,
    stopping: HashSet<PathBuf>,
    /// Never reset while the manager lives
    restart_counts: HashMap<PathBuf, u32>,
    /// Roots whose last start failed; not retried implicitly
    failed: HashMap<PathBuf, BridgeError>,
    /// Roots that hit the restart limit
    abandoned: HashSet<PathBuf>,
    routes: HashMap<ViewId, PathBuf>,
}

struct ManagerInner {
    config: Config,
    workspace: Arc<Workspace>,
    starter: Arc<dyn ServerStarter>,
    resolver: Arc<dyn ProjectRootResolver>,
    busy: Arc<dyn BusyReporter>,
    settings_mapper: Option<SettingsMapper>,
    settings: Mutex<Option<Value>>,
    versions: Arc<VersionTable>,
    notifications: broadcast::Sender<UserNotification>,
    state: Mutex<ManagerState>,
}

/// Builder for [`ServerManager`]
pub struct ManagerBuilder {
    config: Config,
    workspace: Arc<Workspace>,
    starter: Arc<dyn ServerStarter>,
    resolver: Option<Arc<dyn ProjectRootResolver>>,
    busy: Option<Arc<dyn BusyReporter>>,
    settings_mapper: Option<SettingsMapper>,
}

impl ManagerBuilder {
    /// Override the default marker-file root resolution
    pub fn resolver(mut self, resolver: Arc<dyn ProjectRootResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn busy_reporter(mut self, busy: Arc<dyn BusyReporter>) -> Self {
        self.busy = Some(busy);
        self
    }

    pub fn settings_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.settings_mapper = Some(Arc::new(mapper));
        self
    }

    pub fn build(self) -> ServerManager {
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(MarkerRootResolver::new(
                self.config.server.root_markers.clone(),
                self.workspace.root(),
            ))
        });
        let (notifications, _) = broadcast::channel(64);
        let settings = self.config.settings.clone();

        ServerManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                workspace: self.workspace,
                starter: self.starter,
                resolver,
                busy: self.busy.unwrap_or_else(|| Arc::new(LogBusyReporter)),
                settings_mapper: self.settings_mapper,
                settings: Mutex::new(settings),
                versions: Arc::new(VersionTable::new()),
                notifications,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }
}

/// Starts, routes to, restarts and stops language servers
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<ManagerInner>,
}

impl ServerManager {
    pub fn builder(config: Config, workspace: Arc<Workspace>, starter: Arc<dyn ServerStarter>) -> ManagerBuilder {
        ManagerBuilder {
            config,
            workspace,
            starter,
            resolver: None,
            busy: None,
            settings_mapper: None,
        }
    }

    pub fn new(config: Config, workspace: Arc<Workspace>, starter: Arc<dyn ServerStarter>) -> Self {
        Self::builder(config, workspace, starter).build()
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.inner.state)
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.inner.workspace
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.inner.versions
    }

    /// Messages the host should show to the user
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<UserNotification> {
        self.inner.notifications.subscribe()
    }

    fn notify_user(&self, notification: UserNotification) {
        let _ = self.inner.notifications.send(notification);
    }

    /// Resolve and normalize a project root off the async worker threads
    async fn resolve_root(&self, path: PathBuf) -> PathBuf {
        let resolver = Arc::clone(&self.inner.resolver);
        let fallback = self.inner.workspace.root().to_path_buf();
        off_thread(fallback, move || normalize_path(&resolver.resolve(&path))).await
    }

    /// Project root owning the view's document, or None if the server does not handle it
    pub async fn root_for_view(&self, view: &EditorView) -> Option<PathBuf> {
        let buffer = view.buffer();
        let path = buffer.path();
        let language_id = buffer.language_id();
        if !self
            .inner
            .config
            .server
            .matches(language_id.as_deref(), path.as_deref())
        {
            return None;
        }

        Some(match path {
            Some(path) => self.resolve_root(path).await,
            None => self.inner.workspace.root().to_path_buf(),
        })
    }

    /// Root recorded when the view was routed, or a fresh resolution
    async fn routed_root(&self, view: &EditorView) -> Option<PathBuf> {
        let cached = self.state().routes.get(&view.id()).cloned();
        match cached {
            Some(root) => Some(root),
            None => self.root_for_view(view).await,
        }
    }

    /// The server responsible for the view's document
    ///
    /// With `should_start`, a missing server is started; concurrent callers for
    /// the same root share one start.
    pub async fn get_server(&self, view: &EditorView, should_start: bool) -> Result<Option<Arc<ServerRecord>>> {
        let Some(root) = self.routed_root(view).await else {
            return Ok(None);
        };

        let start = {
            let mut state = self.state();
            if let Some(record) = state.active.get(&root) {
                return Ok(Some(Arc::clone(record)));
            }
            if state.stopping.contains(&root) || state.abandoned.contains(&root) {
                return Ok(None);
            }
            if let Some(err) = state.failed.get(&root) {
                return if should_start { Err(err.clone()) } else { Ok(None) };
            }
            if !should_start {
                return Ok(None);
            }
            match state.starting.get(&root) {
                Some(start) => start.clone(),
                None => self.begin_start(&mut state, root),
            }
        };

        start.await.map(Some)
    }

    /// Start the server for `project_root`, or join the start already in flight
    ///
    /// An explicit start clears an earlier spawn failure or restart-limit stop.
    pub async fn start_server(&self, project_root: &Path) -> Result<Arc<ServerRecord>> {
        let path = project_root.to_path_buf();
        let root = off_thread(project_root.to_path_buf(), move || normalize_path(&path)).await;
        let start = {
            let mut state = self.state();
            if let Some(record) = state.active.get(&root) {
                return Ok(Arc::clone(record));
            }
            if state.stopping.contains(&root) {
                return Err(BridgeError::Stopped(root));
            }
            state.failed.remove(&root);
            state.abandoned.remove(&root);
            match state.starting.get(&root) {
                Some(start) => start.clone(),
                None => self.begin_start(&mut state, root),
            }
        };

        start.await
    }

    fn begin_start(&self, state: &mut ManagerState, root: PathBuf) -> StartFuture {
        let restart_count = state.restart_counts.get(&root).copied().unwrap_or(0);
        let manager = self.clone();
        let task_root = root.clone();

        // Runs to completion even if every waiter goes away
        let handle = tokio::spawn(async move { manager.launch(task_root, restart_count).await });
        let start = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(BridgeError::Initialize(format!("start task failed: {}", e))))
        }
        .boxed()
        .shared();

        state.starting.insert(root, start.clone());
        start
    }

    async fn launch(&self, root: PathBuf, restart_count: u32) -> Result<Arc<ServerRecord>> {
        let result = {
            let _busy = self
                .inner
                .busy
                .begin(&format!("Starting language server for {}", root.display()));
            self.spawn_and_initialize(&root, restart_count).await
        };

        let mut state = self.state();
        state.starting.remove(&root);
        match result {
            Ok(record) => {
                state.active.insert(root.clone(), Arc::clone(&record));
                let mut routed: Vec<ViewId> = state
                    .routes
                    .iter()
                    .filter(|(_, routed_root)| **routed_root == root)
                    .map(|(view, _)| *view)
                    .collect();
                drop(state);

                info!(
                    "Language server for {} ready (pid {:?}, restart {})",
                    root.display(),
                    record.pid(),
                    restart_count
                );
                self.spawn_monitor(&record);

                routed.sort();
                for view in routed {
                    if let Some(view) = self.inner.workspace.view(view) {
                        record.attach(&view);
                    }
                }
                Ok(record)
            }
            Err(e) => {
                state.failed.insert(root.clone(), e.clone());
                drop(state);

                error!("Failed to start language server for {}: {}", root.display(), e);
                self.notify_user(
                    UserNotification::new(
                        NotificationLevel::Error,
                        format!("Could not start the language server for {}", root.display()),
                    )
                    .with_detail(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn spawn_and_initialize(&self, root: &Path, restart_count: u32) -> Result<Arc<ServerRecord>> {
        let StartedServer { mut process, transport } = self.inner.starter.start(root).await?;

        let label = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());
        let connection = Connection::new(label, transport, self.inner.config.lifecycle.request_timeout());

        // Servers may ask for configuration while initializing
        let handlers = self.register_handlers(&connection);

        let result = match connection.initialize(self.initialize_params(root)).await {
            Ok(result) => result,
            Err(e) => {
                process.terminate(self.inner.config.lifecycle.shutdown_timeout()).await;
                return Err(BridgeError::Initialize(e.to_string()));
            }
        };
        connection.initialized()?;
        if let Some(settings) = self.current_settings() {
            connection.did_change_configuration(settings)?;
        }

        let behaviors = SyncBehaviors::from_capabilities(&result.capabilities);
        debug!("Sync behaviors for {}: {:?}", root.display(), behaviors);

        let context = SyncContext::new(
            Arc::clone(&connection),
            behaviors,
            Arc::clone(&self.inner.versions),
            Arc::clone(&self.inner.workspace),
            self.inner.notifications.clone(),
            self.inner.config.sync.will_save_wait_until_timeout(),
            self.inner.config.sync.host_reports_file_renames,
        );

        Ok(Arc::new(ServerRecord {
            project_root: root.to_path_buf(),
            pid: process.pid(),
            process: tokio::sync::Mutex::new(process),
            connection,
            capabilities: result.capabilities,
            server_info: result.server_info,
            behaviors,
            restart_count,
            stop_requested: AtomicBool::new(false),
            context,
            syncs: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(handlers),
        }))
    }

    fn initialize_params(&self, root: &Path) -> InitializeParams {
        let root_uri = path_to_uri(root);
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string());

        InitializeParams {
            process_id: Some(std::process::id()),
            root_path: Some(root.display().to_string()),
            root_uri: Some(root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder { uri: root_uri, name }]),
            capabilities: ClientCapabilities {
                workspace: Some(WorkspaceClientCapabilities {
                    apply_edit: true,
                    configuration: true,
                    workspace_edit: Some(WorkspaceEditCapabilities { document_changes: true }),
                    did_change_watched_files: Some(DynamicRegistration::default()),
                    did_change_configuration: Some(DynamicRegistration::default()),
                }),
                text_document: Some(TextDocumentClientCapabilities {
                    synchronization: Some(SynchronizationCapabilities {
                        dynamic_registration: false,
                        will_save: true,
                        will_save_wait_until: true,
                        did_save: true,
                    }),
                    document_symbol: Some(DocumentSymbolCapabilities {
                        hierarchical_document_symbol_support: true,
                    }),
                }),
            },
            initialization_options: self.inner.config.server.initialization_options.clone(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        }
    }

    fn register_handlers(&self, connection: &Connection) -> SubscriptionGroup {
        let mut handlers = SubscriptionGroup::new();

        handlers.add(connection.on_request(
            "workspace/applyEdit",
            Arc::new(ApplyEditHandler {
                workspace: Arc::clone(&self.inner.workspace),
            }),
        ));
        handlers.add(connection.on_request(
            "workspace/configuration",
            Arc::new(ConfigurationHandler {
                manager: Arc::downgrade(&self.inner),
            }),
        ));
        for method in ["client/registerCapability", "client/unregisterCapability", "window/workDoneProgress/create"] {
            handlers.add(connection.on_request(method, Arc::new(Acknowledge)));
        }

        let notifications = self.inner.notifications.clone();
        handlers.add(connection.on_notification("window/showMessage", move |params| {
            match serde_json::from_value::<MessageParams>(params.clone()) {
                Ok(message) => {
                    let level = NotificationLevel::from_message_type(message.kind);
                    let _ = notifications.send(UserNotification::new(level, message.message));
                }
                Err(e) => debug!("Ignoring malformed showMessage: {}", e),
            }
        }));

        let label = connection.label().to_string();
        handlers.add(connection.on_notification("window/logMessage", move |params| {
            let Ok(message) = serde_json::from_value::<MessageParams>(params.clone()) else {
                return;
            };
            match message.kind {
                1 => error!(server = %label, "{}", message.message),
                2 => warn!(server = %label, "{}", message.message),
                3 => info!(server = %label, "{}", message.message),
                _ => debug!(server = %label, "{}", message.message),
            }
        }));

        handlers
    }

    fn spawn_monitor(&self, record: &Arc<ServerRecord>) {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let weak_record = Arc::downgrade(record);
        let connection = Arc::clone(&record.connection);

        tokio::spawn(async move {
            connection.closed().await;
            let (Some(inner), Some(record)) = (manager.upgrade(), weak_record.upgrade()) else {
                return;
            };
            ServerManager { inner }.handle_close(record).await;
        });
    }

    /// React to a closed connection: nothing if we asked it to stop, otherwise restart or give up
    async fn handle_close(&self, record: Arc<ServerRecord>) {
        if record.is_stopping() {
            debug!("Language server for {} closed after stop", record.project_root.display());
            return;
        }

        let root = record.project_root.clone();
        let restart = {
            let mut state = self.state();
            match state.active.get(&root) {
                Some(active) if Arc::ptr_eq(active, &record) => {}
                _ => return,
            }
            state.active.remove(&root);

            if self.has_server_reached_restart_limit(&record) {
                state.abandoned.insert(root.clone());
                None
            } else {
                let count = state.restart_counts.entry(root.clone()).or_insert(0);
                *count += 1;
                let attempt = *count;
                Some((attempt, self.begin_start(&mut state, root.clone())))
            }
        };

        record.release_syncs();
        {
            let mut process = record.process.lock().await;
            process.terminate(self.inner.config.lifecycle.shutdown_timeout()).await;
        }

        match restart {
            Some((attempt, start)) => {
                warn!(
                    "Language server for {} exited unexpectedly, restarting ({}/{})",
                    root.display(),
                    attempt,
                    self.inner.config.lifecycle.max_restarts
                );
                // Failures are reported by the start itself
                let _ = start.await;
            }
            None => {
                error!(
                    "Language server for {} crashed {} times, giving up",
                    root.display(),
                    record.restart_count + 1
                );
                self.notify_user(UserNotification {
                    level: NotificationLevel::Error,
                    message: format!("The language server for {} keeps crashing", root.display()),
                    detail: Some(BridgeError::RestartLimit(root).to_string()),
                    dismissable: false,
                });
            }
        }
    }

    /// Whether another unexpected close must not be followed by a restart
    pub fn has_server_reached_restart_limit(&self, record: &ServerRecord) -> bool {
        record.restart_count >= self.inner.config.lifecycle.max_restarts
    }

    /// Gracefully stop one server; lookups for its root answer None meanwhile
    pub async fn stop_server(&self, record: &Arc<ServerRecord>) {
        let root = record.project_root.clone();
        {
            let mut state = self.state();
            record.stop_requested.store(true, Ordering::SeqCst);
            if matches!(state.active.get(&root), Some(active) if Arc::ptr_eq(active, record)) {
                state.active.remove(&root);
            }
            state.stopping.insert(root.clone());
        }

        info!("Stopping language server for {}", root.display());
        record.shutdown(self.inner.config.lifecycle.shutdown_timeout()).await;
        self.state().stopping.remove(&root);
    }

    pub async fn stop_all_servers(&self) {
        let starting: Vec<StartFuture> = self.state().starting.values().cloned().collect();
        future::join_all(starting).await;

        let records: Vec<Arc<ServerRecord>> = self.state().active.values().cloned().collect();
        future::join_all(records.iter().map(|record| self.stop_server(record))).await;
    }

    /// Stop every server, then start one again for every root still in use
    pub async fn restart_all_servers(&self) -> Vec<Arc<ServerRecord>> {
        let mut roots: Vec<PathBuf> = self.state().active.keys().cloned().collect();
        self.stop_all_servers().await;

        {
            let mut state = self.state();
            state.failed.clear();
            state.abandoned.clear();
            roots.extend(state.routes.values().cloned());
        }
        roots.sort();
        roots.dedup();

        let results = future::join_all(roots.iter().map(|root| self.start_server(root))).await;
        results.into_iter().filter_map(|result| result.ok()).collect()
    }

    /// Route a newly opened view and attach it to its server, starting one if needed
    pub async fn view_opened(&self, view: &Arc<EditorView>) -> Result<Option<Arc<ServerRecord>>> {
        let Some(root) = self.root_for_view(view).await else {
            debug!("No language server for {}", view.id());
            return Ok(None);
        };
        self.state().routes.insert(view.id(), root);

        let record = self.get_server(view, true).await?;
        if let Some(record) = &record {
            record.attach(view);
        }
        Ok(record)
    }

    /// Forget a destroyed view, closing its document if it was the last one
    pub fn view_closed(&self, view: ViewId) {
        let record = {
            let mut state = self.state();
            let Some(root) = state.routes.remove(&view) else {
                return;
            };
            state.active.get(&root).cloned()
        };
        if let Some(record) = record {
            record.detach(view);
        }
    }

    /// Re-route a view after its path or language changed
    pub async fn refresh_view(&self, view: &Arc<EditorView>) -> Result<Option<Arc<ServerRecord>>> {
        let new_root = self.root_for_view(view).await;
        let (old_root, old_record) = {
            let state = self.state();
            let old_root = state.routes.get(&view.id()).cloned();
            let old_record = old_root.as_ref().and_then(|root| state.active.get(root).cloned());
            (old_root, old_record)
        };

        if old_root.is_some() && old_root == new_root {
            return Ok(old_record);
        }

        self.view_closed(view.id());
        self.view_opened(view).await
    }

    /// The active server for a path, if any
    pub async fn server_for_path(&self, path: &Path) -> Option<Arc<ServerRecord>> {
        let root = self.resolve_root(path.to_path_buf()).await;
        self.state().active.get(&root).cloned()
    }

    pub fn active_servers(&self) -> Vec<Arc<ServerRecord>> {
        let mut records: Vec<Arc<ServerRecord>> = self.state().active.values().cloned().collect();
        records.sort_by(|a, b| a.project_root.cmp(&b.project_root));
        records
    }

    /// Forward file system events to the servers owning the paths
    pub async fn did_change_watched_files(&self, changes: Vec<WatchedFileChange>) {
        let mut per_root: BTreeMap<PathBuf, Vec<FileEvent>> = BTreeMap::new();
        for (path, kind) in changes.into_iter().flat_map(WatchedFileChange::into_events) {
            let root = self.resolve_root(path.clone()).await;
            per_root.entry(root).or_default().push(FileEvent {
                uri: path_to_uri(&path),
                kind,
            });
        }

        for (root, events) in per_root {
            let Some(record) = self.state().active.get(&root).cloned() else {
                continue;
            };
            if let Err(e) = record.connection.did_change_watched_files(events) {
                warn!("Failed to send watched file changes to {}: {}", root.display(), e);
            }
        }
    }

    fn current_settings(&self) -> Option<Value> {
        let settings = lock(&self.inner.settings).clone()?;
        Some(match &self.inner.settings_mapper {
            Some(mapper) => mapper(&settings),
            None => settings,
        })
    }

    /// Replace the user settings and push them to every running server
    pub fn did_change_configuration(&self, settings: Value) {
        *lock(&self.inner.settings) = Some(settings);
        let Some(mapped) = self.current_settings() else {
            return;
        };

        for record in self.active_servers() {
            if let Err(e) = record.connection.did_change_configuration(mapped.clone()) {
                warn!(
                    "Failed to send configuration to {}: {}",
                    record.project_root.display(),
                    e
                );
            }
        }
    }
}

/// Look up a dotted section in the settings tree
/// Run file system bound path work on the blocking pool
async fn off_thread<F>(fallback: PathBuf, work: F) -> PathBuf
where
    F: FnOnce() -> PathBuf + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.unwrap_or_else(|e| {
        warn!("Path resolution task failed: {}", e);
        fallback
    })
}

fn settings_section(settings: &Value, section: Option<&str>) -> Value {
    let Some(section) = section.filter(|s| !s.is_empty()) else {
        return settings.clone();
    };
    section
        .split('.')
        .try_fold(settings, |value, key| value.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

struct ApplyEditHandler {
    workspace: Arc<Workspace>,
}

#[async_trait]
impl RequestHandler for ApplyEditHandler {
    async fn handle(&self, params: Value) -> Result<Value> {
        let params: ApplyWorkspaceEditParams = serde_json::from_value(params)?;
        if let Some(label) = &params.label {
            debug!("Applying workspace edit '{}'", label);
        }

        let outcome = EditApplier::apply_workspace_edit(&self.workspace, &params.edit).await;
        Ok(serde_json::to_value(ApplyWorkspaceEditResponse {
            applied: outcome.applied,
            failure_reason: outcome.failure_reason,
        })?)
    }
}

struct ConfigurationHandler {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl RequestHandler for ConfigurationHandler {
    async fn handle(&self, params: Value) -> Result<Value> {
        let params: ConfigurationParams = serde_json::from_value(params)?;
        let settings = self
            .manager
            .upgrade()
            .and_then(|inner| ServerManager { inner }.current_settings())
            .unwrap_or(Value::Null);

        let items: Vec<Value> = params
            .items
            .iter()
            .map(|item| settings_section(&settings, item.section.as_deref()))
            .collect();
        Ok(Value::Array(items))
    }
}

/// Accepts a request and answers null
struct Acknowledge;

#[async_trait]
impl RequestHandler for Acknowledge {
    async fn handle(&self, _params: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}
