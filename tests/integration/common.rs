use assert_fs::TempDir;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};

use langbridge::config::Config;
use langbridge::error::{BridgeError, Result};
use langbridge::lsp::{PeerChannels, ServerProcess, ServerStarter, StartedServer, TransportChannels};
use langbridge::manager::ServerManager;
use langbridge::workspace::{EditorView, Workspace};

/// How the fake language server behaves
#[derive(Clone)]
pub struct FakeServerOptions {
    pub capabilities: Value,
    pub fail_spawn: bool,
    pub reject_initialize: bool,
    pub start_delay: Duration,
    pub will_save_delay: Duration,
    pub will_save_edits: Value,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "textDocumentSync": {
                    "openClose": true,
                    "change": 2,
                    "willSaveWaitUntil": true,
                    "save": { "includeText": true }
                },
                "documentSymbolProvider": true
            }),
            fail_spawn: false,
            reject_initialize: false,
            start_delay: Duration::from_millis(20),
            will_save_delay: Duration::ZERO,
            will_save_edits: json!([]),
        }
    }
}

/// A message the fake server received, tagged with its project root
#[derive(Debug, Clone)]
pub struct Received {
    pub root: PathBuf,
    pub message: Value,
}

struct LiveServer {
    inject: mpsc::UnboundedSender<Value>,
    kill: Arc<Notify>,
}

/// In-process language server standing in for a spawned process
pub struct FakeStarter {
    options: FakeServerOptions,
    starts: AtomicUsize,
    terminations: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
    live: Mutex<HashMap<PathBuf, LiveServer>>,
}

impl FakeStarter {
    pub fn new(options: FakeServerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            starts: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Methods of every request and notification received, in order
    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|r| r.message["method"].as_str().map(str::to_string))
            .collect()
    }

    pub fn messages(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|r| r.message["method"] == method)
            .map(|r| r.message)
            .collect()
    }

    /// Wait until at least `count` messages with `method` arrived
    pub async fn wait_for(&self, method: &str, count: usize) -> Vec<Value> {
        eventually(&format!("{} x{}", method, count), || self.messages(method).len() >= count).await;
        self.messages(method)
    }

    /// The client's reply to a request we injected
    pub async fn wait_for_response(&self, id: &Value) -> Value {
        let find = || {
            self.received()
                .into_iter()
                .find(|r| r.message.get("method").is_none() && r.message["id"] == *id)
                .map(|r| r.message)
        };
        eventually("client response", || find().is_some()).await;
        find().unwrap()
    }

    /// Make the current server for `root` drop its connection
    pub fn crash(&self, root: &Path) {
        if let Some(server) = self.live.lock().unwrap().get(root) {
            server.kill.notify_one();
        }
    }

    /// Send a raw message from the server for `root` to the client
    pub fn send_to_client(&self, root: &Path, message: Value) {
        let live = self.live.lock().unwrap();
        let server = live.get(root).expect("no server running for root");
        server.inject.send(message).unwrap();
    }
}

#[async_trait]
impl ServerStarter for FakeStarter {
    async fn start(&self, project_root: &Path) -> Result<StartedServer> {
        let pid = 1000 + self.starts.fetch_add(1, Ordering::SeqCst) as u32;
        tokio::time::sleep(self.options.start_delay).await;

        if self.options.fail_spawn {
            return Err(BridgeError::Spawn {
                root: project_root.to_path_buf(),
                reason: "fake-ls: command not found".to_string(),
            });
        }

        let (client, peer) = TransportChannels::memory_pair();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let kill = Arc::new(Notify::new());

        self.live.lock().unwrap().insert(
            project_root.to_path_buf(),
            LiveServer {
                inject: inject_tx,
                kill: Arc::clone(&kill),
            },
        );

        tokio::spawn(serve(
            project_root.to_path_buf(),
            peer,
            self.options.clone(),
            Arc::clone(&self.received),
            Arc::clone(&kill),
            inject_rx,
            exited_tx,
        ));

        Ok(StartedServer {
            process: Box::new(FakeProcess {
                pid,
                kill,
                exited: exited_rx,
                terminations: Arc::clone(&self.terminations),
            }),
            transport: client,
        })
    }
}

async fn serve(
    root: PathBuf,
    mut peer: PeerChannels,
    options: FakeServerOptions,
    received: Arc<Mutex<Vec<Received>>>,
    kill: Arc<Notify>,
    mut inject: mpsc::UnboundedReceiver<Value>,
    exited: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            _ = kill.notified() => break,
            Some(message) = inject.recv() => {
                let _ = peer.outgoing.send(message.to_string());
            }
            body = peer.incoming.recv() => {
                let Some(body) = body else { break };
                let Ok(message) = serde_json::from_str::<Value>(&body) else { continue };
                received.lock().unwrap().push(Received {
                    root: root.clone(),
                    message: message.clone(),
                });

                let method = message["method"].as_str().unwrap_or_default().to_string();
                if method == "exit" {
                    break;
                }
                if method.is_empty() || message.get("id").is_none() {
                    continue;
                }

                let id = message["id"].clone();
                let reply = match method.as_str() {
                    "initialize" if options.reject_initialize => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": { "code": -32603, "message": "unsupported workspace" }
                    }),
                    "initialize" => json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {
                            "capabilities": options.capabilities,
                            "serverInfo": { "name": "fake-ls", "version": "1.0" }
                        }
                    }),
                    "textDocument/willSaveWaitUntil" => {
                        let outgoing = peer.outgoing.clone();
                        let delay = options.will_save_delay;
                        let edits = options.will_save_edits.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = outgoing.send(json!({ "jsonrpc": "2.0", "id": id, "result": edits }).to_string());
                        });
                        continue;
                    }
                    _ => json!({ "jsonrpc": "2.0", "id": id, "result": null }),
                };
                let _ = peer.outgoing.send(reply.to_string());
            }
        }
    }

    let _ = exited.send(true);
}

struct FakeProcess {
    pid: u32,
    kill: Arc<Notify>,
    exited: watch::Receiver<bool>,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ServerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        let done = matches!(
            tokio::time::timeout(timeout, exited.wait_for(|exited| *exited)).await,
            Ok(Ok(_))
        );
        done
    }

    async fn terminate(&mut self, grace: Duration) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.kill.notify_one();
        self.wait_for_exit(grace).await;
    }
}

/// Configuration with short timeouts for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.lifecycle.shutdown_timeout_ms = 200;
    config.lifecycle.request_timeout_ms = 2000;
    config.sync.will_save_wait_until_timeout_ms = 100;
    config
}

/// A workspace rooted in a fresh temp directory
pub struct TestWorkspace {
    pub temp: TempDir,
    pub workspace: Arc<Workspace>,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let workspace = Workspace::new(temp.path());
        Self { temp, workspace }
    }

    pub fn root(&self) -> PathBuf {
        self.workspace.root().to_path_buf()
    }

    pub fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    /// Load a file and show it in a new view
    pub async fn open(&self, name: &str, text: &str) -> Arc<EditorView> {
        let path = self.write(name, text);
        let buffer = self.workspace.open_buffer(&path).await.unwrap();
        self.workspace.open_view(&buffer)
    }

    pub fn manager(&self, config: Config, starter: &Arc<FakeStarter>) -> ServerManager {
        let starter: Arc<dyn ServerStarter> = Arc::clone(starter) as Arc<dyn ServerStarter>;
        ServerManager::new(config, Arc::clone(&self.workspace), starter)
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give in-flight messages time to arrive
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
