//! Server process startup
//!
//! The manager never spawns processes directly: it calls an injected
//! [`ServerStarter`], which hands back an opaque [`ServerProcess`] plus the
//! transport connected to it.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use super::transport::{forward_stderr, spawn_framed, TransportChannels};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};

/// A running server process
#[async_trait]
pub trait ServerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit on its own, up to `timeout`
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool;

    /// Ask the process to terminate, then force it after `grace`
    async fn terminate(&mut self, grace: Duration);
}

/// What a starter produces for one project root
pub struct StartedServer {
    pub process: Box<dyn ServerProcess>,
    pub transport: TransportChannels,
}

#[async_trait]
pub trait ServerStarter: Send + Sync {
    async fn start(&self, project_root: &Path) -> Result<StartedServer>;
}

/// Spawns the configured command with stdio pipes
pub struct ProcessStarter {
    config: ServerConfig,
}

impl ProcessStarter {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Check if the language server command is available
    pub fn is_available(&self) -> bool {
        if self.config.command.is_empty() {
            return false;
        }

        let path = Path::new(&self.config.command);
        if path.is_absolute() {
            return path.is_file();
        }
        which::which(&self.config.command).is_ok()
    }
}

#[async_trait]
impl ServerStarter for ProcessStarter {
    async fn start(&self, project_root: &Path) -> Result<StartedServer> {
        let spawn_error = |reason: String| BridgeError::Spawn {
            root: project_root.to_path_buf(),
            reason,
        };

        if !self.is_available() {
            return Err(spawn_error(format!(
                "'{}' not found in PATH",
                self.config.command
            )));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(project_root)
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("no stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, self.config.command.clone());
        }

        tracing::info!(
            "Started {} (pid {:?}) for {}",
            self.config.command,
            child.id(),
            project_root.display()
        );

        Ok(StartedServer {
            process: Box::new(ChildProcess { child }),
            transport: spawn_framed(stdout, stdin),
        })
    }
}

/// A spawned child process
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ServerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.child.wait()).await, Ok(Ok(_)))
    }

    async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && self.wait_for_exit(grace).await
            {
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::debug!("Failed to kill language server: {}", e);
        }
    }
}
