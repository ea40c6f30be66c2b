use anyhow::Result;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use langbridge::config::Config;
use predicates::prelude::*;
use serial_test::serial;
use std::env;
use std::process::Command;

/// Points the config directory at a temp dir for the duration of a test
struct ConfigHome {
    dir: TempDir,
    previous: Option<String>,
}

impl ConfigHome {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let previous = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", dir.path());
        Ok(Self { dir, previous })
    }
}

impl Drop for ConfigHome {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => env::set_var("XDG_CONFIG_HOME", value),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}

#[tokio::test]
#[serial]
async fn test_config_load_default() -> Result<()> {
    let _home = ConfigHome::new()?;

    let config = Config::load()?;

    assert_eq!(config.server.command, "typescript-language-server");
    assert_eq!(config.lifecycle.max_restarts, 5);
    assert_eq!(config.sync.will_save_wait_until_timeout_ms, 500);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_config_save_and_load() -> Result<()> {
    let home = ConfigHome::new()?;

    let mut config = Config::default();
    config.server.command = "rust-analyzer".to_string();
    config.server.language_ids = vec!["rust".to_string()];
    config.lifecycle.max_restarts = 1;
    config.save()?;

    home.dir
        .child("langbridge/config.toml")
        .assert(predicate::str::contains("rust-analyzer"));

    let loaded = Config::load()?;
    assert_eq!(loaded.server.command, "rust-analyzer");
    assert_eq!(loaded.server.language_ids, vec!["rust".to_string()]);
    assert_eq!(loaded.lifecycle.max_restarts, 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_invalid_config_is_an_error() -> Result<()> {
    let home = ConfigHome::new()?;
    home.dir
        .child("langbridge/config.toml")
        .write_str("[lifecycle]\nmax_restarts = \"many\"\n")?;

    let err = Config::load().unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));

    Ok(())
}

#[test]
#[serial]
fn test_cli_config_init_writes_defaults() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.child("custom.toml");

    let output = Command::new(env!("CARGO_BIN_EXE_langbridge"))
        .arg("--config")
        .arg(path.path())
        .args(["config", "--init"])
        .output()?;
    assert!(output.status.success());

    path.assert(predicate::path::exists());
    let written = Config::load_from(path.path())?;
    assert_eq!(written.server.command, Config::default().server.command);

    // A second init leaves the file alone
    let output = Command::new(env!("CARGO_BIN_EXE_langbridge"))
        .arg("--config")
        .arg(path.path())
        .args(["config", "--init"])
        .output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("already exists"));

    Ok(())
}
