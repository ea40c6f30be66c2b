use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use langbridge::config::Config;
use langbridge::events::NotificationLevel;
use langbridge::lsp::protocol::PublishDiagnosticsParams;
use langbridge::lsp::ProcessStarter;
use langbridge::manager::{ServerManager, ServerRecord};
use langbridge::workspace::Workspace;

#[derive(Parser)]
#[command(name = "langbridge")]
#[command(about = "Keep language servers in sync with open documents", long_about = None)]
struct Cli {
    /// Use this configuration file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open files against the configured language server and report what it says
    Open {
        /// Workspace root (default: current directory)
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// How long to wait for diagnostics, in milliseconds
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
        /// Files to open
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Inspect or create the configuration file
    Config {
        /// Show the effective configuration
        #[arg(short, long)]
        show: bool,
        /// Write the default configuration if no file exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "langbridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let initializing = matches!(cli.command, Commands::Config { init: true, .. });
    let config = match &cli.config {
        Some(path) if initializing && !path.exists() => Config::default(),
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Open { root, wait_ms, files } => {
            run_open(config, root, files, Duration::from_millis(wait_ms)).await?;
        }
        Commands::Config { show, init } => {
            handle_config(&config, cli.config, show, init)?;
        }
    }

    Ok(())
}

async fn run_open(config: Config, root: PathBuf, files: Vec<PathBuf>, wait: Duration) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Workspace root not found: {}", root.display()))?;

    let starter = ProcessStarter::new(config.server.clone());
    if !starter.is_available() {
        anyhow::bail!(
            "Language server '{}' is not installed or not in PATH",
            config.server.command
        );
    }

    let workspace = Workspace::new(&root);
    let manager = ServerManager::new(config, Arc::clone(&workspace), Arc::new(starter));

    let mut notifications = manager.subscribe_notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            let prefix = match notification.level {
                NotificationLevel::Error => "error",
                NotificationLevel::Warning => "warning",
                NotificationLevel::Info => "info",
            };
            eprintln!("[{}] {}", prefix, notification.message);
            if let Some(detail) = notification.detail {
                eprintln!("        {}", detail);
            }
        }
    });

    let diagnostics: Arc<Mutex<BTreeMap<String, usize>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let mut records: Vec<Arc<ServerRecord>> = Vec::new();
    let mut diagnostic_subscriptions = Vec::new();
    let mut views = Vec::new();

    for file in &files {
        let buffer = workspace
            .open_buffer(file)
            .await
            .with_context(|| format!("Failed to open {}", file.display()))?;
        let view = workspace.open_view(&buffer);

        let Some(record) = manager.view_opened(&view).await? else {
            println!("{}: not handled by {}", file.display(), manager.config().server.command);
            continue;
        };

        if !records.iter().any(|r| Arc::ptr_eq(r, &record)) {
            let sink = Arc::clone(&diagnostics);
            diagnostic_subscriptions.push(record.connection().on_notification(
                "textDocument/publishDiagnostics",
                move |params| {
                    if let Ok(params) = serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
                        if let Ok(mut sink) = sink.lock() {
                            sink.insert(params.uri, params.diagnostics.len());
                        }
                    }
                },
            ));
            records.push(record);
        }
        views.push(view);
    }

    tokio::time::sleep(wait).await;

    for record in &records {
        print_record(record);
    }

    println!("\nDiagnostics:");
    if let Ok(diagnostics) = diagnostics.lock() {
        if diagnostics.is_empty() {
            println!("  (none received)");
        }
        for (uri, count) in diagnostics.iter() {
            println!("  {}: {}", uri, count);
        }
    }

    for view in &views {
        workspace.close_view(view.id());
        manager.view_closed(view.id());
    }
    manager.stop_all_servers().await;
    Ok(())
}

fn print_record(record: &ServerRecord) {
    let name = record
        .server_info()
        .map(|info| match &info.version {
            Some(version) => format!("{} {}", info.name, version),
            None => info.name.clone(),
        })
        .unwrap_or_else(|| "unknown server".to_string());

    println!("{} (pid {:?})", name, record.pid());
    println!("  Project root: {}", record.project_root().display());

    let behaviors = record.behaviors();
    println!("  Open/close: {}", behaviors.open_close);
    println!("  Changes: {:?}", behaviors.change);
    println!("  Will save: {:?}", behaviors.will_save);
    println!("  Save: {:?}", behaviors.save);

    let capabilities = record.capabilities();
    let features = [
        ("hover", capabilities.hover_provider.is_some()),
        ("completion", capabilities.completion_provider.is_some()),
        ("outline", capabilities.document_symbol_provider.is_some()),
        ("formatting", capabilities.document_formatting_provider.is_some()),
        ("code actions", capabilities.code_action_provider.is_some()),
        ("definition", capabilities.definition_provider.is_some()),
    ];
    let supported: Vec<&str> = features
        .iter()
        .filter(|(_, supported)| *supported)
        .map(|(name, _)| *name)
        .collect();
    println!("  Features: {}", supported.join(", "));
}

fn handle_config(config: &Config, explicit_path: Option<PathBuf>, show: bool, init: bool) -> Result<()> {
    let path = match explicit_path {
        Some(path) => path,
        None => Config::config_path()?,
    };

    if init {
        if path.exists() {
            println!("Configuration already exists at {}", path.display());
        } else {
            config.save_to(&path)?;
            println!("✓ Wrote default configuration to {}", path.display());
        }
    }

    if show || !init {
        println!("Configuration file: {}", path.display());
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}
