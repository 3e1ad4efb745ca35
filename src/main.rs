use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;

use drover_bridge::cli::{Cli, Command, render_config_human, render_config_json};
use drover_bridge::config::BridgeConfig;
use drover_bridge::hub::BroadcastHub;
use drover_bridge::registry::PidRegistry;
use drover_bridge::scheduler::{BridgeLauncher, RunScheduler};
use drover_bridge::server::{self, AppState};
use drover_bridge::store::{RecordStore, SqliteStore};
use drover_bridge::{foreground, paths, shell_completion};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "drover=warn,drover_bridge=warn",
        0 => "drover=info,drover_bridge=info",
        1 => "drover=debug,drover_bridge=debug",
        _ => "drover=trace,drover_bridge=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = BridgeConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .drover/config.toml found, using defaults"),
        }
    }

    let state_dir = paths::resolve_state_dir(&cwd, &config.storage);

    match cli.command {
        Command::Serve { host, port } => serve(config, &state_dir, host, port).await,
        Command::Run {
            job,
            job_file,
            run_id,
        } => {
            let job = resolve_job(job.as_deref(), job_file.as_deref())?;
            let run_id = run_id.unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));
            let ok = foreground::run(&config, &state_dir, run_id, job).await?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Recover => recover(&state_dir),
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            Ok(())
        }
        Command::Completions { shell } => shell_completion::print(shell),
    }
}

async fn serve(
    config: BridgeConfig,
    state_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut server_settings = config.server.clone();
    if let Some(host) = host {
        server_settings.host = host;
    }
    if let Some(port) = port {
        server_settings.port = port;
    }

    let hub = Arc::new(BroadcastHub::new());
    let registry = Arc::new(PidRegistry::open(paths::registry_file(state_dir)));
    for (run_id, pid) in registry.recover() {
        info!(run_id, pid, "terminated orphaned child from previous server");
    }

    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteStore::open(&paths::database_file(state_dir)).context("failed to open run store")?,
    );

    let launcher = BridgeLauncher {
        session: config.session.clone(),
        classifier: config.classifier.clone(),
        hub: hub.clone(),
        registry: registry.clone(),
        log_dir: paths::log_dir(state_dir),
    };
    let scheduler = RunScheduler::new(
        config.scheduler.clone(),
        launcher,
        hub.clone(),
        registry,
        store,
    );

    let state = Arc::new(AppState { scheduler, hub });
    server::serve(&server_settings, state).await
}

fn recover(state_dir: &Path) -> Result<()> {
    let registry = PidRegistry::open(paths::registry_file(state_dir));
    let swept = registry.recover();
    if swept.is_empty() {
        println!("No orphaned children found.");
    } else {
        for (run_id, pid) in swept {
            println!("terminated {run_id} (pid {pid})");
        }
    }
    Ok(())
}

fn resolve_job(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    if let Some(text) = inline {
        return serde_json::from_str(text).context("failed to parse --job as JSON");
    }
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {} as JSON", path.display()));
    }
    Ok(Value::Null)
}
