//! Dockside - Entry Point
//!
//! Runs the orchestrator as a service, or a single command against the
//! fleet registry of this server.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use dockside::app::commands;
use dockside::app::options::AppOptions;
use dockside::app::run::run;
use dockside::app::state::AppState;
use dockside::errors::OrchestratorError;
use dockside::logs::{init_logging, LogOptions};
use dockside::storage::layout::StorageLayout;
use dockside::storage::settings::Settings;
use dockside::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, defaults when absent
    let settings_file = layout.settings_file();
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings, layout);
    let result = match command(&cli_args) {
        Some(cmd) => run_command(cmd, &settings, &options).await,
        None => {
            info!("Running Dockside with options: {:?}", options);
            run(version.version, options, await_shutdown_signal()).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Dockside failed: {e}");
            ExitCode::FAILURE
        }
    }
}

enum Command {
    Deploy(String),
    Stop(String),
    Logs(String),
    Routes,
}

fn command(cli_args: &HashMap<String, String>) -> Option<Command> {
    if let Some(id) = cli_args.get("deploy") {
        return Some(Command::Deploy(id.clone()));
    }
    if let Some(id) = cli_args.get("stop") {
        return Some(Command::Stop(id.clone()));
    }
    if let Some(id) = cli_args.get("logs") {
        return Some(Command::Logs(id.clone()));
    }
    cli_args.contains_key("routes").then_some(Command::Routes)
}

async fn run_command(
    cmd: Command,
    settings: &Settings,
    options: &AppOptions,
) -> Result<(), OrchestratorError> {
    let state = AppState::init(options).await?;
    let result = match cmd {
        Command::Deploy(id) => {
            let deployment =
                commands::deploy(&state, &settings.namespace, &id, await_shutdown_signal()).await?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
            Ok(())
        }
        Command::Stop(id) => commands::stop(&state, &id).await,
        Command::Logs(id) => commands::logs(&state, &id, await_shutdown_signal()).await,
        Command::Routes => {
            let table = commands::routes(&state).await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
            Ok(())
        }
    };
    state.shutdown().await?;
    result
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
