//! Spectre TCP load balancer - main entry point

use std::process;

use clap::{Parser, error::ErrorKind};
use log::{error, info};

use spectre_config::{config::Config, validator::validate as validate_config};
use spectre_edge::{Acceptor, AcceptorOptions};
use spectre_lb::BackendSet;

#[derive(Parser)]
#[command(version, about = "Round-robin TCP load balancer", long_about = None)]
struct Cli {
    /// Port to accept clients on
    port: u16,

    /// YAML config file; built-in defaults are used without it
    #[arg(short, long)]
    config: Option<String>,
}

/// `--help`/`--version` exit 0, every usage error exits 1.
fn usage_exit_code(err: &clap::Error) -> i32 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(usage_exit_code(&err));
        }
    }
}

/// Reports a startup failure on stderr and in the log, then exits 1.
fn fatal(message: String) -> ! {
    eprintln!("{}", message);
    error!("{}", message);
    process::exit(1);
}

fn load_config(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => match spectre_config::loader::read_config(path) {
            Ok(cfg) => cfg,
            Err(err_msg) => {
                eprintln!("Error loading config: {}", err_msg);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    config.listen.port = u32::from(cli.port);
    config
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() {
    let cli = parse_cli();
    let config = load_config(&cli);

    if let Err(err) = spectre_utils::logger::init_logger(&config.log.level, config.log.file.as_deref())
    {
        eprintln!("Error initializing logger: {}", err);
        process::exit(1);
    }

    if !validate_config(&config) {
        fatal("Configuration validation failed. Exiting...".to_string());
    }

    let backends = match BackendSet::from_config(config.backends.as_slice()) {
        Ok(backends) => backends,
        Err(err) => fatal(format!("Invalid backend list: {}", err)),
    };

    let options = match AcceptorOptions::from_config(&config) {
        Ok(options) => options,
        Err(err) => fatal(format!("Invalid relay settings: {}", err)),
    };

    info!("Spectre {} is starting", env!("CARGO_PKG_VERSION"));

    let acceptor = match Acceptor::bind(&config.listen.socket_address(), backends, options).await {
        Ok(acceptor) => acceptor,
        Err(err) => fatal(err.to_string()),
    };

    if let Err(err) = acceptor.run(shutdown_signal()).await {
        fatal(format!("Spectre stopped: {}", err));
    }

    info!("Spectre stopped");
}
