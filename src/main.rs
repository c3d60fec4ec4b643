// src/main.rs

//! The main entry point for the OpalD cluster management service.

use anyhow::Result;
use opald::config::{Config, ManagerAddr, Role};
use opald::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("OpalD version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a
    // --config flag; without one the built-in defaults apply.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };

    // Apply command-line overrides: role, bind port, and peer list.
    if let Some(i) = args.iter().position(|arg| arg == "--role") {
        match args.get(i + 1).and_then(|s| Role::parse(s)) {
            Some(role) => config.role = role,
            None => {
                eprintln!("--role requires one of: server, supervisor, manager");
                std::process::exit(EXIT_CONFIG);
            }
        }
    }
    if let Some(i) = args.iter().position(|arg| arg == "--port") {
        match args.get(i + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) if port != 0 => config.port = port,
            _ => {
                eprintln!("--port requires a valid port number");
                std::process::exit(EXIT_CONFIG);
            }
        }
    }
    for (i, arg) in args.iter().enumerate() {
        if arg == "--manager" {
            let Some(spec) = args.get(i + 1) else {
                eprintln!("--manager requires host:port");
                std::process::exit(EXIT_CONFIG);
            };
            let Some((host, port)) = spec.rsplit_once(':') else {
                eprintln!("--manager requires host:port, got \"{spec}\"");
                std::process::exit(EXIT_CONFIG);
            };
            let Ok(port) = port.parse::<u16>() else {
                eprintln!("invalid manager port in \"{spec}\"");
                std::process::exit(EXIT_CONFIG);
            };
            config.managers.hosts.push(ManagerAddr {
                host: host.to_string(),
                port,
            });
        }
    }

    // Overrides may have changed role/manager consistency; re-validate.
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        std::process::exit(EXIT_CONFIG);
    }

    // Setup logging with compact format and ANSI colors.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        if e.downcast_ref::<server::BindError>().is_some() {
            error!("{:#}", e);
            std::process::exit(EXIT_BIND);
        }
        error!("Server runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
