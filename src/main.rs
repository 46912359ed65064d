//! Binary entrypoint: parses the CLI, loads configuration, and runs the
//! RFC 2136 UPDATE/TSIG gateway until a termination signal arrives.
//!
//! Try it against a running instance, e.g.:
//!
//!   dig @127.0.0.1 -p 5353 A host.example.com
//!   dig @127.0.0.1 -p 5353 +tcp AXFR example.com -y hmac-sha256:key.example.:<secret>

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

mod client;
mod config;
mod error;
mod fqdn;
mod logger;
mod rule;
mod service;
mod upstream;

#[derive(Parser)]
#[command(name = "dnsgateway", version, about = "RFC 2136 UPDATE/TSIG to AdBlock/REST gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Loads configuration and serves RFC 2136 UPDATE/TSIG traffic.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// YAML config file to layer on top of the `DG_`-prefixed env vars.
    /// Repeat to layer several files; later files win.
    #[arg(long = "config")]
    config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => start(args).await,
    }
}

async fn start(args: StartArgs) {
    let config = match config::Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            exit(1);
        }
    };

    logger::Logger::new()
        .with_level(config.log.level)
        .init()
        .expect("logger already initialized");

    if config.listener.kind == config::ListenerKind::None {
        log::info!(target: "main", "listener.kind is none, nothing to serve");
        return;
    }

    let clients = match config.client_registry() {
        Ok(c) => c,
        Err(e) => {
            log::error!(target: "main", "invalid client configuration: {e}");
            exit(1);
        }
    };
    let keystore = match service::tsig::build_keystore(&clients) {
        Ok(k) => k,
        Err(e) => {
            log::error!(target: "main", "invalid tsig keystore: {e}");
            exit(1);
        }
    };
    let upstream = match config.upstream() {
        Ok(u) => u,
        Err(e) => {
            log::error!(target: "main", "invalid upstream configuration: {e}");
            exit(1);
        }
    };

    let pipeline = Arc::new(service::Pipeline::new(clients, keystore, upstream));
    let rfc2136 = &config.listener.rfc2136;

    let result = service::run(&rfc2136.addr, &rfc2136.nets, pipeline, shutdown_signal()).await;
    if let Err(e) = result {
        log::error!(target: "main", "listener failed: {e}");
        exit(1);
    }
}

/// Resolves once on SIGINT, or on SIGTERM where supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
