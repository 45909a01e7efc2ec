//! sqlservice binary: serves the HTTP API or runs database commands.
//!
//! ```text
//! sqlservice [--config PATH] [serve]
//! sqlservice [--config PATH] sql create-all [--key KEY]
//! sqlservice [--config PATH] sql drop-all [--key KEY]
//! ```

use clap::{Parser, Subcommand};
use sqlservice_server::{cli, config, default_catalog, Application, SqlService};
use std::net::SocketAddr;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "sqlservice", version, about = "SQL database service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "SQLSERVICE_CONFIG_PATH", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Database command group, e.g. `sql create-all`.
    #[command(external_subcommand)]
    Group(Vec<String>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load_config(Some(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);
    tracing::info!(path = %cli.config, "resolved startup configuration path");

    match run(cli.command.unwrap_or(Command::Serve), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "sqlservice failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(command: Command, config: config::Config) -> Result<(), BoxError> {
    let mut app = Application::new(config);
    SqlService::builder()
        .catalog(default_catalog())
        .init_app(&mut app)?;

    match command {
        Command::Serve => serve(app).await,
        Command::Group(mut args) => {
            if args.is_empty() {
                return Err("missing command group".into());
            }
            let group = args.remove(0);
            let outcomes =
                tokio::task::spawn_blocking(move || cli::run_group_command(&app, &group, args))
                    .await??;
            for outcome in outcomes {
                println!(
                    "{}: {:?} ({} tables)",
                    outcome.key, outcome.command, outcome.tables
                );
            }
            Ok(())
        }
    }
}

async fn serve(app: Application) -> Result<(), BoxError> {
    let tables = sqlservice_server::prepare_kv_store(&app)?;
    tracing::info!(tables, "key/value store ready");

    let router = sqlservice_server::app(&app);
    let addr = SocketAddr::new(app.config().server.host, app.config().server.port);

    tracing::info!(%addr, "starting sqlservice server");

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("sqlservice server shut down");
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
