//! Arbor Server Daemon
//!
//! The `arbord` binary:
//! - Configures the broker pool through a shutdown coordinator
//! - Registers library modules and serves queries over TCP
//! - On SIGTERM/SIGINT shuts every pool down, then stops the listener once
//!   the last pool reports that no instance remains
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8088, in-memory storage)
//! arbord
//!
//! # Larger pool, custom port
//! arbord --max-brokers 40 --port 9000
//!
//! # Use a configuration file
//! arbord --config /etc/arbor/arbord.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbor_broker::ShutdownCoordinator;
use arbor_server::config::ServerConfig;
use arbor_server::server::StatusServer;
use arbor_xquery::XQueryService;

/// Arbor Server Daemon
#[derive(Parser, Debug)]
#[command(
    name = "arbord",
    version,
    about = "Arbor XML database server",
    long_about = "Arbor is an embedded native XML database.\n\n\
                  This daemon configures the broker pool and listens for query connections."
)]
struct Args {
    /// Host address to bind to
    #[arg(short = 'H', long, env = "ARBOR_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "ARBOR_PORT")]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "ARBOR_CONFIG")]
    config: Option<PathBuf>,

    /// Brokers created at startup
    #[arg(long, env = "ARBOR_MIN_BROKERS")]
    min_brokers: Option<usize>,

    /// Upper bound on brokers
    #[arg(long, env = "ARBOR_MAX_BROKERS")]
    max_brokers: Option<usize>,

    /// Library module to register (repeatable)
    #[arg(short = 'm', long = "module", value_name = "FILE")]
    modules: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "ARBOR_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting arbord");

    if let Err(e) = run_server(config).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "arbord={level},arbor_server={level},arbor_broker={level},arbor_xquery={level}"
            ))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = if let Some(path) = &args.config {
        ServerConfig::from_file(path).context("Failed to load config file")?
    } else {
        ServerConfig::default()
    };

    // Command-line arguments win over the file.
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(min) = args.min_brokers {
        config.database.pool.min_brokers = min;
    }
    if let Some(max) = args.max_brokers {
        config.database.pool.max_brokers = max;
    }
    config.modules.extend(args.modules.iter().cloned());

    config.validate()?;
    Ok(config)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let pool = coordinator
        .configure(
            &config.pool_name,
            config.database.pool.min_brokers,
            config.database.pool.max_brokers,
            config.database.clone(),
        )
        .context("Failed to configure broker pool")?;

    let service = Arc::new(XQueryService::new(config.database.query.clone()));
    for path in &config.modules {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read module {}", path.display()))?;
        let namespace = service
            .register_module(&source)
            .with_context(|| format!("Failed to register module {}", path.display()))?;
        info!(module = %path.display(), %namespace, "registered library module");
    }

    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        pool = %config.pool_name,
        min_brokers = config.database.pool.min_brokers,
        max_brokers = config.database.pool.max_brokers,
        "broker pool configured"
    );

    let server = StatusServer::new(
        Arc::clone(&pool),
        Arc::clone(&service),
        config.query_timeout(),
        config.max_connections,
    );
    let stop = server.stop_handle();

    // Final teardown belongs to whoever sees the last pool go.
    let mut events = coordinator.subscribe();
    let grace = config.database.pool.shutdown_grace();
    let teardown = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                pool = %event.pool_name,
                remaining = event.remaining_instances,
                forced = event.forced,
                "broker pool stopped"
            );
            if event.remaining_instances == 0 {
                tokio::time::sleep(grace).await;
                stop.stop();
                break;
            }
        }
    });

    let mut serving = tokio::spawn(server.serve(listener));
    info!("Press Ctrl+C to shutdown");

    tokio::select! {
        result = &mut serving => {
            // The listener ended on its own; still shut the pools down.
            warn!("listener exited before shutdown was requested");
            stop_pools(&coordinator).await?;
            teardown.abort();
            return result.context("listener task failed")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    stop_pools(&coordinator).await?;
    teardown.await.context("teardown task failed")?;
    serving.await.context("listener task failed")??;

    let stats = pool.stats();
    info!(
        acquisitions = stats.acquisitions,
        timeouts = stats.timeouts,
        cached_queries = service.cache().len(),
        "Server stopped"
    );
    Ok(())
}

/// Shuts every pool down on a blocking thread, waiting for active brokers.
async fn stop_pools(coordinator: &Arc<ShutdownCoordinator>) -> Result<()> {
    let coordinator = Arc::clone(coordinator);
    let reports = tokio::task::spawn_blocking(move || coordinator.stop_all(true))
        .await
        .context("shutdown task failed")?;

    for report in reports {
        if report.forced {
            warn!(
                pool = %report.pool_name,
                abandoned = report.abandoned.len(),
                elapsed = ?report.elapsed,
                "pool shutdown forced"
            );
        } else {
            info!(
                pool = %report.pool_name,
                closed = report.closed_brokers,
                elapsed = ?report.elapsed,
                "pool shut down"
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
