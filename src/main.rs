use clap::Parser;
use repsnap::config::Config;
use repsnap::error::{BackupError, ErrorSeverity};
use repsnap::utils::format_duration;
use repsnap::RepSnap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repsnap")]
#[command(about = "Snapshot one member of a MongoDB replica set under an fsync lock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// mongodb://<user>:<password>@<host>[:<port>][,...]/<database>[?<key>=<value>[&...]]
    connection_string: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot executable, overriding the configured one
    #[arg(long)]
    snapshot_command: Option<PathBuf>,

    /// Discover and select the target, then stop without locking anything
    #[arg(long)]
    dry_run: bool,

    /// Log level, overriding the configured one
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };
    init_logging(&config);

    info!("Starting repsnap v{}", env!("CARGO_PKG_VERSION"));
    let repsnap = RepSnap::new(&config);

    let result = if cli.dry_run {
        dry_run(&repsnap, &cli.connection_string).await
    } else {
        backup(&repsnap, &cli.connection_string).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.severity() {
                ErrorSeverity::Critical => error!("[{}] {}", e.severity(), e),
                ErrorSeverity::Error => error!("{}", e),
                ErrorSeverity::Warning => warn!("{}", e),
            }
            if let BackupError::Snapshot { output, .. } = &e {
                eprintln!("{}", output);
            }
            eprintln!("✗ {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, BackupError> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    if let Some(command) = &cli.snapshot_command {
        config.snapshot.command = command.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn dry_run(repsnap: &RepSnap, connection_string: &str) -> Result<(), BackupError> {
    let plan = repsnap.plan(connection_string).await?;

    println!("Primary: {}", plan.topology.primary());
    println!("Secondaries:");
    for (host, member) in plan.topology.secondaries() {
        println!("  {} (priority {})", host, member.priority);
    }
    println!("Would back up: {}", plan.target.host_port());
    Ok(())
}

async fn backup(repsnap: &RepSnap, connection_string: &str) -> Result<(), BackupError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    tokio::spawn(listen_for_signals(signal_tx));
    tokio::spawn(async move {
        if escalate_signals(signal_rx, shutdown_tx).await {
            error!("Second shutdown signal received, exiting without waiting for the unlock; the target may still be fsync-locked");
            std::process::exit(i32::from(BackupError::interrupted("unlocking").exit_code()));
        }
    });

    let report = repsnap.run(connection_string, shutdown_rx).await?;

    println!("✓ Backup of {} completed in {}", report.target, format_duration(report.elapsed));
    if !report.snapshot.output.is_empty() {
        println!("{}", report.snapshot.output.trim_end());
    }
    Ok(())
}

/// The first signal asks for a clean stop. Returns `true` on a second one.
async fn escalate_signals(
    mut signals: mpsc::UnboundedReceiver<()>,
    shutdown_tx: watch::Sender<bool>,
) -> bool {
    if signals.recv().await.is_none() {
        return false;
    }
    warn!("Shutdown signal received, finishing with unlock (send again to exit immediately)");
    let _ = shutdown_tx.send(true);
    signals.recv().await.is_some()
}

/// Forward every SIGINT/SIGTERM until the receiver goes away
#[cfg(unix)]
async fn listen_for_signals(signals: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            None
        }
    };
    loop {
        match terminate.as_mut() {
            Some(terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            },
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        if signals.send(()).is_err() {
            return;
        }
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(signals: mpsc::UnboundedSender<()>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if signals.send(()).is_err() {
            return;
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Logging initialized at level: {}", config.logging.level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_signal_requests_shutdown() {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        signal_tx.send(()).unwrap();
        drop(signal_tx);

        assert!(!escalate_signals(signal_rx, shutdown_tx).await);
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_second_signal_escalates() {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        signal_tx.send(()).unwrap();
        signal_tx.send(()).unwrap();

        assert!(escalate_signals(signal_rx, shutdown_tx).await);
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_no_signal_leaves_run_alone() {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<()>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(signal_tx);

        assert!(!escalate_signals(signal_rx, shutdown_tx).await);
        assert!(!*shutdown_rx.borrow());
    }
}
