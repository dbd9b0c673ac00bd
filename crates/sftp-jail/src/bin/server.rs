//! SFTP jail server binary
//!
//! Run with: cargo run --bin sftp-jail-server -- --config /etc/sftp-jail/config.toml

use anyhow::{Context, Result};
use clap::Parser;
use sftp_jail::{
    load_host_key, ssh_config, AccountStore, AuthorizedKeys, Config, LogFormat, Server,
    SshTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML, or JSON when it ends in .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(log_format) = args.log_format {
        config.logging.format = log_format;
    }
    if let Some(log_file) = args.log_file {
        config.logging.file = Some(log_file);
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    // dropping the guard flushes buffered file logs
    let _log_guard = init_logging(&config)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting SFTP jail server"
    );

    config.validate().context("Invalid configuration")?;
    config
        .prepare_sandboxes()
        .context("Failed to prepare sandbox directories")?;

    let authorized_keys = match &config.authorized_keys_path {
        Some(path) => AuthorizedKeys::load(path)
            .with_context(|| format!("Failed to load authorized keys from {:?}", path))?,
        None => AuthorizedKeys::empty(),
    };

    info!(
        event = "server_configuration",
        address = %config.listen_addr(),
        base_path = ?config.base_path,
        accounts = config.accounts.len(),
        authorized_keys = authorized_keys.count(),
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "SFTP jail configuration"
    );

    let host_key = load_host_key(&config.host_key_path).context("Failed to load host key")?;
    let identities = Arc::new(AccountStore::new(config.accounts.clone(), authorized_keys));
    let transport = SshTransport::new(
        ssh_config(&config.server_id, host_key),
        identities,
        Arc::new(config.sandbox()),
    );

    let server = Server::new(config.listen_addr(), transport);
    let listener = server.bind().await.context("Failed to start listener")?;

    server
        .serve(listener, async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(event = "server_shutdown", "SFTP jail server shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("Invalid log level {:?}", config.logging.level))?;

    let Some(log_file) = &config.logging.file else {
        match config.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file path has no file name: {:?}", log_file))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {:?}", directory))?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .init(),
    }

    Ok(Some(guard))
}
