//! Command-line front end.
//!
//! Builds the inbound values for one delivery run, picks the transport and
//! maps the outcome to an exit code. All delivery decisions are made by the
//! orchestrator.

use crate::config::{load_config, DeliverConfig, TransportKind};
use crate::report::{exit_code, render_summary, write_report, EXIT_INVALID_INPUT};
use anyhow::{Context, Result};
use chrono::Datelike;
use clap::Parser;
use deliver_scp::delivery::{
    AuthSecret, Credentials, DeliveryRequest, LogSink, OpenSshConnector, Ssh2Connector,
    TransferOrchestrator, TransferOutcome, TransportConnector,
};
use std::io::BufRead;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "DELIVER_PASSWORD";
pub const PASSPHRASE_ENV: &str = "DELIVER_KEY_PASSPHRASE";

/// Copy a file, directory or wildcard selection to a remote host over SSH.
#[derive(Debug, Parser)]
#[command(name = "deliver", version, about)]
pub struct Cli {
    /// File, directory, or glob pattern (`*`, `?`) to deliver
    pub source: String,

    /// Remote host name or address
    #[arg(long)]
    pub host: Option<String>,

    /// SSH port
    #[arg(long)]
    pub port: Option<u16>,

    /// Remote user name
    #[arg(long = "user")]
    pub username: Option<String>,

    /// Remote base directory
    #[arg(long)]
    pub base_dir: Option<String>,

    /// Subdirectory below the base directory
    #[arg(long, conflicts_with = "current_year")]
    pub subdir: Option<String>,

    /// Use the current year as the subdirectory
    #[arg(long)]
    pub current_year: bool,

    /// Private key file; the passphrase is read from DELIVER_KEY_PASSPHRASE
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Read the password from the first line of stdin instead of DELIVER_PASSWORD
    #[arg(long)]
    pub password_stdin: bool,

    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Configuration file (default: <config dir>/deliver/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the outcome as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Exit 0 even when some items failed
    #[arg(long)]
    pub allow_partial: bool,

    /// Accept `..` segments in the subdirectory
    #[arg(long)]
    pub allow_traversal: bool,
}

/// Everything needed to start one run.
struct Job {
    request: DeliveryRequest,
    config: DeliverConfig,
    report: Option<PathBuf>,
}

/// Entry point shared by `main` and tests. Returns the process exit code.
pub async fn run(cli: Cli) -> u8 {
    let job = match prepare(cli, |name| std::env::var(name).ok(), read_stdin_line) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("deliver: {:#}", e);
            return EXIT_INVALID_INPUT;
        }
    };

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling delivery");
            watcher.cancel();
        }
    });

    let Job {
        request,
        config,
        report,
    } = job;
    let outcome = match config.transport {
        TransportKind::Ssh2 => {
            let connector = Ssh2Connector::new(config.connection.clone());
            deliver_with(connector, &config, request, &cancel).await
        }
        TransportKind::OpenSsh => {
            let connector = OpenSshConnector::new(config.connection.clone());
            deliver_with(connector, &config, request, &cancel).await
        }
    };

    print!("{}", render_summary(&outcome));
    if let Some(path) = &report {
        if let Err(e) = write_report(path, &outcome) {
            tracing::error!("{:#}", e);
        }
    }
    let code = exit_code(&outcome, config.allow_partial);
    tracing::info!(run_id = %outcome.run_id, status = %outcome.status, code, "Delivery finished");
    code
}

async fn deliver_with<C: TransportConnector>(
    connector: C,
    config: &DeliverConfig,
    request: DeliveryRequest,
    cancel: &CancellationToken,
) -> TransferOutcome {
    TransferOrchestrator::new(connector)
        .with_options(config.delivery_options())
        .run(request, &LogSink, cancel)
        .await
}

/// Merge config file and flags, and collect the secret.
fn prepare<E, S>(cli: Cli, env: E, stdin_line: S) -> Result<Job>
where
    E: Fn(&str) -> Option<String>,
    S: FnOnce() -> Result<Zeroizing<String>>,
{
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if cli.allow_partial {
        config.allow_partial = true;
    }
    if cli.allow_traversal {
        config.reject_traversal = false;
    }

    let host = cli.host.or_else(|| config.host.clone()).unwrap_or_default();
    let username = cli
        .username
        .or_else(|| config.username.clone())
        .unwrap_or_default();
    let base_dir = cli.base_dir.unwrap_or_else(|| config.base_dir.clone());
    let subdir = if cli.current_year {
        chrono::Local::now().year().to_string()
    } else {
        cli.subdir.unwrap_or_default()
    };

    let identity = cli.identity.or_else(|| config.identity_file.clone());
    let secret = if cli.password_stdin {
        let line = stdin_line()?;
        AuthSecret::password(line.trim_end_matches(&['\r', '\n'][..]).to_string())
    } else if let Some(password) = env(PASSWORD_ENV) {
        AuthSecret::password(Zeroizing::new(password).as_str())
    } else if let Some(path) = identity {
        AuthSecret::key_file(path, env(PASSPHRASE_ENV))
    } else {
        // Empty secret; rejected by the orchestrator as invalid input.
        AuthSecret::password(String::new())
    };

    let credentials = Credentials::new(host, username, secret).with_port(config.port);
    Ok(Job {
        request: DeliveryRequest {
            source_spec: cli.source,
            credentials,
            remote_base_dir: base_dir,
            subdir_token: subdir,
        },
        config,
        report: cli.report,
    })
}

fn read_stdin_line() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line)
}
