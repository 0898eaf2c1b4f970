//! tdl command line.
//!
//! Storage administration commands on top of the tdl library: list
//! namespaces, back up, recover and move the session store between drivers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;

use tdl::migrate;
use tdl::session::{Proxy, SessionConfig};
use tdl::shell::{parse_duration, resolve_home, Context, Shell, ShellSettings};
use tdl::storage::{StorageConfig, DEFAULT_NAMESPACE};
use tdl::{Cancellation, TdlError, TdlResult};

#[derive(Debug, Parser)]
#[command(name = "tdl", version, about = "Session storage toolkit")]
struct Cli {
    /// Storage options, e.g. `driver=sorted,path=/tmp/tdl`
    #[arg(long, global = true, env = "TDL_STORAGE", value_parser = StorageConfig::parse)]
    storage: Option<StorageConfig>,

    /// Namespace holding the account's session
    #[arg(short = 'n', long = "ns", global = true, env = "TDL_NS", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// SOCKS5 proxy, `socks5://[user:pass@]host:port`
    #[arg(long, global = true, env = "TDL_PROXY")]
    proxy: Option<Proxy>,

    /// NTP host used instead of the system clock
    #[arg(long, global = true, env = "TDL_NTP")]
    ntp: Option<String>,

    /// How long to keep reconnecting; 0 retries forever
    #[arg(long, global = true, env = "TDL_RECONNECT_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    reconnect_timeout: Duration,

    /// Debug logging, also written to a daily log file
    #[arg(long, global = true, env = "TDL_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage namespaces
    Namespace {
        #[command(subcommand)]
        action: NamespaceCommand,
    },
    /// Write every namespace to a backup file
    Backup {
        /// Destination file; defaults to a timestamped name
        #[arg(short = 'd', long = "dst")]
        dst: Option<PathBuf>,
    },
    /// Import a backup file
    Recover {
        /// Backup file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Copy the current store into another storage configuration
    Migrate {
        /// Target storage options, e.g. `driver=legacy,path=/tmp/kv`
        #[arg(long, value_parser = StorageConfig::parse)]
        to: StorageConfig,
    },
}

#[derive(Debug, Subcommand)]
enum NamespaceCommand {
    /// List namespaces
    Ls,
}

impl Cli {
    fn settings(&self) -> TdlResult<ShellSettings> {
        let mut settings = ShellSettings::new(resolve_home()?);
        settings.storage = self.storage.clone();
        settings.verbose = self.debug;
        settings.session = SessionConfig {
            namespace: self.namespace.clone(),
            proxy: self.proxy.clone(),
            ntp: self.ntp.clone(),
            reconnect_timeout: self.reconnect_timeout,
        };
        Ok(settings)
    }
}

fn dispatch(command: Command, ctx: &Context) -> TdlResult<()> {
    match command {
        Command::Namespace {
            action: NamespaceCommand::Ls,
        } => {
            for name in ctx.engine.namespaces()? {
                println!("{name}");
            }
        }
        Command::Backup { dst } => {
            let dst = dst.unwrap_or_else(|| {
                PathBuf::from(format!(
                    "tdl-backup-{}.bak",
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                ))
            });
            let snapshot = migrate::backup(&ctx.engine, &dst)?;
            println!(
                "backed up {} namespaces to {}",
                snapshot.len(),
                dst.display()
            );
        }
        Command::Recover { file } => {
            let snapshot = migrate::recover(&ctx.engine, &file)?;
            println!(
                "recovered {} namespaces from {}",
                snapshot.len(),
                file.display()
            );
        }
        Command::Migrate { to } => {
            let snapshot = migrate::copy_to(&ctx.engine, &to)?;
            println!("copied {} namespaces to {to}", snapshot.len());
        }
    }
    Ok(())
}

fn run(cli: Cli, cancel: Cancellation) -> TdlResult<()> {
    let settings = cli.settings()?;
    let shell = Shell::start(settings, cancel)?;
    shell.run(|ctx| dispatch(cli.command, ctx))
}

fn report(err: &TdlError, debug: bool) -> ExitCode {
    if err.is_cancelled() {
        eprintln!("interrupted");
        return ExitCode::from(130);
    }
    if debug {
        eprintln!("Error: {err:?}");
    } else {
        eprintln!("Error: {err}");
    }
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let debug = cli.debug;

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });

    match tokio::task::spawn_blocking(move || run(cli, cancel)).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => report(&err, debug),
        Err(join_err) => {
            eprintln!("Error: command aborted: {join_err}");
            ExitCode::FAILURE
        }
    }
}
