//! nsinit CLI - Run a command under an init process in new user and pid namespaces

use anyhow::{Context, bail};
use clap::{ArgAction, Parser, Subcommand};
use futures::StreamExt;
use nsinit_core::{
    CommandSpec, InitStatus, LaunchConfig, NamespaceExit, NamespaceHandle, NamespaceLauncher,
};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nsinit")]
#[command(author, version, about = "Run commands under an init process in fresh user and pid namespaces")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside new namespaces and wait for all its processes
    Run {
        /// Read the workload from a JSON file instead of the command line
        #[arg(short, long)]
        workload: Option<PathBuf>,

        /// Extra environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_env)]
        envs: Vec<(String, String)>,

        /// Start the workload with an empty environment
        #[arg(long)]
        clear_env: bool,

        /// Working directory of the workload
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Stack size for the init process in bytes (defaults to NSINIT_STACK_SIZE or 1 MiB)
        #[arg(long)]
        stack_size: Option<usize>,

        /// Terminate the namespace after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Seconds between SIGTERM and SIGKILL when terminating
        #[arg(long, default_value = "5")]
        grace: u64,

        /// Also create a new IPC namespace
        #[arg(long)]
        ipc: bool,

        /// Also create a new UTS namespace
        #[arg(long)]
        uts: bool,

        /// Print the supervisor report as JSON when done
        #[arg(long)]
        report: bool,

        /// Program and arguments
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Check whether this host lets the current user create namespaces
    Check,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "nsinit=info",
        1 => "nsinit=debug",
        _ => "nsinit=trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match cli.command {
        Commands::Check => {
            let report = nsinit_core::preflight::inspect_host();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.userns_allowed() {
                Ok(ExitCode::SUCCESS)
            } else {
                tracing::warn!("user namespaces look unavailable to this process");
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Run {
            workload,
            envs,
            clear_env,
            cwd,
            stack_size,
            timeout,
            grace,
            ipc,
            uts,
            report,
            command,
        } => {
            let mut spec = match workload {
                Some(path) => load_workload(&path)?,
                None => {
                    let Some((program, args)) = command.split_first() else {
                        bail!("no command given (pass one after `--` or use --workload)");
                    };
                    CommandSpec::new(program).args(args.iter().cloned())
                }
            };
            spec.env.extend(envs);
            spec.clear_env |= clear_env;
            if cwd.is_some() {
                spec.cwd = cwd;
            }

            let mut builder = LaunchConfig::builder()
                .new_ipc(ipc)
                .new_uts(uts)
                .terminate_grace(Duration::from_secs(grace));
            if let Some(bytes) = stack_size {
                builder = builder.stack_size(bytes);
            }

            // Launch while still single-threaded, before the runtime exists
            let handle = Arc::new(NamespaceLauncher::new(builder.build()).spawn(spec)?);
            tracing::info!(pid = handle.pid().as_raw(), "namespace running");

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let exit = runtime.block_on(supervise(handle, timeout.map(Duration::from_secs)))?;

            if report {
                println!("{}", serde_json::to_string_pretty(&exit)?);
            }
            if exit.is_supervisor_fault() {
                tracing::error!(report = ?exit.report, "init supervisor failed");
            }

            Ok(exit_code(&exit))
        }
    }
}

/// Wait for the namespace, forwarding termination signals and enforcing
/// the optional timeout. The first trigger terminates gracefully, the next
/// one kills.
async fn supervise(
    handle: Arc<NamespaceHandle>,
    timeout: Option<Duration>,
) -> anyhow::Result<NamespaceExit> {
    let waiter = {
        let handle = Arc::clone(&handle);
        tokio::task::spawn_blocking(move || handle.wait())
    };
    tokio::pin!(waiter);

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let signals_handle = signals.handle();

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut timed_out = false;
    let mut terminating = false;

    let exit = loop {
        tokio::select! {
            res = &mut waiter => break res.context("wait task failed")??,
            Some(signal) = signals.next() => {
                tracing::info!(signal, "received signal");
                escalate(&handle, &mut terminating);
            }
            () = &mut deadline, if !timed_out => {
                tracing::warn!(?timeout, "timeout reached, terminating namespace");
                timed_out = true;
                escalate(&handle, &mut terminating);
            }
        }
    };

    signals_handle.close();
    Ok(exit)
}

fn escalate(handle: &NamespaceHandle, terminating: &mut bool) {
    let result = if *terminating {
        handle.kill()
    } else {
        *terminating = true;
        handle.terminate()
    };

    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to stop namespace");
    }
}

fn load_workload(path: &Path) -> anyhow::Result<CommandSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workload {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid workload {}", path.display()))
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))
}

/// Shell convention: exit code as is, 128 + signal for signal deaths
fn exit_code(exit: &NamespaceExit) -> ExitCode {
    let code = match exit.status {
        InitStatus::Exited(code) => code,
        InitStatus::Signaled(signal) => 128 + signal,
    };
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
