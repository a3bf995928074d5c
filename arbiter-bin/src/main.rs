//! Judging worker CLI.
//!
//! Prepares the working directory, installs signal handling and drives
//! the outer restart loop: load config, scan toolchains, serve attempts
//! until a HUP asks for a reload or an INT/TERM asks for a shutdown.

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

use arbiter::config::Logging;
use arbiter::worker::{self, Lifecycle};
use arbiter::{Config, Toolchains};

/// Polls the queue for attempts and judges them in the given working
/// directory.
#[derive(Parser, Debug)]
#[clap(about, version)]
struct Opt {
    /// Path to a YAML configuration file.
    #[clap(short, long)]
    config: PathBuf,

    /// Do not prompt if the working directory is not empty.
    #[clap(short, long)]
    force: bool,

    /// Directory to put the logs in.
    #[clap(short, long, default_value = "./")]
    log_dir: PathBuf,

    /// A name to tell this worker apart from others sharing the queue.
    #[clap(short, long, default_value = "")]
    name: String,

    /// Working directory; everything inside it will be deleted.
    cwd: PathBuf,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    let cwd = prepare_working_dir(&opt.cwd, opt.force)?;

    let lifecycle = Lifecycle::new();
    spawn_signal_task(lifecycle.clone()).context("failed to install signal handlers")?;

    let mut log_handle: Option<FilterHandle> = None;
    while !lifecycle.terminating() {
        lifecycle.clear_restart();
        let config = Config::load(&opt.config)
            .with_context(|| format!("failed to load config from '{}'", opt.config.display()))?;
        let toolchains =
            Toolchains::scan(&config.dirs).context("failed to scan the toolchain directories")?;
        match &log_handle {
            None => log_handle = Some(init_logging(&config.logging, &opt.log_dir)?),
            Some(handle) => reload_logging(handle, &config.logging)?,
        }
        worker::run(&config, &toolchains, &cwd, &opt.name, &lifecycle).await?;
    }
    Ok(())
}

fn prepare_working_dir(cwd: &Path, force: bool) -> Result<PathBuf> {
    if !cwd.is_dir() {
        fs_err::create_dir_all(cwd)?;
    } else if !force && fs_err::read_dir(cwd)?.next().is_some() {
        println!("Working directory is not empty. All files inside it will be deleted.");
        print!("Are you sure you want to proceed? [y/N] ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(
            answer.trim().to_lowercase().as_str(),
            "y" | "yes" | "yessir" | "yeah"
        ) {
            bail!("Aborted");
        }
    }
    let cwd = fs_err::canonicalize(cwd)?;
    // The mode cannot be passed at creation time; umask would strip it.
    fs_err::set_permissions(&cwd, std::fs::Permissions::from_mode(0o777))?;
    Ok(cwd)
}

fn spawn_signal_task(lifecycle: Lifecycle) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => lifecycle.request_restart(),
                _ = interrupt.recv() => shutdown(&lifecycle),
                _ = terminate.recv() => shutdown(&lifecycle),
                _ = quit.recv() => {
                    eprintln!("SIGQUIT received");
                    std::process::exit(1);
                }
            }
        }
    });
    Ok(())
}

fn shutdown(lifecycle: &Lifecycle) {
    if lifecycle.request_shutdown() {
        println!("Shutting down");
    } else {
        println!("Terminating");
        std::process::exit(0);
    }
}

fn init_logging(logging: &Logging, log_dir: &Path) -> Result<FilterHandle> {
    let (filter, handle) = reload::Layer::new(parse_filter(logging)?);
    let registry = tracing_subscriber::registry().with(filter);
    match &logging.file {
        Some(name) => {
            fs_err::create_dir_all(log_dir)?;
            let path = if name.is_absolute() {
                name.clone()
            } else {
                log_dir.join(name)
            };
            let file = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(io::stdout.and(Mutex::new(file))),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
                .init();
        }
    }
    Ok(handle)
}

/// A restart re-reads the filter directive; the sink stays as it was
/// installed at startup.
fn reload_logging(handle: &FilterHandle, logging: &Logging) -> Result<()> {
    handle
        .reload(parse_filter(logging)?)
        .context("failed to reload the log filter")?;
    Ok(())
}

fn parse_filter(logging: &Logging) -> Result<EnvFilter> {
    let directive = logging.filter.as_deref().unwrap_or("info");
    EnvFilter::try_new(directive)
        .with_context(|| format!("bad logging.filter directive: {directive:?}"))
}
