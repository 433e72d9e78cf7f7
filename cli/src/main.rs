use std::{path::PathBuf, sync::Arc, time::Duration};

use bootcache_engine::{
    DirStore, EngineOptions, Orchestrator, Outcome, Reconciler, ReconcilerOptions, SpecStore as _,
};
use bootcache_resolver::{Resolver, ResolverOptions};
use clap::{ArgAction, Args, Parser, Subcommand};
use miette::{IntoDiagnostic as _, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, prelude::*};

#[derive(Parser)]
#[command(name = "bootcache")]
#[command(version)]
#[command(about = "Keeps declared boot artifacts resolved in a local cache")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Config {
    /// Directory holding one subdirectory per artifact.
    #[arg(long, env = "BOOTCACHE_BASE_DIR", default_value = "/var/lib/bootcache")]
    base_dir: PathBuf,

    /// Directory of `<kind>/<name>.json` specs. Statuses are written next to them.
    #[arg(long, env = "BOOTCACHE_STORE_DIR", default_value = "/etc/bootcache")]
    store_dir: PathBuf,

    /// Spec kind to reconcile.
    #[arg(long, env = "BOOTCACHE_KIND", default_value = "bootsource")]
    kind: String,

    /// Deadline for resolving one artifact.
    #[arg(long, env = "BOOTCACHE_RESOLUTION_TIMEOUT_SECS", default_value_t = 1800)]
    resolution_timeout_secs: u64,

    /// Deadline for fetching one checksum list.
    #[arg(long, env = "BOOTCACHE_CHECKSUM_TIMEOUT_SECS", default_value_t = 30)]
    checksum_timeout_secs: u64,

    /// Hash cached files without first comparing their size against a `HEAD`.
    #[arg(long, env = "BOOTCACHE_NO_PREFLIGHT_SIZE")]
    no_preflight_size: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile every artifact on a fixed interval until interrupted.
    Run(RunArgs),
    /// Run a single reconciliation pass and print what it did.
    Once,
    /// Print the recorded status of one artifact.
    Status(StatusArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Seconds between reconciliation passes.
    #[arg(
        long,
        env = "BOOTCACHE_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_secs: u64,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(value_name = "NAME")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Run(args) => run(&cli.config, args).await,
        Command::Once => once(&cli.config).await,
        Command::Status(args) => status(&cli.config, args).await,
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().into_diagnostic()?
    } else {
        EnvFilter::new(default_directives(verbose))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer())
        .with(ErrorLayer::default())
        .init();

    Ok(())
}

/// Filter used without `RUST_LOG`: our crates at the requested level, everything else at
/// `warn`. Targets are module paths, so `bootcache` matches the binary and every
/// `bootcache_*` library crate.
fn default_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,bootcache={level}")
}

impl Config {
    fn reconciler(&self, interval: Duration) -> Reconciler {
        let resolver = Resolver::with_options(ResolverOptions {
            checksum_timeout: Duration::from_secs(self.checksum_timeout_secs),
            preflight_size: !self.no_preflight_size,
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(
            Arc::new(DirStore::new(&self.store_dir)),
            resolver,
            EngineOptions {
                base_dir: self.base_dir.clone(),
                resolution_timeout: Duration::from_secs(self.resolution_timeout_secs),
            },
        );
        Reconciler::new(
            orchestrator,
            ReconcilerOptions {
                kind: self.kind.clone(),
                interval,
            },
        )
    }
}

async fn run(config: &Config, args: RunArgs) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).into_diagnostic()?;
    let mut sigint = signal(SignalKind::interrupt()).into_diagnostic()?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    };

    info!(
        store = %config.store_dir.display(),
        base = %config.base_dir.display(),
        kind = %config.kind,
        interval_secs = args.interval_secs,
        "starting"
    );
    config
        .reconciler(Duration::from_secs(args.interval_secs))
        .run(shutdown)
        .await;
    info!("stopped");
    Ok(())
}

async fn once(config: &Config) -> Result<()> {
    let reconciler = config.reconciler(Duration::ZERO);
    let outcomes = reconciler.reconcile_once().await?;
    for (name, outcome) in outcomes {
        let outcome = match outcome {
            Outcome::Initialized => "initialized".to_string(),
            Outcome::Resolved(phase) => format!("resolved ({phase})"),
            Outcome::Unchanged => "unchanged".to_string(),
            Outcome::Busy => "busy".to_string(),
        };
        println!("{name}: {outcome}");
    }
    Ok(())
}

async fn status(config: &Config, args: StatusArgs) -> Result<()> {
    let store = DirStore::new(&config.store_dir);
    let Some(artifact) = store.get(&config.kind, &args.name).await? else {
        return Err(miette::miette!(
            "no {} named `{}` in {}",
            config.kind,
            args.name,
            config.store_dir.display()
        ));
    };
    let Some(status) = artifact.status else {
        println!("{}: no status recorded yet", artifact.name);
        return Ok(());
    };

    println!("{}: {} ({})", artifact.name, status.phase, status.message);
    for resource in &status.resources {
        match &resource.message {
            Some(message) => println!(
                "  {} {} {}: {message}",
                resource.name, resource.phase, resource.file
            ),
            None => println!("  {} {} {}", resource.name, resource.phase, resource.file),
        }
    }
    for (param, path) in &status.boot_params {
        println!("  {param} = {}", config.base_dir.join(path).display());
    }
    Ok(())
}
