use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::{EnvFilter, fmt};

mod catalog;
mod commands;
mod config;
mod error;
mod mapper;
mod protection;
mod records;
mod retention;
mod tooling;
mod topology;
mod ui;
mod utils;

#[cfg(test)]
mod fakes;

use catalog::Catalog;
use commands::{backup, clone, cluster, reaper, restore, storage};
use config::Config;
use tooling::{Toolbox, Tooling};
use utils::process::ProcessRunner;

pub struct AppCtx {
    pub debug: bool,
    pub cfg: Config,
    pub catalog: Catalog,
    pub tools: Arc<dyn Tooling>,
}

#[derive(Parser, Debug)]
#[command(
    name = "kairos",
    about = "Snapshot backups, restores and clones of MongoDB clusters on NetApp ONTAP",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "./config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Register, drop and list MongoDB clusters
    Cluster(cluster::ClusterArgs),
    /// Register, drop and list ONTAP storage VMs
    Storage(storage::StorageArgs),
    Backup(backup::BackupArgs),
    Restore(restore::RestoreArgs),
    Clone(clone::CloneArgs),
    /// Delete backups past their retention
    Reaper(reaper::ReaperArgs),
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn print_help() -> Result<()> {
    Cli::command().print_help()?;
    println!();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        return print_help();
    }
    let cfg = Config::load(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_redacted_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        return print_help();
    };

    let catalog = Catalog::open(&cfg.catalog.path)
        .with_context(|| format!("open catalog {}", cfg.catalog.path.display()))?;
    let tools = Toolbox::new(&cfg, Arc::new(ProcessRunner::new()))?;
    let ctx = AppCtx {
        debug: cli.debug,
        cfg,
        catalog,
        tools: Arc::new(tools),
    };

    match cmd {
        Cmd::Cluster(args) => args.run(&ctx),
        Cmd::Storage(args) => args.run(&ctx),
        Cmd::Backup(args) => args.run(&ctx),
        Cmd::Restore(args) => args.run(&ctx),
        Cmd::Clone(args) => args.run(&ctx),
        Cmd::Reaper(args) => args.run(&ctx),
    }
}
