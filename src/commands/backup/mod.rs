use anyhow::Result;
use clap::{Args, Subcommand};
use tracing as log;

use crate::{AppCtx, ui};

mod executor;

pub use executor::BackupOrchestrator;

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub cmd: BackupCmd,
}

impl BackupArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        self.cmd.run(ctx)
    }
}

#[derive(Debug, Subcommand)]
pub enum BackupCmd {
    Create(CreateArgs),
    Delete(DeleteArgs),
    List(ListArgs),
    Search(SearchArgs),
}

impl BackupCmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            BackupCmd::Create(args) => args.run(ctx),
            BackupCmd::Delete(args) => args.run(ctx),
            BackupCmd::List(args) => args.run(ctx),
            BackupCmd::Search(args) => args.run(ctx),
        }
    }
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub cluster: String,

    #[arg(long)]
    pub name: String,

    /// `<n>m`, `<n>h`, `<n>d` or `<n>w`
    #[arg(long, default_value = "7d")]
    pub retention: String,

    /// Overrides the SSH user registered with the cluster
    #[arg(long)]
    pub ssh_user: Option<String>,
}

impl CreateArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let rec = BackupOrchestrator::new(&ctx.catalog, ctx.tools.as_ref()).create(
            &self.cluster,
            &self.name,
            &self.retention,
            self.ssh_user.as_deref(),
        )?;
        ui::log_backups(&[rec]);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[arg(long)]
    pub cluster: String,

    #[arg(long)]
    pub name: String,
}

impl DeleteArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let report =
            BackupOrchestrator::new(&ctx.catalog, ctx.tools.as_ref()).delete(&self.cluster, &self.name)?;
        if !report.is_clean() {
            log::warn!(
                "[backup] snapshots left behind on: {}",
                report.failed_targets().join(", ")
            );
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub cluster: Option<String>,
}

impl ListArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let all = BackupOrchestrator::new(&ctx.catalog, ctx.tools.as_ref()).list(self.cluster.as_deref())?;
        ui::log_backups(&all);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    #[arg(long)]
    pub database: String,

    #[arg(long)]
    pub collection: Option<String>,

    #[arg(long)]
    pub cluster: Option<String>,
}

impl SearchArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let found = BackupOrchestrator::new(&ctx.catalog, ctx.tools.as_ref()).search(
            self.cluster.as_deref(),
            &self.database,
            self.collection.as_deref(),
        )?;
        ui::log_backups(&found);
        Ok(())
    }
}
