use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing as log;

use crate::{AppCtx, ui};

mod executor;
pub mod spec;

pub use executor::CloneOrchestrator;
use spec::CloneSpec;

#[derive(Debug, Args)]
pub struct CloneArgs {
    #[command(subcommand)]
    pub cmd: CloneCmd,
}

impl CloneArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        self.cmd.run(ctx)
    }
}

#[derive(Debug, Subcommand)]
pub enum CloneCmd {
    Create(CreateArgs),
    Delete(DeleteArgs),
    List(ListArgs),
}

impl CloneCmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            CloneCmd::Create(args) => args.run(ctx),
            CloneCmd::Delete(args) => args.run(ctx),
            CloneCmd::List(args) => args.run(ctx),
        }
    }
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub cluster: String,

    #[arg(long)]
    pub backup: String,

    #[arg(long)]
    pub name: String,

    /// TOML file describing the cloned cluster's members
    #[arg(long)]
    pub spec: PathBuf,

    #[arg(long, default_value = "")]
    pub description: String,

    #[arg(long)]
    pub ssh_user: Option<String>,
}

impl CreateArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let spec = CloneSpec::load(&self.spec)?;
        let rec = CloneOrchestrator::new(&ctx.catalog, ctx.tools.as_ref(), &ctx.cfg.clone).create(
            &self.cluster,
            &self.backup,
            &self.name,
            &spec,
            &self.description,
            self.ssh_user.as_deref(),
        )?;
        ui::log_clones(&[rec]);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[arg(long)]
    pub cluster: String,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub ssh_user: Option<String>,
}

impl DeleteArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let report = CloneOrchestrator::new(&ctx.catalog, ctx.tools.as_ref(), &ctx.cfg.clone).delete(
            &self.cluster,
            &self.name,
            self.ssh_user.as_deref(),
        )?;
        if !report.is_clean() {
            log::warn!("[teardown] clean up manually:");
            for f in &report.failures {
                log::warn!("[teardown]   {} {}: {}", f.step, f.target, f.error);
            }
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
        let all = CloneOrchestrator::new(&ctx.catalog, ctx.tools.as_ref(), &ctx.cfg.clone)
            .list(self.cluster.as_deref())?;
        ui::log_clones(&all);
        Ok(())
    }
}
