use anyhow::Result;
use clap::Args;
use tracing as log;

use crate::AppCtx;

mod executor;

pub use executor::RestoreOrchestrator;

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(long)]
    pub cluster: String,

    /// Backup to revert the cluster to
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub ssh_user: Option<String>,
}

impl RestoreArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let out = RestoreOrchestrator::new(&ctx.catalog, ctx.tools.as_ref(), &ctx.cfg.services)
            .restore(&self.cluster, &self.name, self.ssh_user.as_deref())?;
        if !out.reverted.is_clean() {
            log::warn!(
                "[restore] volumes not reverted: {}",
                out.reverted.failed_targets().join(", ")
            );
        }
        Ok(())
    }
}
