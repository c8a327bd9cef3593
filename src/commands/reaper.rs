use std::{thread, time::Duration as StdDuration};

use anyhow::Result;
use clap::Args;
use time::{Duration, OffsetDateTime};
use tracing as log;

use super::backup::BackupOrchestrator;
use crate::{AppCtx, catalog::Catalog, records::BackupRecord, tooling::Tooling, utils::time::now};

#[derive(Debug, Args)]
pub struct ReaperArgs {
    /// Sweep once and exit instead of looping
    #[arg(long)]
    pub once: bool,
}

impl ReaperArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let interval = ctx.cfg.reaper.interval_secs;
        log::info!("[reaper] started, interval {interval}s");
        loop {
            sweep(&ctx.catalog, ctx.tools.as_ref(), now(), interval)?;
            if self.once {
                return Ok(());
            }
            thread::sleep(StdDuration::from_secs(interval));
        }
    }
}

/// Deletes backups whose retention fell at least one interval behind `at`.
/// Returns how many went away; busy or failing ones are left for the next round.
pub fn sweep(catalog: &Catalog, tools: &dyn Tooling, at: OffsetDateTime, interval_secs: u64) -> Result<usize> {
    let lag = Duration::seconds(i64::try_from(interval_secs).unwrap_or(i64::MAX));
    let Some(cutoff) = at.checked_sub(lag) else {
        log::debug!("[reaper] cutoff out of range for interval {interval_secs}s, nothing due");
        return Ok(0);
    };
    let expired = catalog.find_all::<BackupRecord>(|b| b.retention <= cutoff)?;
    let orch = BackupOrchestrator::new(catalog, tools);
    let mut reaped = 0;
    for b in expired {
        log::info!(
            "[reaper] {}/{} expired at {}",
            b.cluster_name,
            b.backup_name,
            b.retention
        );
        match orch.delete(&b.cluster_name, &b.backup_name) {
            Ok(_) => reaped += 1,
            Err(e) => log::warn!("[reaper] {}/{} kept: {e:#}", b.cluster_name, b.backup_name),
        }
    }
    Ok(reaped)
}
