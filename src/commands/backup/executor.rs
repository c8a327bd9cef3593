use anyhow::{Context, Result};
use tracing as log;

use crate::{
    catalog::Catalog,
    commands::{StoragePorts, backup_record, cluster_record},
    config::Config,
    error::{KairosError, StepReport},
    mapper::StorageMapper,
    protection,
    records::BackupRecord,
    retention,
    tooling::{Tooling, TopologyPort},
    utils::{lock::LockGuard, time::now},
};

const CG_TIMEOUT: &str = "relaxed";

pub struct BackupOrchestrator<'a> {
    catalog: &'a Catalog,
    tools: &'a dyn Tooling,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(catalog: &'a Catalog, tools: &'a dyn Tooling) -> Self {
        Self { catalog, tools }
    }

    /// Maps the live cluster, snapshots every member's volumes and records the result.
    pub fn create(
        &self,
        cluster: &str,
        backup: &str,
        retention_spec: &str,
        ssh_user: Option<&str>,
    ) -> Result<BackupRecord> {
        if !Config::valid_name(backup) {
            return Err(KairosError::Validation(format!("invalid backup name '{backup}'")).into());
        }
        let rec = cluster_record(self.catalog, cluster)?;
        let created_at = now();
        let retention = retention::calc(retention_spec, created_at)?;

        let _lease = LockGuard::for_cluster(self.catalog.dir(), cluster)?;
        if self
            .catalog
            .find_one::<BackupRecord>(|b| b.cluster_name == cluster && b.backup_name == backup)?
            .is_some()
        {
            return Err(KairosError::DuplicateKey {
                collection: "backups",
                key: format!("{cluster}/{backup}"),
            }
            .into());
        }

        let mongo = self.tools.topology(&rec.mongodb_uri);
        let mut topology = mongo
            .topology()
            .with_context(|| format!("fetch topology of {cluster}"))?;
        log::info!(
            "[backup] {cluster}: {} with {} members",
            topology.kind(),
            topology.members().len()
        );

        let user = ssh_user.unwrap_or(&rec.ssh_username);
        StorageMapper::new(self.tools, user, &rec.mongod_config_path).annotate(&mut topology)?;
        let sets = protection::build(&topology, backup)?;

        let mut ports = StoragePorts::new(self.catalog, self.tools);
        let mut targets = Vec::with_capacity(sets.len());
        for s in &sets {
            targets.push((s, ports.get(&s.svm_name)?));
        }

        let sharded = topology.is_sharded();
        if sharded {
            log::info!("[backup] stopping balancer");
            if let Err(e) = mongo.stop_balancer() {
                resume_balancer(mongo.as_ref());
                return Err(e.context("stop balancer"));
            }
        }

        for (set, port) in &targets {
            log::info!(
                "[backup] cg snapshot {} on {}:{:?} ({})",
                set.snapshot_name,
                set.svm_name,
                set.volumes,
                set.group_label
            );
            let res = port
                .create_consistency_group(&set.volumes, &set.snapshot_name, CG_TIMEOUT)
                .with_context(|| format!("snapshot {} of {}", set.snapshot_name, set.group_label));
            if let Err(e) = res {
                if sharded {
                    resume_balancer(mongo.as_ref());
                }
                return Err(e);
            }
        }

        if sharded {
            resume_balancer(mongo.as_ref());
        }

        let record = BackupRecord {
            cluster_name: cluster.to_string(),
            backup_name: backup.to_string(),
            created_at,
            retention,
            topology,
        };
        self.catalog.add(&record)?;
        log::info!("[backup] {cluster}/{backup} done, expires {retention}");
        Ok(record)
    }

    /// All snapshots are checked before any is deleted; a busy one aborts with nothing removed.
    pub fn delete(&self, cluster: &str, backup: &str) -> Result<StepReport> {
        let _lease = LockGuard::for_cluster(self.catalog.dir(), cluster)?;
        let rec = backup_record(self.catalog, cluster, backup)?;
        let targets = rec.topology.volumes_by_svm();

        let mut ports = StoragePorts::new(self.catalog, self.tools);
        for (svm, volumes) in &targets {
            let port = ports.get(svm)?;
            for vol in volumes {
                match port.snapshot_info(vol, backup)? {
                    Some(info) if info.busy => {
                        return Err(KairosError::SnapshotBusy {
                            svm: svm.clone(),
                            volume: vol.clone(),
                            snapshot: backup.to_string(),
                        }
                        .into());
                    }
                    Some(_) => {}
                    None => log::warn!("[backup] {svm}:{vol} has no snapshot {backup}"),
                }
            }
        }

        let mut report = StepReport::default();
        for (svm, volumes) in &targets {
            let port = ports.get(svm)?;
            for vol in volumes {
                report.record(
                    "snapshot-delete",
                    &format!("{svm}:{vol}"),
                    port.delete_snapshot(vol, backup),
                );
            }
        }

        self.catalog
            .remove_one::<BackupRecord>(|b| b.cluster_name == cluster && b.backup_name == backup)?;
        log::info!(
            "[backup] deleted {cluster}/{backup} ({} of {} snapshot deletes failed)",
            report.failures.len(),
            report.attempted
        );
        Ok(report)
    }

    pub fn list(&self, cluster: Option<&str>) -> Result<Vec<BackupRecord>> {
        let mut out = self
            .catalog
            .find_all::<BackupRecord>(|b| cluster.is_none_or(|c| b.cluster_name == c))?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Backups whose recorded topology saw `database` (and `collection`, if given).
    pub fn search(
        &self,
        cluster: Option<&str>,
        database: &str,
        collection: Option<&str>,
    ) -> Result<Vec<BackupRecord>> {
        Ok(self
            .list(cluster)?
            .into_iter()
            .filter(|b| {
                let dbs = b.topology.databases();
                match (dbs.get(database), collection) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(colls), Some(c)) => colls.iter().any(|x| x == c),
                }
            })
            .collect())
    }
}

fn resume_balancer(mongo: &dyn TopologyPort) {
    log::info!("[backup] starting balancer");
    if let Err(e) = mongo.start_balancer() {
        log::error!("[backup] failed to restart balancer: {e:#}");
    }
}
