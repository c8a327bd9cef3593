use anyhow::{Context, Result};
use tracing as log;

use crate::{
    catalog::Catalog,
    commands::{StoragePorts, backup_record, cluster_record},
    config::Services,
    error::{KairosError, StepReport},
    protection,
    records::BackupRecord,
    tooling::Tooling,
    topology::{Member, VolumeMapping},
    utils::lock::LockGuard,
};

#[derive(Debug, Default)]
pub struct RestoreSummary {
    /// Per-volume snapshot restores; failures here did not stop the restore.
    pub reverted: StepReport,
    /// Backups newer than the restored one, dropped from the catalog.
    pub purged: Vec<String>,
}

pub struct RestoreOrchestrator<'a> {
    catalog: &'a Catalog,
    tools: &'a dyn Tooling,
    services: &'a Services,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(catalog: &'a Catalog, tools: &'a dyn Tooling, services: &'a Services) -> Self {
        Self {
            catalog,
            tools,
            services,
        }
    }

    /// Prepare every member, revert every volume, then bring every member back.
    pub fn restore(&self, cluster: &str, backup: &str, ssh_user: Option<&str>) -> Result<RestoreSummary> {
        let rec = cluster_record(self.catalog, cluster)?;
        let _lease = LockGuard::for_cluster(self.catalog.dir(), cluster)?;
        let bkp = backup_record(self.catalog, cluster, backup)?;
        let user = ssh_user.unwrap_or(&rec.ssh_username);

        let members = bkp.topology.members();
        let sets = protection::build(&bkp.topology, backup)?;
        let mut ports = StoragePorts::new(self.catalog, self.tools);
        for s in &sets {
            ports.get(&s.svm_name)?;
        }

        log::info!("[restore] {cluster}/{backup}: stopping {} members", members.len());
        for m in &members {
            self.prepare(m, user)
                .with_context(|| format!("prepare {}", m.network_name))?;
        }

        let mut reverted = StepReport::default();
        for s in &sets {
            let port = ports.get(&s.svm_name)?;
            for vol in &s.volumes {
                log::info!("[restore] reverting {}:{vol} to {backup}", s.svm_name);
                reverted.record(
                    "snapshot-restore",
                    &format!("{}:{vol}", s.svm_name),
                    port.restore_snapshot(vol, backup),
                );
            }
        }

        for m in &members {
            self.activate(m, user)
                .with_context(|| format!("activate {}", m.network_name))?;
        }

        let purged = self.purge_newer(&bkp)?;
        log::info!(
            "[restore] {cluster} is at {backup}; {} revert failures, {} newer backups dropped",
            reverted.failures.len(),
            purged.len()
        );
        Ok(RestoreSummary { reverted, purged })
    }

    fn prepare(&self, m: &Member, user: &str) -> Result<()> {
        let host = self.tools.host(m.host(), user);
        host.stop_service(&self.services.database)?;
        let Some(map) = data_mapping(m)? else {
            return Ok(());
        };
        host.unmount(&map.mountpoint)?;
        if let Some(vg) = &map.volume_group_name {
            host.deactivate_vg(vg)?;
        }
        host.stop_service(&self.services.multipath)
    }

    fn activate(&self, m: &Member, user: &str) -> Result<()> {
        let host = self.tools.host(m.host(), user);
        if let Some(map) = data_mapping(m)? {
            host.start_service(&self.services.multipath)?;
            if let Some(vg) = &map.volume_group_name {
                host.activate_vg(vg)?;
            }
            host.mount(&map.block_device, &map.mountpoint, &map.fs_type)?;
        }
        host.start_service(&self.services.database)
    }

    fn purge_newer(&self, restored: &BackupRecord) -> Result<Vec<String>> {
        let newer: Vec<String> = self
            .catalog
            .find_all::<BackupRecord>(|b| {
                b.cluster_name == restored.cluster_name && b.created_at > restored.created_at
            })?
            .into_iter()
            .map(|b| b.backup_name)
            .collect();
        if newer.is_empty() {
            return Ok(newer);
        }
        self.catalog.remove_many::<BackupRecord>(|b| {
            b.cluster_name == restored.cluster_name && b.created_at > restored.created_at
        })?;
        for n in &newer {
            log::info!("[restore] dropped {}/{n}: newer than the restored point", restored.cluster_name);
        }
        Ok(newer)
    }
}

fn data_mapping(m: &Member) -> Result<Option<&VolumeMapping>> {
    if !m.role.is_data_bearing() {
        return Ok(None);
    }
    m.storage.as_ref().map(Some).ok_or_else(|| {
        KairosError::Validation(format!("backup has no storage mapping for {}", m.network_name)).into()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::{Duration, macros::datetime};

    use super::*;
    use crate::{
        config::Config,
        fakes::{FakeTools, World, catalog_with},
        topology::fixtures::mapped_replica_set,
    };

    fn seed(cat: &Catalog) {
        let t1 = datetime!(2024-05-01 00:00 UTC);
        for (i, name) in ["t1", "t2", "t3"].iter().enumerate() {
            let at = t1 + Duration::hours(i as i64);
            cat.add(&BackupRecord {
                cluster_name: "rs0".into(),
                backup_name: (*name).into(),
                created_at: at,
                retention: at + Duration::weeks(1),
                topology: mapped_replica_set(),
            })
            .unwrap();
        }
    }

    fn names(cat: &Catalog) -> Vec<String> {
        cat.find_all::<BackupRecord>(|_| true)
            .unwrap()
            .into_iter()
            .map(|b| b.backup_name)
            .collect()
    }

    #[test]
    fn restoring_middle_backup_drops_only_newer() {
        let w = Arc::new(World::default());
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &["svm1", "svm2"]);
        seed(&cat);
        let cfg = Config::default();

        let out = RestoreOrchestrator::new(&cat, &tools, &cfg.services)
            .restore("rs0", "t2", None)
            .unwrap();
        assert_eq!(out.purged, vec!["t3"]);
        assert_eq!(names(&cat), vec!["t1", "t2"]);
        assert!(out.reverted.is_clean());
        assert_eq!(out.reverted.attempted, 3);
    }

    #[test]
    fn stages_run_across_all_members_in_order() {
        let w = Arc::new(World::default());
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &["svm1", "svm2"]);
        seed(&cat);
        let cfg = Config::default();
        RestoreOrchestrator::new(&cat, &tools, &cfg.services)
            .restore("rs0", "t1", None)
            .unwrap();

        let last_prepare = w.position("c: stop multipathd").unwrap();
        let first_revert = w.position("snaprestore").unwrap();
        let first_activate = w.position("a: start multipathd").unwrap();
        assert!(w.position("d: stop mongod").unwrap() < first_revert);
        assert!(last_prepare < first_revert);
        assert!(w.journal()[first_revert..first_activate]
            .iter()
            .all(|e| e.contains("snaprestore")));

        // arbiter: service only
        assert_eq!(w.count("d: "), 2);
        assert!(w.journal().contains(&"b: vgchange -an vgb".to_string()));
        assert!(w.journal().contains(&"b: mount xfs /dev/mapper/vgdata-lvdata /data".to_string()));
        assert_eq!(names(&cat), vec!["t1"]);
    }

    #[test]
    fn revert_failures_do_not_abort() {
        let w = Arc::new(World::default());
        w.fail_on("snaprestore volB");
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &["svm1", "svm2"]);
        seed(&cat);
        let cfg = Config::default();
        let out = RestoreOrchestrator::new(&cat, &tools, &cfg.services)
            .restore("rs0", "t3", None)
            .unwrap();
        assert_eq!(out.reverted.failed_targets(), vec!["svm1:volB"]);
        assert_eq!(w.count("start mongod"), 4);
        assert!(out.purged.is_empty());
    }

    #[test]
    fn prepare_failure_is_fatal() {
        let w = Arc::new(World::default());
        w.fail_on("b: umount");
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &["svm1", "svm2"]);
        seed(&cat);
        let cfg = Config::default();
        let err = RestoreOrchestrator::new(&cat, &tools, &cfg.services)
            .restore("rs0", "t1", None)
            .unwrap_err();
        assert!(format!("{err:#}").contains("prepare b:27017"));
        assert_eq!(w.count("snaprestore"), 0);
        assert_eq!(names(&cat).len(), 3);
    }

    #[test]
    fn missing_backup_is_not_found() {
        let tools = FakeTools(Arc::new(World::default()));
        let (_tmp, cat) = catalog_with("rs0", &["svm1"]);
        let cfg = Config::default();
        let err = RestoreOrchestrator::new(&cat, &tools, &cfg.services)
            .restore("rs0", "nope", None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KairosError>(),
            Some(KairosError::NotFound { kind: "backup", .. })
        ));
    }
}
