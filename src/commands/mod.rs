use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    catalog::Catalog,
    error::KairosError,
    records::{BackupRecord, ClusterRecord, StorageSystemRecord},
    tooling::{StoragePort, Tooling},
};

pub mod backup;
pub mod clone;
pub mod cluster;
pub mod reaper;
pub mod restore;
pub mod storage;

pub(crate) fn cluster_record(catalog: &Catalog, name: &str) -> Result<ClusterRecord> {
    catalog
        .find_one::<ClusterRecord>(|c| c.cluster_name == name)?
        .ok_or_else(|| KairosError::not_found("cluster", name).into())
}

pub(crate) fn backup_record(catalog: &Catalog, cluster: &str, backup: &str) -> Result<BackupRecord> {
    catalog
        .find_one::<BackupRecord>(|b| b.cluster_name == cluster && b.backup_name == backup)?
        .ok_or_else(|| KairosError::not_found("backup", format!("{cluster}/{backup}")).into())
}

/// Storage ports keyed by SVM, opened once per operation.
pub(crate) struct StoragePorts<'a> {
    catalog: &'a Catalog,
    tools: &'a dyn Tooling,
    open: BTreeMap<String, Arc<dyn StoragePort>>,
}

impl<'a> StoragePorts<'a> {
    pub fn new(catalog: &'a Catalog, tools: &'a dyn Tooling) -> Self {
        Self {
            catalog,
            tools,
            open: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, svm: &str) -> Result<Arc<dyn StoragePort>> {
        if let Some(p) = self.open.get(svm) {
            return Ok(p.clone());
        }
        let sys = self
            .catalog
            .find_one::<StorageSystemRecord>(|s| s.svm_name == svm)?
            .ok_or_else(|| KairosError::not_found("storage system", svm))?;
        let port = self
            .tools
            .storage(&sys)
            .with_context(|| format!("connect to {} ({svm})", sys.netapp_ip))?;
        self.open.insert(svm.to_string(), port.clone());
        Ok(port)
    }
}
