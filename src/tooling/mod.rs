use std::sync::Arc;

use anyhow::Result;

use crate::{
    config::{Config, Mongo, Ssh, Storage},
    records::StorageSystemRecord,
    utils::{
        bins::{ensure_bins, required_bins},
        process::Runner,
    },
};

pub mod host;
pub mod mongo;
pub mod ontap;

pub use host::{HostPort, SshHost};
pub use mongo::{MongoShell, TopologyPort};
pub use ontap::{OntapZapi, StoragePort};

/// Hands out collaborator ports; orchestrators only ever talk to these traits.
pub trait Tooling: Send + Sync {
    fn host(&self, address: &str, user: &str) -> Arc<dyn HostPort>;
    fn storage(&self, system: &StorageSystemRecord) -> Result<Arc<dyn StoragePort>>;
    fn topology(&self, uri: &str) -> Arc<dyn TopologyPort>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct Toolbox {
    runner: Arc<DynRunner>,
    ssh: Arc<Ssh>,
    storage: Arc<Storage>,
    mongo: Arc<Mongo>,
}

impl Toolbox {
    pub fn new(cfg: &Config, runner: Arc<DynRunner>) -> Result<Self> {
        ensure_bins(required_bins(cfg))?;
        Ok(Self {
            runner,
            ssh: Arc::new(cfg.ssh.clone()),
            storage: Arc::new(cfg.storage.clone()),
            mongo: Arc::new(cfg.mongo.clone()),
        })
    }
}

impl Tooling for Toolbox {
    fn host(&self, address: &str, user: &str) -> Arc<dyn HostPort> {
        Arc::new(SshHost::new(
            self.runner.clone(),
            self.ssh.clone(),
            address,
            user,
        ))
    }

    fn storage(&self, system: &StorageSystemRecord) -> Result<Arc<dyn StoragePort>> {
        Ok(Arc::new(OntapZapi::new(&self.storage, system)?))
    }

    fn topology(&self, uri: &str) -> Arc<dyn TopologyPort> {
        Arc::new(MongoShell::new(self.runner.clone(), self.mongo.clone(), uri))
    }
}
