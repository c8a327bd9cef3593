//! Recording collaborators for orchestrator tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::{
    catalog::Catalog,
    error::KairosError,
    records::{AuthMode, ClusterRecord, StorageSystemRecord},
    tooling::{
        HostPort, StoragePort, Tooling, TopologyPort,
        host::{MountInfo, SanLun},
        ontap::{Protocol, SnapshotInfo},
    },
    topology::Topology,
    utils::process::CmdSpec,
};

#[derive(Debug, Clone)]
pub struct HostLayout {
    pub conf: String,
    pub mount: MountInfo,
    pub vg: Option<String>,
    pub pvs: Vec<String>,
    pub luns: Vec<SanLun>,
}

impl HostLayout {
    /// LVM on one LUN per volume, `vg<host>` on `/data`.
    pub fn lvm(host: &str, svm: &str, volumes: &[&str]) -> Self {
        let luns: Vec<SanLun> = volumes
            .iter()
            .enumerate()
            .map(|(i, v)| SanLun {
                svm_name: svm.into(),
                volume: (*v).into(),
                lun_name: format!("lun{i}"),
                lun_id: i.to_string(),
                devices: vec![format!("36{host}{i}"), format!("dm-{i}")],
            })
            .collect();
        Self {
            conf: "storage:\n  dbPath: /data/db\n".into(),
            mount: MountInfo {
                source: format!("/dev/mapper/vg{host}-lvdata"),
                fstype: "xfs".into(),
                target: "/data".into(),
            },
            vg: Some(format!("vg{host}")),
            pvs: luns
                .iter()
                .map(|l| format!("/dev/mapper/{}", l.devices[0]))
                .collect(),
            luns,
        }
    }
}

#[derive(Default)]
pub struct World {
    pub journal: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<String>>,
    pub layouts: BTreeMap<String, HostLayout>,
    pub busy: Vec<String>,
    pub missing_snapshots: Vec<String>,
    pub topology: Option<Topology>,
}

impl World {
    pub fn fail_on(&self, pattern: &str) {
        self.fail_on.lock().unwrap().push(pattern.to_string());
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.journal().iter().filter(|e| e.contains(needle)).count()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.journal().iter().position(|e| e.contains(needle))
    }

    pub fn clear(&self) {
        self.journal.lock().unwrap().clear();
    }

    fn call(&self, entry: String) -> Result<()> {
        let failing = self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|p| entry.contains(p.as_str()));
        self.journal.lock().unwrap().push(entry.clone());
        if failing {
            return Err(KairosError::remote(entry, "injected failure").into());
        }
        Ok(())
    }
}

pub struct FakeHost {
    world: Arc<World>,
    addr: String,
}

impl FakeHost {
    fn layout(&self) -> Result<&HostLayout> {
        self.world
            .layouts
            .get(&self.addr)
            .ok_or_else(|| anyhow!("no layout for {}", self.addr))
    }

    fn act(&self, what: String) -> Result<()> {
        self.world.call(format!("{}: {what}", self.addr))
    }
}

impl HostPort for FakeHost {
    fn address(&self) -> &str {
        &self.addr
    }
    fn run_command(&self, cmd: CmdSpec) -> Result<String> {
        self.act(cmd.render())?;
        Ok(String::new())
    }
    fn read_file(&self, path: &str) -> Result<String> {
        self.act(format!("cat {path}"))?;
        Ok(self.layout()?.conf.clone())
    }
    fn hostname(&self) -> Result<String> {
        self.act("hostname".into())?;
        Ok(self.addr.clone())
    }
    fn find_mount(&self, path: &str) -> Result<MountInfo> {
        self.act(format!("findmnt {path}"))?;
        Ok(self.layout()?.mount.clone())
    }
    fn logical_volume_group(&self, device: &str) -> Result<Option<String>> {
        self.act(format!("lvs {device}"))?;
        Ok(self.layout()?.vg.clone())
    }
    fn volume_group_devices(&self, vg: &str) -> Result<Vec<String>> {
        self.act(format!("pvs {vg}"))?;
        Ok(self.layout()?.pvs.clone())
    }
    fn san_luns(&self) -> Result<Vec<SanLun>> {
        self.act("sanlun".into())?;
        Ok(self.layout()?.luns.clone())
    }
    fn stop_service(&self, name: &str) -> Result<()> {
        self.act(format!("stop {name}"))
    }
    fn start_service(&self, name: &str) -> Result<()> {
        self.act(format!("start {name}"))
    }
    fn deactivate_vg(&self, vg: &str) -> Result<()> {
        self.act(format!("vgchange -an {vg}"))
    }
    fn activate_vg(&self, vg: &str) -> Result<()> {
        self.act(format!("vgchange -ay {vg}"))
    }
    fn unmount(&self, mountpoint: &str) -> Result<()> {
        self.act(format!("umount {mountpoint}"))
    }
    fn mount(&self, device: &str, mountpoint: &str, fs_type: &str) -> Result<()> {
        self.act(format!("mount {fs_type} {device} {mountpoint}"))
    }
    fn iscsi_initiator_name(&self) -> Result<String> {
        self.act("initiator".into())?;
        Ok(format!("iqn.2024-01.test:{}", self.addr))
    }
    fn iscsi_discover(&self, target: &str) -> Result<()> {
        self.act(format!("iscsi discover {target}"))
    }
    fn iscsi_login_all(&self) -> Result<()> {
        self.act("iscsi login".into())
    }
    fn rescan(&self) -> Result<()> {
        self.act("iscsi rescan".into())
    }
    fn remove_file(&self, path: &str) -> Result<()> {
        self.act(format!("rm {path}"))
    }
    fn kill_process(&self, name: &str) -> Result<bool> {
        self.act(format!("pkill {name}"))?;
        Ok(true)
    }
    fn run_as(&self, user: &str, cmd: CmdSpec) -> Result<()> {
        self.act(format!("as {user}: {}", cmd.render()))
    }
}

pub struct FakeStorage {
    world: Arc<World>,
    svm: String,
}

impl FakeStorage {
    fn act(&self, what: String) -> Result<()> {
        self.world.call(format!("{}: {what}", self.svm))
    }
}

impl StoragePort for FakeStorage {
    fn svm(&self) -> &str {
        &self.svm
    }
    fn ping(&self) -> Result<String> {
        self.act("ping".into())?;
        Ok("NetApp Release 9.x".into())
    }
    fn create_consistency_group(&self, volumes: &[String], snapshot: &str, timeout: &str) -> Result<()> {
        self.act(format!("cg {snapshot} [{}] {timeout}", volumes.join(",")))
    }
    fn snapshot_info(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>> {
        self.act(format!("snapinfo {volume}@{snapshot}"))?;
        let key = format!("{}:{volume}", self.svm);
        if self.world.missing_snapshots.contains(&key) {
            return Ok(None);
        }
        Ok(Some(SnapshotInfo {
            busy: self.world.busy.contains(&key),
        }))
    }
    fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        self.act(format!("snapdelete {volume}@{snapshot}"))
    }
    fn restore_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        self.act(format!("snaprestore {volume}@{snapshot}"))
    }
    fn create_flexclone(&self, volume: &str, parent_volume: &str, parent_snapshot: &str) -> Result<()> {
        self.act(format!("flexclone {volume} <- {parent_volume}@{parent_snapshot}"))
    }
    fn destroy_volume(&self, volume: &str) -> Result<()> {
        self.act(format!("destroy {volume}"))
    }
    fn create_igroup(&self, name: &str, protocol: Protocol) -> Result<()> {
        self.act(format!("igroup-create {name} {}", protocol.as_str()))
    }
    fn add_initiators(&self, igroup: &str, initiators: &[String]) -> Result<()> {
        self.act(format!("igroup-add {igroup} {}", initiators.join(",")))
    }
    fn destroy_igroup(&self, name: &str) -> Result<()> {
        self.act(format!("igroup-destroy {name}"))
    }
    fn map_lun(&self, path: &str, igroup: &str) -> Result<()> {
        self.act(format!("lun-map {path} {igroup}"))
    }
    fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()> {
        self.act(format!("lun-unmap {path} {igroup}"))
    }
}

pub struct FakeTopology {
    world: Arc<World>,
    uri: String,
}

impl FakeTopology {
    fn act(&self, what: String) -> Result<()> {
        self.world.call(format!("{}: {what}", self.uri))
    }
}

impl TopologyPort for FakeTopology {
    fn ping(&self) -> Result<()> {
        self.act("ping".into())
    }
    fn topology(&self) -> Result<Topology> {
        self.act("topology".into())?;
        self.world
            .topology
            .clone()
            .ok_or_else(|| anyhow!("no topology configured"))
    }
    fn stop_balancer(&self) -> Result<()> {
        self.act("stop_balancer".into())
    }
    fn start_balancer(&self) -> Result<()> {
        self.act("start_balancer".into())
    }
    fn find_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<Option<Value>> {
        self.act(format!("find {db}.{collection} {filter}"))?;
        if collection == "system.replset" {
            return Ok(Some(json!({
                "_id": "src",
                "version": 7,
                "protocolVersion": 1,
                "members": [{"_id": 0, "host": "old:27017"}],
                "settings": {"chainingAllowed": true}
            })));
        }
        Ok(None)
    }
    fn insert_doc(&self, db: &str, collection: &str, doc: &Value) -> Result<()> {
        self.act(format!("insert {db}.{collection} {doc}"))
    }
    fn update_doc(&self, db: &str, collection: &str, filter: &Value, update: &Value) -> Result<u64> {
        self.act(format!("update {db}.{collection} {filter} {update}"))?;
        Ok(1)
    }
    fn delete_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<u64> {
        self.act(format!("delete {db}.{collection} {filter}"))?;
        Ok(1)
    }
    fn replset_config(&self) -> Result<Value> {
        self.act("replset_config".into())?;
        Ok(json!({"_id": "rs", "version": 1, "members": []}))
    }
    fn update_replset_config(&self, cfg: &Value) -> Result<()> {
        self.act(format!("reconfig {cfg}"))
    }
}

#[derive(Clone)]
pub struct FakeTools(pub Arc<World>);

impl Tooling for FakeTools {
    fn host(&self, address: &str, _user: &str) -> Arc<dyn HostPort> {
        Arc::new(FakeHost {
            world: self.0.clone(),
            addr: address.to_string(),
        })
    }
    fn storage(&self, system: &StorageSystemRecord) -> Result<Arc<dyn StoragePort>> {
        Ok(Arc::new(FakeStorage {
            world: self.0.clone(),
            svm: system.svm_name.clone(),
        }))
    }
    fn topology(&self, uri: &str) -> Arc<dyn TopologyPort> {
        Arc::new(FakeTopology {
            world: self.0.clone(),
            uri: uri.to_string(),
        })
    }
}

/// Catalog in a temp dir with cluster `name` and storage systems for `svms`.
pub fn catalog_with(name: &str, svms: &[&str]) -> (TempDir, Catalog) {
    let tmp = TempDir::new().unwrap();
    let cat = Catalog::open(tmp.path()).unwrap();
    cat.add(&ClusterRecord {
        cluster_name: name.into(),
        mongodb_uri: format!("mongodb://{name}"),
        auth_mode: AuthMode::None,
        mongod_config_path: "/etc/mongod.conf".into(),
        ssh_username: "root".into(),
    })
    .unwrap();
    for svm in svms {
        cat.add(&StorageSystemRecord {
            netapp_ip: format!("10.0.0.{}", svm.len()),
            svm_name: (*svm).into(),
            username: "admin".into(),
            password: "pw".into(),
        })
        .unwrap();
    }
    (tmp, cat)
}
