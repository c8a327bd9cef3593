use std::{collections::BTreeSet, path::Path, thread, time::Duration};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing as log;

use super::spec::{ClusterKind, CloneSpec, MemberSpec};
use crate::{
    catalog::Catalog,
    commands::{StoragePorts, backup_record, cluster_record},
    config::{CloneDefaults, Config},
    error::{KairosError, StepReport},
    records::{
        CloneRecord, CloneUidMark, ClonedMember, ClonedReplicaSet, ClonedShard, ClonedStorage,
        ClonedTopology,
    },
    tooling::{HostPort, Tooling, ontap::Protocol},
    topology::{Member, Topology},
    utils::{
        lock::LockGuard,
        naming::{clone_volume_name, host_of, igroup_name, lun_path, seed_list},
        process::CmdSpec,
        time::{current_epoch, now},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum GroupKind {
    ReplicaSet,
    ConfigServers,
    Shard(String),
}

impl GroupKind {
    fn label(&self) -> String {
        match self {
            GroupKind::ReplicaSet => "replica set".into(),
            GroupKind::ConfigServers => "config servers".into(),
            GroupKind::Shard(name) => format!("shard {name}"),
        }
    }
}

/// Everything decided before the first side effect.
#[derive(Debug)]
struct StoragePlan {
    svm: String,
    igroup: String,
    protocol: Protocol,
    initiators: Vec<String>,
    iscsi_target: Option<String>,
    vg: String,
    fs_type: String,
    device: String,
    /// `(clone, parent)` volume pairs.
    volumes: Vec<(String, String)>,
    lun_paths: Vec<String>,
}

struct MemberPlan<'s> {
    spec: &'s MemberSpec,
    storage: Option<StoragePlan>,
}

struct GroupPlan<'s> {
    kind: GroupKind,
    setname: String,
    members: Vec<MemberPlan<'s>>,
}

impl GroupPlan<'_> {
    fn seed_list(&self) -> String {
        let hosts: Vec<String> = self.members.iter().map(|m| m.spec.address()).collect();
        seed_list(&self.setname, &hosts)
    }

    fn replset_members(&self) -> Vec<Value> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, m)| member_doc(i, m.spec))
            .collect()
    }
}

pub struct CloneOrchestrator<'a> {
    catalog: &'a Catalog,
    tools: &'a dyn Tooling,
    defaults: &'a CloneDefaults,
}

impl<'a> CloneOrchestrator<'a> {
    pub fn new(catalog: &'a Catalog, tools: &'a dyn Tooling, defaults: &'a CloneDefaults) -> Self {
        Self {
            catalog,
            tools,
            defaults,
        }
    }

    /// Builds an independent cluster from FlexClones of `backup`. A failure leaves whatever
    /// was provisioned in place and records nothing.
    pub fn create(
        &self,
        cluster: &str,
        backup: &str,
        clone_name: &str,
        spec: &CloneSpec,
        description: &str,
        ssh_user: Option<&str>,
    ) -> Result<CloneRecord> {
        if !Config::valid_name(clone_name) {
            return Err(KairosError::Validation(format!("invalid clone name '{clone_name}'")).into());
        }
        spec.validate()?;
        let rec = cluster_record(self.catalog, cluster)?;
        let user = ssh_user.unwrap_or(&rec.ssh_username);

        let _lease = LockGuard::for_cluster(self.catalog.dir(), cluster)?;
        let bkp = backup_record(self.catalog, cluster, backup)?;
        if self
            .catalog
            .find_one::<CloneRecord>(|c| c.cluster_name == cluster && c.clone_name == clone_name)?
            .is_some()
        {
            return Err(KairosError::DuplicateKey {
                collection: "clones",
                key: format!("{cluster}/{clone_name}"),
            }
            .into());
        }
        let uid = self.next_uid(cluster)?;
        log::info!("[clone] {cluster}/{backup} -> {clone_name} (uid {uid})");

        let groups = self.plan(spec, &bkp.topology, backup, clone_name, uid, user)?;

        let mut ports = StoragePorts::new(self.catalog, self.tools);
        let cs_seed = groups
            .iter()
            .find(|g| g.kind == GroupKind::ConfigServers)
            .map(|g| g.seed_list());
        let shard_hosts: Vec<(String, String)> = groups
            .iter()
            .filter_map(|g| match &g.kind {
                GroupKind::Shard(name) => Some((name.clone(), g.seed_list())),
                _ => None,
            })
            .collect();

        for g in &groups {
            for m in &g.members {
                let host = self.tools.host(&m.spec.hostname, user);
                if let Some(sp) = &m.storage {
                    self.provision(host.as_ref(), sp, m.spec, backup, &mut ports)
                        .with_context(|| format!("provision {}", m.spec.address()))?;
                }
                self.bring_up(host.as_ref(), spec, g, m.spec, cs_seed.as_deref(), &shard_hosts)
                    .with_context(|| format!("start {}", m.spec.address()))?;
            }
            self.verify_membership(g);
        }

        if let Some(cs_seed) = &cs_seed {
            for router in &spec.mongos {
                self.start_router(router, cs_seed, user)
                    .with_context(|| format!("start mongos on {router}"))?;
            }
        }

        let record = CloneRecord {
            cluster_name: cluster.to_string(),
            clone_name: clone_name.to_string(),
            backup_name: backup.to_string(),
            clone_uid: uid,
            created_at: now(),
            description: description.to_string(),
            topology: cloned_topology(spec.cluster_type, groups, &spec.mongos),
        };
        self.catalog.add(&record)?;
        log::info!("[clone] {clone_name} is up");
        Ok(record)
    }

    /// Best-effort: every step runs regardless of earlier failures and the record is always removed.
    pub fn delete(&self, cluster: &str, clone_name: &str, ssh_user: Option<&str>) -> Result<StepReport> {
        let rec = cluster_record(self.catalog, cluster)?;
        let user = ssh_user.unwrap_or(&rec.ssh_username);
        let _lease = LockGuard::for_cluster(self.catalog.dir(), cluster)?;
        let clone = self
            .catalog
            .find_one::<CloneRecord>(|c| c.cluster_name == cluster && c.clone_name == clone_name)?
            .ok_or_else(|| KairosError::not_found("clone", format!("{cluster}/{clone_name}")))?;

        let mut report = StepReport::default();
        let mongos = proc_name(&self.defaults.mongos_bin);
        for router in clone.topology.routers() {
            let host = self.tools.host(host_of(router), user);
            report.record("stop-mongos", router, host.kill_process(mongos).map(|_| ()));
        }

        let members = clone.topology.members();
        let mongod = proc_name(&self.defaults.mongod_bin);
        for m in &members {
            let host = self.tools.host(&m.hostname, user);
            report.record("stop-mongod", &m.hostname, host.kill_process(mongod).map(|_| ()));
        }
        settle(self.defaults.teardown_settle_secs);

        let mut ports = StoragePorts::new(self.catalog, self.tools);
        for m in &members {
            let Some(st) = &m.storage else { continue };
            let host = self.tools.host(&m.hostname, user);
            let target = m.hostname.as_str();
            report.record("umount", target, host.unmount(&st.mountpoint));
            if let Some(vg) = &st.volume_group_name {
                report.record("vg-deactivate", target, host.deactivate_vg(vg));
            }
            match ports.get(&st.svm_name) {
                Ok(port) => {
                    for path in &st.lun_paths {
                        report.record("lun-unmap", path, port.unmap_lun(path, &st.igroup_name));
                    }
                    for vol in &st.cloned_volumes {
                        report.record("volume-destroy", vol, port.destroy_volume(vol));
                    }
                    report.record("igroup-destroy", &st.igroup_name, port.destroy_igroup(&st.igroup_name));
                }
                Err(e) => report.record("storage-connect", &st.svm_name, Err(e)),
            }
            report.record("rescan", target, host.rescan());
        }

        self.catalog
            .remove_one::<CloneRecord>(|c| c.cluster_name == cluster && c.clone_name == clone_name)?;
        log::info!(
            "[teardown] {clone_name} removed ({} of {} steps failed)",
            report.failures.len(),
            report.attempted
        );
        Ok(report)
    }

    pub fn list(&self, cluster: Option<&str>) -> Result<Vec<CloneRecord>> {
        let mut out = self
            .catalog
            .find_all::<CloneRecord>(|c| cluster.is_none_or(|n| c.cluster_name == n))?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Epoch seconds, strictly above every uid already used for the cluster,
    /// including those of clones torn down since. Reserved on return.
    fn next_uid(&self, cluster: &str) -> Result<u64> {
        let catalogued = self
            .catalog
            .find_all::<CloneRecord>(|c| c.cluster_name == cluster)?
            .iter()
            .map(|c| c.clone_uid)
            .max();
        let mark = self
            .catalog
            .find_one::<CloneUidMark>(|m| m.cluster_name == cluster)?;
        let now = current_epoch();
        let uid = match catalogued.max(mark.as_ref().map(|m| m.last_uid)) {
            Some(m) if m >= now => m + 1,
            _ => now,
        };
        if mark.is_some() {
            self.catalog
                .edit::<CloneUidMark>(|m| m.cluster_name == cluster, |m| m.last_uid = uid)?;
        } else {
            self.catalog.add(&CloneUidMark {
                cluster_name: cluster.to_string(),
                last_uid: uid,
            })?;
        }
        Ok(uid)
    }

    fn plan<'s>(
        &self,
        spec: &'s CloneSpec,
        source: &Topology,
        backup: &str,
        clone_name: &str,
        uid: u64,
        user: &str,
    ) -> Result<Vec<GroupPlan<'s>>> {
        let mut groups: Vec<(GroupKind, String, &'s [MemberSpec], Vec<&Member>)> = Vec::new();
        match (spec.cluster_type, source) {
            (ClusterKind::ReplicaSet, Topology::ReplicaSet { members, .. }) => {
                if let Some(rs) = &spec.replica_set {
                    groups.push((
                        GroupKind::ReplicaSet,
                        rs.setname.clone(),
                        rs.members.as_slice(),
                        members.iter().collect(),
                    ));
                }
            }
            (
                ClusterKind::Sharded,
                Topology::Sharded {
                    config_servers,
                    shards,
                },
            ) => {
                if let Some(cs) = &spec.config_servers {
                    groups.push((
                        GroupKind::ConfigServers,
                        cs.setname.clone(),
                        cs.members.as_slice(),
                        config_servers.iter().collect(),
                    ));
                }
                for s in &spec.shards {
                    let src = shards
                        .iter()
                        .find(|b| b.shard_name == s.shard_name)
                        .ok_or_else(|| {
                            KairosError::Validation(format!(
                                "backup {backup} has no shard {}",
                                s.shard_name
                            ))
                        })?;
                    groups.push((
                        GroupKind::Shard(s.shard_name.clone()),
                        s.setname().to_string(),
                        s.members.as_slice(),
                        src.shard_members.iter().collect(),
                    ));
                }
            }
            (want, have) => {
                return Err(KairosError::Validation(format!(
                    "cannot clone a {} backup as {want:?}",
                    have.kind()
                ))
                .into());
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (kind, setname, members, sources) in groups {
            // Each source member backs at most one clone member of its group.
            let mut taken = vec![false; sources.len()];
            let mut plans = Vec::with_capacity(members.len());
            for m in members {
                let storage = if m.arbiter_only {
                    None
                } else {
                    let src = pick_source(m, &kind, &sources, &mut taken, backup)?;
                    Some(
                        self.plan_storage(m, src, backup, clone_name, uid, user)
                            .with_context(|| format!("plan {}", m.address()))?,
                    )
                };
                plans.push(MemberPlan { spec: m, storage });
            }
            out.push(GroupPlan {
                kind,
                setname,
                members: plans,
            });
        }

        let mut names = BTreeSet::new();
        for mp in out.iter().flat_map(|g| &g.members) {
            for (cloned, _) in mp.storage.iter().flat_map(|sp| &sp.volumes) {
                if !names.insert(cloned.as_str()) {
                    return Err(KairosError::Validation(format!(
                        "clone volume {cloned} would be created twice (again for {})",
                        mp.spec.address()
                    ))
                    .into());
                }
            }
        }
        Ok(out)
    }

    fn plan_storage(
        &self,
        m: &MemberSpec,
        src: &Member,
        backup: &str,
        clone_name: &str,
        uid: u64,
        user: &str,
    ) -> Result<StoragePlan> {
        let role = m.source_role();
        let map = src.storage.as_ref().ok_or_else(|| {
            KairosError::Validation(format!(
                "backup {backup} has no storage mapping for {}",
                src.network_name
            ))
        })?;
        let vg = map.volume_group_name.clone().ok_or_else(|| {
            KairosError::Validation(format!(
                "{} is not on LVM; only volume-group layouts can be cloned",
                src.network_name
            ))
        })?;
        let svm = m.svm_name.clone().unwrap_or_default();
        if let Some(l) = map.luns.iter().find(|l| l.svm_name != svm) {
            return Err(KairosError::Validation(format!(
                "{} asks for a {role} clone on {svm}, but {}:{} lives on {}",
                m.address(),
                src.network_name,
                l.volume,
                l.svm_name
            ))
            .into());
        }

        let host = self.tools.host(&m.hostname, user);
        let hostname = host.hostname()?;
        let initiators = match m.protocol {
            Protocol::Iscsi => vec![host.iscsi_initiator_name()?],
            Protocol::Fcp => m.initiators.clone(),
        };

        let mut volumes: Vec<(String, String)> = Vec::new();
        let mut lun_paths = Vec::with_capacity(map.luns.len());
        for l in &map.luns {
            let cloned = clone_volume_name(clone_name, &l.volume, uid);
            if !volumes.iter().any(|(c, _)| *c == cloned) {
                volumes.push((cloned.clone(), l.volume.clone()));
            }
            lun_paths.push(lun_path(&cloned, &l.lun_name));
        }
        log::info!(
            "[clone] {} <- {} ({role}): {:?}",
            m.address(),
            src.network_name,
            volumes.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>()
        );

        Ok(StoragePlan {
            svm,
            igroup: igroup_name(&hostname, clone_name),
            protocol: m.protocol,
            initiators,
            iscsi_target: m.iscsi_target.clone(),
            vg,
            fs_type: map.fs_type.clone(),
            device: map.block_device.clone(),
            volumes,
            lun_paths,
        })
    }

    fn provision(
        &self,
        host: &dyn HostPort,
        sp: &StoragePlan,
        m: &MemberSpec,
        backup: &str,
        ports: &mut StoragePorts<'_>,
    ) -> Result<()> {
        let port = ports.get(&sp.svm)?;
        port.create_igroup(&sp.igroup, sp.protocol)?;
        port.add_initiators(&sp.igroup, &sp.initiators)?;
        for (cloned, parent) in &sp.volumes {
            log::info!("[clone] flexclone {cloned} <- {parent}@{backup}");
            port.create_flexclone(cloned, parent, backup)?;
        }
        for path in &sp.lun_paths {
            port.map_lun(path, &sp.igroup)?;
        }

        if let Some(target) = &sp.iscsi_target {
            host.iscsi_discover(target)?;
            host.iscsi_login_all()?;
        }
        host.rescan()?;
        host.activate_vg(&sp.vg)?;
        host.run_command(CmdSpec::new("mkdir").args(["-p", m.mountpoint.as_str()]))?;
        host.mount(&sp.device, &m.mountpoint, &sp.fs_type)
    }

    /// Recovery-mode start, membership rewrite, then restart as a replica set member.
    fn bring_up(
        &self,
        host: &dyn HostPort,
        spec: &CloneSpec,
        g: &GroupPlan<'_>,
        m: &MemberSpec,
        cs_seed: Option<&str>,
        shard_hosts: &[(String, String)],
    ) -> Result<()> {
        let d = self.defaults;
        let mongod = proc_name(&d.mongod_bin);
        let lockfile = format!("{}/mongod.lock", m.mountpoint.trim_end_matches('/'));

        if m.arbiter_only {
            host.remove_file(&lockfile)?;
            host.remove_file(&d.pid_file)?;
        }
        log::info!("[clone] {}: starting in recovery mode", m.address());
        host.run_as(&d.run_user, self.mongod_cmd(spec, m, None))?;

        let admin = self
            .tools
            .topology(&format!("mongodb://{}/?directConnection=true", m.address()));
        let current = admin.find_doc("local", "system.replset", &json!({}))?;
        let doc = replset_doc(current, &g.setname, g.replset_members());
        admin.delete_doc("local", "system.replset", &json!({}))?;
        admin.insert_doc("local", "system.replset", &doc)?;
        admin.delete_doc("admin", "system.version", &json!({"_id": "minOpTimeRecovery"}))?;

        if !m.arbiter_only {
            match (&g.kind, cs_seed) {
                (GroupKind::ConfigServers, _) => {
                    for (shard, hosts) in shard_hosts {
                        admin.update_doc(
                            "config",
                            "shards",
                            &json!({"_id": shard}),
                            &json!({"$set": {"host": hosts}}),
                        )?;
                    }
                }
                (GroupKind::Shard(_), Some(cs)) => {
                    admin.update_doc(
                        "admin",
                        "system.version",
                        &json!({"_id": "shardIdentity"}),
                        &json!({"$set": {"configsvrConnectionString": cs}}),
                    )?;
                }
                _ => {}
            }
        }

        host.kill_process(mongod)?;
        host.remove_file(&lockfile)?;
        host.remove_file(&d.pid_file)?;
        settle(d.settle_secs);
        log::info!("[clone] {}: starting as {} member", m.address(), g.setname);
        host.run_as(&d.run_user, self.mongod_cmd(spec, m, Some(g)))
    }

    fn mongod_cmd(&self, spec: &CloneSpec, m: &MemberSpec, group: Option<&GroupPlan<'_>>) -> CmdSpec {
        let port = m.port.to_string();
        let mut cmd = CmdSpec::new(&self.defaults.mongod_bin).args([
            "--logpath",
            spec.log_path.as_str(),
            "--dbpath",
            m.mountpoint.as_str(),
            "--bind_ip",
            m.hostname.as_str(),
            "--port",
            port.as_str(),
            "--fork",
        ]);
        if spec.dir_per_db {
            cmd = cmd.arg("--directoryperdb");
        }
        if let Some(g) = group {
            cmd = cmd.args(["--replSet", g.setname.as_str()]);
            match g.kind {
                GroupKind::ConfigServers => cmd = cmd.arg("--configsvr"),
                GroupKind::Shard(_) => cmd = cmd.arg("--shardsvr"),
                GroupKind::ReplicaSet => {}
            }
        }
        cmd
    }

    /// Forces the running config to the cloned membership if any host still points elsewhere.
    fn verify_membership(&self, g: &GroupPlan<'_>) {
        let Some(first) = g.members.iter().find(|m| !m.spec.arbiter_only) else {
            return;
        };
        let admin = self.tools.topology(&format!(
            "mongodb://{}/?directConnection=true",
            first.spec.address()
        ));
        let want: Vec<String> = g.members.iter().map(|m| m.spec.address()).collect();
        let res = admin.replset_config().and_then(|mut cfg| {
            let have: Vec<String> = cfg["members"]
                .as_array()
                .map(|ms| {
                    ms.iter()
                        .filter_map(|m| m["host"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if have == want {
                return Ok(());
            }
            log::warn!("[clone] {} reports members {have:?}, forcing {want:?}", g.setname);
            cfg["members"] = Value::Array(g.replset_members());
            admin.update_replset_config(&cfg)
        });
        if let Err(e) = res {
            log::warn!("[clone] could not verify {} membership: {e:#}", g.setname);
        }
    }

    fn start_router(&self, router: &str, cs_seed: &str, user: &str) -> Result<()> {
        let bind = host_of(router);
        let host = self.tools.host(bind, user);
        let mut cmd = CmdSpec::new(&self.defaults.mongos_bin).args(["--bind_ip", bind]);
        if let Some((_, port)) = router.rsplit_once(':') {
            cmd = cmd.args(["--port", port]);
        }
        cmd = cmd.args([
            "--configdb",
            cs_seed,
            "--fork",
            "--logpath",
            self.defaults.mongos_log_path.as_str(),
        ]);
        log::info!("[clone] starting mongos on {router}");
        host.run_command(cmd).map(|_| ())
    }
}

/// The first unused member of `sources` holding the role `m` clones from.
fn pick_source<'a>(
    m: &MemberSpec,
    kind: &GroupKind,
    sources: &[&'a Member],
    taken: &mut [bool],
    backup: &str,
) -> Result<&'a Member> {
    let role = m.source_role();
    let free = sources
        .iter()
        .zip(taken.iter())
        .position(|(s, used)| s.role == role && !*used);
    match free {
        Some(i) => {
            taken[i] = true;
            Ok(sources[i])
        }
        None => {
            let have = sources.iter().filter(|s| s.role == role).count();
            Err(KairosError::Validation(format!(
                "backup {backup} has {have} {role} member(s) in {}, not enough for {}",
                kind.label(),
                m.address()
            ))
            .into())
        }
    }
}

fn member_doc(idx: usize, m: &MemberSpec) -> Value {
    let priority = if m.arbiter_only { 0 } else { 1 };
    json!({
        "_id": idx,
        "host": m.address(),
        "arbiterOnly": m.arbiter_only,
        "buildIndexes": true,
        "hidden": false,
        "priority": priority,
        "tags": {},
        "secondaryDelaySecs": 0,
        "votes": 1,
    })
}

/// Keeps version, protocol and settings of the restored document; replaces identity and members.
fn replset_doc(current: Option<Value>, setname: &str, members: Vec<Value>) -> Value {
    let mut doc = match current {
        Some(Value::Object(o)) => Value::Object(o),
        _ => json!({"version": 1, "protocolVersion": 1}),
    };
    doc["_id"] = Value::from(setname);
    doc["members"] = Value::Array(members);
    doc
}

fn cloned_topology(kind: ClusterKind, groups: Vec<GroupPlan<'_>>, mongos: &[String]) -> ClonedTopology {
    let mut rs = None;
    let mut cs = None;
    let mut shards = Vec::new();
    for g in groups {
        let set = ClonedReplicaSet {
            setname: g.setname.clone(),
            members: g.members.iter().map(cloned_member).collect(),
        };
        match g.kind {
            GroupKind::ReplicaSet => rs = Some(set),
            GroupKind::ConfigServers => cs = Some(set),
            GroupKind::Shard(shard_name) => shards.push(ClonedShard {
                shard_name,
                replica_set: set,
            }),
        }
    }
    let empty = || ClonedReplicaSet {
        setname: String::new(),
        members: Vec::new(),
    };
    match kind {
        ClusterKind::ReplicaSet => ClonedTopology::ReplicaSet {
            replica_set: rs.unwrap_or_else(empty),
        },
        ClusterKind::Sharded => ClonedTopology::Sharded {
            config_servers: cs.unwrap_or_else(empty),
            shards,
            mongos: mongos.to_vec(),
        },
    }
}

fn cloned_member(m: &MemberPlan<'_>) -> ClonedMember {
    ClonedMember {
        hostname: m.spec.hostname.clone(),
        port: m.spec.port,
        arbiter_only: m.spec.arbiter_only,
        storage: m.storage.as_ref().map(|sp| ClonedStorage {
            igroup_name: sp.igroup.clone(),
            svm_name: sp.svm.clone(),
            mountpoint: m.spec.mountpoint.clone(),
            volume_group_name: Some(sp.vg.clone()),
            cloned_volumes: sp.volumes.iter().map(|(c, _)| c.clone()).collect(),
            lun_paths: sp.lun_paths.clone(),
        }),
    }
}

fn proc_name(bin: &str) -> &str {
    Path::new(bin)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(bin)
}

fn settle(secs: u64) {
    if secs > 0 {
        thread::sleep(Duration::from_secs(secs));
    }
}
