use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Replica set member state. Anything other than the three we act on is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Primary,
    Secondary,
    Arbiter,
    #[serde(other)]
    Other,
}

impl Role {
    pub fn from_state_str(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRIMARY" => Role::Primary,
            "SECONDARY" => Role::Secondary,
            "ARBITER" => Role::Arbiter,
            _ => Role::Other,
        }
    }

    #[inline]
    pub fn is_data_bearing(self) -> bool {
        match self {
            Role::Primary | Role::Secondary => true,
            Role::Arbiter | Role::Other => false,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Primary => "PRIMARY",
            Role::Secondary => "SECONDARY",
            Role::Arbiter => "ARBITER",
            Role::Other => "OTHER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunRef {
    pub svm_name: String,
    pub volume: String,
    pub lun_name: String,
    pub lun_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub mountpoint: String,
    pub fs_type: String,
    pub block_device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group_name: Option<String>,
    pub luns: Vec<LunRef>,
}

impl VolumeMapping {
    /// Distinct volume names, in mapping order.
    pub fn volumes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for l in &self.luns {
            if !out.contains(&l.volume) {
                out.push(l.volume.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub network_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<VolumeMapping>,
}

impl Member {
    pub fn new(id: i64, network_name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            network_name: network_name.into(),
            role,
            storage: None,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        crate::utils::naming::host_of(&self.network_name)
    }
}

/// `database -> collections`, captured so backups can be searched later.
pub type DatabaseMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_name: String,
    pub shard_members: Vec<Member>,
    #[serde(default)]
    pub databases: DatabaseMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cluster_type", rename_all = "snake_case")]
pub enum Topology {
    ReplicaSet {
        members: Vec<Member>,
        #[serde(default)]
        databases: DatabaseMap,
    },
    Sharded {
        config_servers: Vec<Member>,
        shards: Vec<Shard>,
    },
}

impl Topology {
    #[inline]
    pub fn is_sharded(&self) -> bool {
        matches!(self, Topology::Sharded { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Topology::ReplicaSet { .. } => "replica_set",
            Topology::Sharded { .. } => "sharded",
        }
    }

    /// Every member, config servers first, then shards in order.
    pub fn members(&self) -> Vec<&Member> {
        match self {
            Topology::ReplicaSet { members, .. } => members.iter().collect(),
            Topology::Sharded {
                config_servers,
                shards,
            } => config_servers
                .iter()
                .chain(shards.iter().flat_map(|s| s.shard_members.iter()))
                .collect(),
        }
    }

    pub fn members_mut(&mut self) -> Vec<&mut Member> {
        match self {
            Topology::ReplicaSet { members, .. } => members.iter_mut().collect(),
            Topology::Sharded {
                config_servers,
                shards,
            } => config_servers
                .iter_mut()
                .chain(shards.iter_mut().flat_map(|s| s.shard_members.iter_mut()))
                .collect(),
        }
    }

    pub fn data_bearing(&self) -> impl Iterator<Item = &Member> {
        self.members().into_iter().filter(|m| m.role.is_data_bearing())
    }

    /// Flattened `svm -> [volume]`; a volume shared by two members is listed twice.
    pub fn volumes_by_svm(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for m in self.data_bearing() {
            let Some(map) = &m.storage else { continue };
            let mut seen: Vec<(&str, &str)> = Vec::new();
            for l in &map.luns {
                let key = (l.svm_name.as_str(), l.volume.as_str());
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                out.entry(l.svm_name.clone())
                    .or_default()
                    .push(l.volume.clone());
            }
        }
        out
    }

    /// Databases (and their collections) seen on any replica set of the cluster.
    pub fn databases(&self) -> DatabaseMap {
        match self {
            Topology::ReplicaSet { databases, .. } => databases.clone(),
            Topology::Sharded { shards, .. } => {
                let mut out = DatabaseMap::new();
                for s in shards {
                    for (db, colls) in &s.databases {
                        let e = out.entry(db.clone()).or_default();
                        for c in colls {
                            if !e.contains(c) {
                                e.push(c.clone());
                            }
                        }
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn mapping(svm: &str, vols: &[&str], vg: Option<&str>) -> VolumeMapping {
        VolumeMapping {
            mountpoint: "/data".into(),
            fs_type: "xfs".into(),
            block_device: "/dev/mapper/vgdata-lvdata".into(),
            volume_group_name: vg.map(str::to_string),
            luns: vols
                .iter()
                .enumerate()
                .map(|(i, v)| LunRef {
                    svm_name: svm.into(),
                    volume: (*v).into(),
                    lun_name: format!("lun{i}"),
                    lun_id: i.to_string(),
                })
                .collect(),
        }
    }

    pub fn member(id: i64, host: &str, role: Role) -> Member {
        Member::new(id, format!("{host}:27017"), role)
    }

    /// A(P) B(S) C(S) D(arbiter)
    pub fn replica_set() -> Topology {
        Topology::ReplicaSet {
            members: vec![
                member(0, "a", Role::Primary),
                member(1, "b", Role::Secondary),
                member(2, "c", Role::Secondary),
                member(3, "d", Role::Arbiter),
            ],
            databases: DatabaseMap::from([("sales".into(), vec!["orders".into()])]),
        }
    }

    /// Annotated variant of [`replica_set`]: A,B on svm1, C on svm2.
    pub fn mapped_replica_set() -> Topology {
        let mut t = replica_set();
        for m in t.members_mut() {
            m.storage = match m.network_name.as_str() {
                "a:27017" => Some(mapping("svm1", &["volA"], Some("vga"))),
                "b:27017" => Some(mapping("svm1", &["volB"], Some("vgb"))),
                "c:27017" => Some(mapping("svm2", &["volC"], Some("vgc"))),
                _ => None,
            };
        }
        t
    }

    /// [`mapped_replica_set`] with B and C both on svm1 `volB`.
    pub fn shared_volume_replica_set() -> Topology {
        let mut t = mapped_replica_set();
        for m in t.members_mut() {
            if m.network_name == "c:27017" {
                m.storage = Some(mapping("svm1", &["volB"], Some("vgc")));
            }
        }
        t
    }

    /// One config server and two single-member shards, all mapped.
    pub fn mapped_sharded() -> Topology {
        let mut cs = member(0, "cfg1", Role::Primary);
        cs.storage = Some(mapping("svm1", &["cfgvol"], Some("vgcfg")));
        let mut s1 = member(0, "sh1", Role::Primary);
        s1.storage = Some(mapping("svm1", &["sh1vol"], Some("vgsh1")));
        let mut s2 = member(0, "sh2", Role::Primary);
        s2.storage = Some(mapping("svm2", &["sh2vol"], Some("vgsh2")));
        Topology::Sharded {
            config_servers: vec![cs],
            shards: vec![
                Shard {
                    shard_name: "shard01".into(),
                    shard_members: vec![s1],
                    databases: DatabaseMap::from([("app".into(), vec!["users".into()])]),
                },
                Shard {
                    shard_name: "shard02".into(),
                    shard_members: vec![s2],
                    databases: DatabaseMap::from([(
                        "app".into(),
                        vec!["users".into(), "events".into()],
                    )]),
                },
            ],
        }
    }
}
