use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::topology::Topology;

/// A document stored in one catalog collection, unique on `key()`.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;
    fn key(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_name: String,
    pub mongodb_uri: String,
    pub auth_mode: AuthMode,
    pub mongod_config_path: String,
    pub ssh_username: String,
}

impl Record for ClusterRecord {
    const COLLECTION: &'static str = "clusters";
    fn key(&self) -> String {
        self.cluster_name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSystemRecord {
    pub netapp_ip: String,
    pub svm_name: String,
    pub username: String,
    pub password: String,
}

impl Record for StorageSystemRecord {
    const COLLECTION: &'static str = "storage_systems";
    fn key(&self) -> String {
        format!("{}/{}", self.netapp_ip, self.svm_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub cluster_name: String,
    pub backup_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub retention: OffsetDateTime,
    pub topology: Topology,
}

impl Record for BackupRecord {
    const COLLECTION: &'static str = "backups";
    fn key(&self) -> String {
        format!("{}/{}", self.cluster_name, self.backup_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedMember {
    pub hostname: String,
    pub port: u16,
    pub arbiter_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ClonedStorage>,
}

/// What was provisioned for one non-arbiter member; teardown works from this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedStorage {
    pub igroup_name: String,
    pub svm_name: String,
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group_name: Option<String>,
    pub cloned_volumes: Vec<String>,
    pub lun_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedReplicaSet {
    pub setname: String,
    pub members: Vec<ClonedMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedShard {
    pub shard_name: String,
    #[serde(flatten)]
    pub replica_set: ClonedReplicaSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cluster_type", rename_all = "snake_case")]
pub enum ClonedTopology {
    ReplicaSet {
        replica_set: ClonedReplicaSet,
    },
    Sharded {
        config_servers: ClonedReplicaSet,
        shards: Vec<ClonedShard>,
        mongos: Vec<String>,
    },
}

impl ClonedTopology {
    pub fn members(&self) -> Vec<&ClonedMember> {
        match self {
            ClonedTopology::ReplicaSet { replica_set } => replica_set.members.iter().collect(),
            ClonedTopology::Sharded {
                config_servers,
                shards,
                ..
            } => config_servers
                .members
                .iter()
                .chain(shards.iter().flat_map(|s| s.replica_set.members.iter()))
                .collect(),
        }
    }

    pub fn routers(&self) -> &[String] {
        match self {
            ClonedTopology::ReplicaSet { .. } => &[],
            ClonedTopology::Sharded { mongos, .. } => mongos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRecord {
    pub cluster_name: String,
    pub clone_name: String,
    pub backup_name: String,
    pub clone_uid: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub description: String,
    pub topology: ClonedTopology,
}

impl Record for CloneRecord {
    const COLLECTION: &'static str = "clones";
    fn key(&self) -> String {
        format!("{}/{}", self.cluster_name, self.clone_name)
    }
}

/// Highest clone uid ever handed out for a cluster. Survives teardown so a
/// re-created clone never reuses volume names that may still exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneUidMark {
    pub cluster_name: String,
    pub last_uid: u64,
}

impl Record for CloneUidMark {
    const COLLECTION: &'static str = "clone_uids";
    fn key(&self) -> String {
        self.cluster_name.clone()
    }
}
