use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{error::KairosError, tooling::ontap::Protocol, topology::Role};

const DEFAULT_PORT: u16 = 27017;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    ReplicaSet,
    Sharded,
}

/// Desired shape of a cloned cluster, read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneSpec {
    pub cluster_type: ClusterKind,
    #[serde(default)]
    pub dir_per_db: bool,
    #[serde(default = "default_log_path")]
    pub log_path: String,
    pub replica_set: Option<ReplicaSetSpec>,
    pub config_servers: Option<ReplicaSetSpec>,
    #[serde(default)]
    pub shards: Vec<ShardSpec>,
    #[serde(default)]
    pub mongos: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaSetSpec {
    pub setname: String,
    pub members: Vec<MemberSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardSpec {
    pub shard_name: String,
    /// Defaults to `shard_name`.
    pub setname: Option<String>,
    pub members: Vec<MemberSpec>,
}

impl ShardSpec {
    pub fn setname(&self) -> &str {
        self.setname.as_deref().unwrap_or(&self.shard_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberSpec {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub arbiter_only: bool,
    /// Role of the backed-up member whose volumes this one is cloned from.
    pub clone_from: Option<String>,
    pub svm_name: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub iscsi_target: Option<String>,
    /// FC WWPNs; iSCSI initiators are read from the host instead.
    #[serde(default)]
    pub initiators: Vec<String>,
    pub mountpoint: String,
}

impl MemberSpec {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn source_role(&self) -> Role {
        self.clone_from
            .as_deref()
            .map(Role::from_state_str)
            .unwrap_or(Role::Other)
    }
}

fn default_log_path() -> String {
    "/var/log/mongodb/mongod.log".into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_protocol() -> Protocol {
    Protocol::Iscsi
}

impl CloneSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let body =
            fs::read_to_string(path).with_context(|| format!("read clone spec {}", path.display()))?;
        let spec: CloneSpec =
            toml::from_str(&body).with_context(|| format!("parse clone spec {}", path.display()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Rejects anything that would fail halfway through provisioning.
    pub fn validate(&self) -> Result<()> {
        match self.cluster_type {
            ClusterKind::ReplicaSet => {
                let rs = self
                    .replica_set
                    .as_ref()
                    .ok_or_else(|| invalid("replica_set section is required".into()))?;
                if self.config_servers.is_some() || !self.shards.is_empty() || !self.mongos.is_empty() {
                    return Err(invalid(
                        "config_servers, shards and mongos apply to sharded clones only".into(),
                    ));
                }
                check_group("replica set", rs.setname.as_str(), &rs.members)?;
            }
            ClusterKind::Sharded => {
                if self.replica_set.is_some() {
                    return Err(invalid("replica_set section is not valid for a sharded clone".into()));
                }
                let cs = self
                    .config_servers
                    .as_ref()
                    .ok_or_else(|| invalid("config_servers section is required".into()))?;
                check_group("config servers", cs.setname.as_str(), &cs.members)?;
                if self.shards.is_empty() {
                    return Err(invalid("at least one shard is required".into()));
                }
                let mut names = BTreeSet::new();
                for s in &self.shards {
                    if !names.insert(s.shard_name.as_str()) {
                        return Err(invalid(format!("shard {} listed twice", s.shard_name)));
                    }
                    check_group(&format!("shard {}", s.shard_name), s.setname(), &s.members)?;
                }
                if self.mongos.is_empty() {
                    return Err(invalid("at least one mongos host is required".into()));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for m in self.members() {
            if !seen.insert(m.address()) {
                return Err(invalid(format!("{} appears more than once", m.address())));
            }
        }
        Ok(())
    }

    pub fn members(&self) -> Vec<&MemberSpec> {
        let groups = self
            .replica_set
            .iter()
            .chain(self.config_servers.iter())
            .map(|g| &g.members)
            .chain(self.shards.iter().map(|s| &s.members));
        groups.flat_map(|g| g.iter()).collect()
    }
}

fn check_group(label: &str, setname: &str, members: &[MemberSpec]) -> Result<()> {
    if setname.trim().is_empty() {
        return Err(invalid(format!("{label}: setname is empty")));
    }
    if members.len() % 2 == 0 {
        return Err(invalid(format!(
            "{label}: {} members, an odd number is required",
            members.len()
        )));
    }
    for m in members {
        if m.arbiter_only {
            continue;
        }
        if !m.source_role().is_data_bearing() {
            return Err(invalid(format!(
                "{label}: {} needs clone_from = \"primary\" or \"secondary\"",
                m.address()
            )));
        }
        if m.svm_name.as_deref().is_none_or(str::is_empty) {
            return Err(invalid(format!("{label}: {} has no svm_name", m.address())));
        }
        match m.protocol {
            Protocol::Iscsi if m.iscsi_target.is_none() => {
                return Err(invalid(format!("{label}: {} has no iscsi_target", m.address())));
            }
            Protocol::Fcp if m.initiators.is_empty() => {
                return Err(invalid(format!("{label}: {} has no FC initiators", m.address())));
            }
            _ => {}
        }
    }
    Ok(())
}

fn invalid(msg: String) -> anyhow::Error {
    KairosError::Validation(msg).into()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    pub const RS_SPEC: &str = r#"
cluster_type = "replica_set"
log_path = "/var/log/mongodb/clone.log"

[replica_set]
setname = "rs0c"

[[replica_set.members]]
hostname = "n1"
clone_from = "primary"
svm_name = "svm1"
iscsi_target = "10.0.0.5"
mountpoint = "/data"

[[replica_set.members]]
hostname = "n2"
clone_from = "secondary"
svm_name = "svm1"
iscsi_target = "10.0.0.5"
mountpoint = "/data"

[[replica_set.members]]
hostname = "n3"
arbiter_only = true
mountpoint = "/arb"
"#;

    pub const SHARDED_SPEC: &str = r#"
cluster_type = "sharded"
dir_per_db = true
mongos = ["r1"]

[config_servers]
setname = "csc"

[[config_servers.members]]
hostname = "k1"
port = 27019
clone_from = "primary"
svm_name = "svm1"
iscsi_target = "10.0.0.5"
mountpoint = "/data"

[[shards]]
shard_name = "shard01"

[[shards.members]]
hostname = "k2"
port = 27018
clone_from = "primary"
svm_name = "svm1"
iscsi_target = "10.0.0.5"
mountpoint = "/data"

[[shards]]
shard_name = "shard02"
setname = "sh2c"

[[shards.members]]
hostname = "k3"
port = 27018
clone_from = "primary"
svm_name = "svm2"
iscsi_target = "10.0.0.6"
mountpoint = "/data"
"#;

    pub fn parse(s: &str) -> CloneSpec {
        let spec: CloneSpec = toml::from_str(s).unwrap();
        spec.validate().unwrap();
        spec
    }

    fn rejected(s: &str) -> String {
        let spec: CloneSpec = toml::from_str(s).unwrap();
        let err = spec.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KairosError>(),
            Some(KairosError::Validation(_))
        ));
        err.to_string()
    }

    #[test]
    fn replica_set_spec_defaults() {
        let spec = parse(RS_SPEC);
        let rs = spec.replica_set.as_ref().unwrap();
        assert_eq!(rs.members[0].port, 27017);
        assert_eq!(rs.members[0].protocol, Protocol::Iscsi);
        assert_eq!(rs.members[1].source_role(), Role::Secondary);
        assert!(rs.members[2].arbiter_only);
        assert!(!spec.dir_per_db);
    }

    #[test]
    fn sharded_spec_setname_defaults_to_shard_name() {
        let spec = parse(SHARDED_SPEC);
        assert_eq!(spec.shards[0].setname(), "shard01");
        assert_eq!(spec.shards[1].setname(), "sh2c");
        assert_eq!(spec.members().len(), 3);
    }

    #[test]
    fn even_member_count_rejected() {
        let even = RS_SPEC.replace(
            "[[replica_set.members]]\nhostname = \"n3\"\narbiter_only = true\nmountpoint = \"/arb\"\n",
            "",
        );
        assert!(rejected(&even).contains("odd number"));
    }

    #[test]
    fn even_shard_rejected() {
        let extra = format!(
            "{SHARDED_SPEC}\n[[shards.members]]\nhostname = \"k4\"\nport = 27018\narbiter_only = true\nmountpoint = \"/a\"\n"
        );
        assert!(rejected(&extra).contains("shard shard02"));
    }

    #[test]
    fn data_member_needs_source_role() {
        let bad = RS_SPEC.replace("clone_from = \"primary\"", "clone_from = \"arbiter\"");
        assert!(rejected(&bad).contains("clone_from"));
    }

    #[test]
    fn sharded_needs_routers() {
        let bad = SHARDED_SPEC.replace("mongos = [\"r1\"]", "");
        assert!(rejected(&bad).contains("mongos"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let bad = format!("bogus = 1\n{RS_SPEC}");
        assert!(toml::from_str::<CloneSpec>(&bad).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(RS_SPEC.as_bytes()).unwrap();
        let spec = CloneSpec::load(f.path()).unwrap();
        assert_eq!(spec.cluster_type, ClusterKind::ReplicaSet);
    }
}
