use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing as log;

use crate::{
    config::Mongo,
    topology::{DatabaseMap, Member, Role, Shard, Topology},
    utils::{
        naming::parse_seed_list,
        process::{CmdSpec, Runner},
    },
};

/// Throws on `{ok: 0}` so mongosh exits non-zero.
const PRELUDE: &str = "function must(r) { if (!r || r.ok !== 1) { throw new Error(JSON.stringify(r)); } return r; }\n";

const STATUS_JS: &str = r#"(function () {
  const admin = db.getSiblingDB('admin');
  const names = must(admin.runCommand({ listDatabases: 1, nameOnly: true })).databases.map(d => d.name);
  const shards = names.includes('config')
    ? db.getSiblingDB('config').shards.find({}, { _id: 1, host: 1 }).toArray()
    : [];
  const st = admin.runCommand({ replSetGetStatus: 1 });
  const members = st.ok === 1
    ? st.members.map(m => ({ _id: m._id, name: m.name, stateStr: m.stateStr }))
    : [];
  const databases = {};
  for (const n of names) {
    if (['admin', 'config', 'local'].includes(n)) continue;
    databases[n] = db.getSiblingDB(n).getCollectionNames();
  }
  return { shards: shards, members: members, databases: databases };
})()"#;

const ROUTERS_JS: &str =
    "db.getSiblingDB('config').mongos.find({}, { _id: 1 }).sort({ ping: -1 }).toArray().map(m => m._id)";

pub trait TopologyPort: Send + Sync {
    fn ping(&self) -> Result<()>;
    fn topology(&self) -> Result<Topology>;
    /// Returns once no balancing round is in progress.
    fn stop_balancer(&self) -> Result<()>;
    /// Does not wait for the balancer to resume.
    fn start_balancer(&self) -> Result<()>;
    fn find_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<Option<Value>>;
    fn insert_doc(&self, db: &str, collection: &str, doc: &Value) -> Result<()>;
    fn update_doc(&self, db: &str, collection: &str, filter: &Value, update: &Value) -> Result<u64>;
    fn delete_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<u64>;
    fn replset_config(&self) -> Result<Value>;
    fn update_replset_config(&self, cfg: &Value) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

#[derive(Deserialize)]
struct RawStatus {
    #[serde(default)]
    shards: Vec<RawShard>,
    #[serde(default)]
    members: Vec<RawMember>,
    #[serde(default)]
    databases: DatabaseMap,
}

#[derive(Deserialize)]
struct RawShard {
    #[serde(rename = "_id")]
    id: String,
    host: String,
}

#[derive(Deserialize)]
struct RawMember {
    #[serde(rename = "_id")]
    id: i64,
    name: String,
    #[serde(rename = "stateStr")]
    state_str: String,
}

impl From<RawMember> for Member {
    fn from(m: RawMember) -> Self {
        Member::new(m.id, m.name, Role::from_state_str(&m.state_str))
    }
}

pub struct MongoShell {
    runner: Arc<DynRunner>,
    cfg: Arc<Mongo>,
    uri: String,
}

impl MongoShell {
    pub fn new(runner: Arc<DynRunner>, cfg: Arc<Mongo>, uri: &str) -> Self {
        Self {
            runner,
            cfg,
            uri: uri.to_string(),
        }
    }

    fn at(&self, uri: String) -> Self {
        Self {
            runner: self.runner.clone(),
            cfg: self.cfg.clone(),
            uri,
        }
    }

    #[inline]
    fn shell(&self) -> CmdSpec {
        CmdSpec::new(&self.cfg.shell)
    }

    fn eval(&self, script: &str) -> Result<Value> {
        let cmd = self
            .shell()
            .args(["--quiet", "--json=relaxed", "--eval"])
            .arg(format!("{PRELUDE}{script}"))
            .secret(&self.uri);
        let out = self
            .runner
            .capture(&cmd)
            .with_context(|| format!("mongosh against {}", redact_uri(&self.uri)))?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(trimmed).context("parse mongosh json output")
    }

    fn status(&self) -> Result<RawStatus> {
        let v = self.eval(STATUS_JS)?;
        serde_json::from_value(v).context("decode cluster status")
    }

    fn routers(&self) -> Result<Vec<String>> {
        let v = self.eval(ROUTERS_JS)?;
        serde_json::from_value(v).context("decode config.mongos")
    }

    fn set_balancer_stopped(&self, stopped: bool) -> Result<()> {
        self.eval(&format!(
            "db.getSiblingDB('config').settings.updateOne({{ _id: 'balancer' }}, {{ $set: {{ stopped: {stopped} }} }}, {{ upsert: true }})"
        ))?;
        Ok(())
    }
}

impl TopologyPort for MongoShell {
    fn ping(&self) -> Result<()> {
        self.eval("must(db.adminCommand({ ping: 1 }))").map(|_| ())
    }

    fn topology(&self) -> Result<Topology> {
        let st = self.status()?;
        if st.members.is_empty() {
            bail!(
                "{} is not a replica set member; register the replica set or config server URI",
                redact_uri(&self.uri)
            );
        }
        if st.shards.is_empty() {
            return Ok(Topology::ReplicaSet {
                members: st.members.into_iter().map(Member::from).collect(),
                databases: st.databases,
            });
        }

        let mut shards = Vec::with_capacity(st.shards.len());
        for s in st.shards {
            let (set, hosts) = parse_seed_list(&s.host)?;
            let uri = format!("mongodb://{}/?replicaSet={set}", hosts.join(","));
            let shard_st = self
                .at(uri)
                .status()
                .with_context(|| format!("status of shard {}", s.id))?;
            shards.push(Shard {
                shard_name: s.id,
                shard_members: shard_st.members.into_iter().map(Member::from).collect(),
                databases: shard_st.databases,
            });
        }
        Ok(Topology::Sharded {
            config_servers: st.members.into_iter().map(Member::from).collect(),
            shards,
        })
    }

    fn stop_balancer(&self) -> Result<()> {
        self.set_balancer_stopped(true)?;
        let routers = self.routers()?;
        let router = routers
            .first()
            .ok_or_else(|| anyhow!("no router registered in config.mongos"))?;
        let via = self.at(format!("mongodb://{router}/"));
        let poll = Duration::from_millis(self.cfg.balancer_poll_ms);
        loop {
            let v = via.eval("must(db.adminCommand({ balancerStatus: 1 })).inBalancerRound")?;
            if !v.as_bool().unwrap_or(false) {
                break;
            }
            log::info!("[balancer] round in progress on {router}, waiting");
            thread::sleep(poll);
        }
        Ok(())
    }

    fn start_balancer(&self) -> Result<()> {
        self.set_balancer_stopped(false)
    }

    fn find_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<Option<Value>> {
        let v = self.eval(&format!(
            "{}.findOne({})",
            coll_js(db, collection),
            ejson(filter)
        ))?;
        Ok((!v.is_null()).then_some(v))
    }

    fn insert_doc(&self, db: &str, collection: &str, doc: &Value) -> Result<()> {
        self.eval(&format!(
            "{}.insertOne({})",
            coll_js(db, collection),
            ejson(doc)
        ))
        .map(|_| ())
    }

    fn update_doc(&self, db: &str, collection: &str, filter: &Value, update: &Value) -> Result<u64> {
        let v = self.eval(&format!(
            "{}.updateOne({}, {}).matchedCount",
            coll_js(db, collection),
            ejson(filter),
            ejson(update)
        ))?;
        Ok(v.as_u64().unwrap_or(0))
    }

    fn delete_doc(&self, db: &str, collection: &str, filter: &Value) -> Result<u64> {
        let v = self.eval(&format!(
            "{}.deleteOne({}).deletedCount",
            coll_js(db, collection),
            ejson(filter)
        ))?;
        Ok(v.as_u64().unwrap_or(0))
    }

    fn replset_config(&self) -> Result<Value> {
        let v = self.eval("must(db.adminCommand({ replSetGetConfig: 1 })).config")?;
        if !v.is_object() {
            bail!("replSetGetConfig returned no config");
        }
        Ok(v)
    }

    fn update_replset_config(&self, cfg: &Value) -> Result<()> {
        self.eval(&format!(
            "must(db.adminCommand({{ replSetReconfig: {}, force: true }}))",
            ejson(cfg)
        ))
        .map(|_| ())
    }
}

fn coll_js(db: &str, collection: &str) -> String {
    // names go through serde_json so quotes in them cannot break out of the literal
    format!(
        "db.getSiblingDB({}).getCollection({})",
        Value::from(db),
        Value::from(collection)
    )
}

/// Relaxed extended JSON back into BSON types on the shell side.
fn ejson(v: &Value) -> String {
    format!("EJSON.parse({})", Value::from(v.to_string()))
}

/// Hides `user:password@` in log lines.
pub(crate) fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(s), Some(at)) if at > s => format!("{}<redacted>{}", &uri[..s + 3], &uri[at..]),
        _ => uri.to_string(),
    }
}
