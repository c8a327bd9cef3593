use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub catalog: Catalog,
    pub ssh: Ssh,
    pub storage: Storage,
    pub mongo: Mongo,
    pub services: Services,
    pub clone: CloneDefaults,
    pub reaper: Reaper,
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ssh {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub binary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Storage {
    pub https: bool,
    pub port: u16,
    pub verify_tls: bool,
    pub timeout_secs: u64,
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mongo {
    pub shell: String,
    pub balancer_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Services {
    pub database: String,
    pub multipath: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneDefaults {
    pub mongod_bin: String,
    pub mongos_bin: String,
    pub run_user: String,
    pub pid_file: String,
    pub mongos_log_path: String,
    pub settle_secs: u64,
    pub teardown_settle_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reaper {
    pub interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: Catalog {
                path: PathBuf::from("/var/lib/kairos"),
            },
            ssh: Ssh {
                user: "root".into(),
                port: 22,
                identity_file: None,
                connect_timeout_secs: 10,
                binary: "ssh".into(),
            },
            storage: Storage {
                https: true,
                port: 443,
                verify_tls: false,
                timeout_secs: 120,
                api_version: "1.21".into(),
            },
            mongo: Mongo {
                shell: "mongosh".into(),
                balancer_poll_ms: 1000,
            },
            services: Services {
                database: "mongod".into(),
                multipath: "multipathd".into(),
            },
            clone: CloneDefaults {
                mongod_bin: "/usr/bin/mongod".into(),
                mongos_bin: "/usr/bin/mongos".into(),
                run_user: "mongod".into(),
                pid_file: "/var/run/mongodb/mongod.pid".into(),
                mongos_log_path: "/var/log/mongodb/mongos.log".into(),
                settle_secs: 5,
                teardown_settle_secs: 3,
            },
            reaper: Reaper { interval_secs: 60 },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let n = config_helpers::Normalizer { base_dir };
        let mut out = Self::default();

        if let Some(c) = raw.catalog
            && let Some(p) = n.trim_opt(c.path)
        {
            out.catalog.path = n.resolve(&p);
        }

        if let Some(s) = raw.ssh {
            if let Some(u) = n.trim_opt(s.user) {
                if !Self::valid_name(&u) {
                    bail!("bad ssh.user '{u}': use [A-Za-z0-9_-], length 1..32");
                }
                out.ssh.user = u;
            }
            out.ssh.port = s.port.unwrap_or(out.ssh.port);
            out.ssh.identity_file = n.trim_opt(s.identity_file).map(|p| n.resolve(&p));
            out.ssh.connect_timeout_secs = s
                .connect_timeout_secs
                .unwrap_or(out.ssh.connect_timeout_secs);
            if let Some(b) = n.trim_opt(s.binary) {
                out.ssh.binary = b;
            }
        }

        if let Some(s) = raw.storage {
            out.storage.https = s.https.unwrap_or(out.storage.https);
            out.storage.port = s
                .port
                .unwrap_or(if out.storage.https { 443 } else { 80 });
            out.storage.verify_tls = s.verify_tls.unwrap_or(out.storage.verify_tls);
            out.storage.timeout_secs = s.timeout_secs.unwrap_or(out.storage.timeout_secs);
            if let Some(v) = n.trim_opt(s.api_version) {
                out.storage.api_version = v;
            }
        }

        if let Some(m) = raw.mongo {
            if let Some(sh) = n.trim_opt(m.shell) {
                out.mongo.shell = sh;
            }
            out.mongo.balancer_poll_ms = m.balancer_poll_ms.unwrap_or(out.mongo.balancer_poll_ms);
            if out.mongo.balancer_poll_ms == 0 {
                bail!("mongo.balancer_poll_ms must be > 0");
            }
        }

        if let Some(s) = raw.services {
            if let Some(d) = n.trim_opt(s.database) {
                out.services.database = d;
            }
            if let Some(m) = n.trim_opt(s.multipath) {
                out.services.multipath = m;
            }
        }

        if let Some(c) = raw.clone {
            let d = &mut out.clone;
            for (slot, v) in [
                (&mut d.mongod_bin, c.mongod_bin),
                (&mut d.mongos_bin, c.mongos_bin),
                (&mut d.run_user, c.run_user),
                (&mut d.pid_file, c.pid_file),
                (&mut d.mongos_log_path, c.mongos_log_path),
            ] {
                if let Some(v) = n.trim_opt(v) {
                    *slot = v;
                }
            }
            d.settle_secs = c.settle_secs.unwrap_or(d.settle_secs);
            d.teardown_settle_secs = c.teardown_settle_secs.unwrap_or(d.teardown_settle_secs);
        }

        if let Some(r) = raw.reaper {
            out.reaper.interval_secs = r.interval_secs.unwrap_or(out.reaper.interval_secs);
            if out.reaper.interval_secs == 0 {
                bail!("reaper.interval_secs must be > 0");
            }
        }

        Ok(out)
    }

    #[inline]
    pub fn valid_name(name: &str) -> bool {
        let len_ok = (1..=32).contains(&name.len());
        len_ok
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    }

    pub fn to_redacted_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    catalog: Option<RawCatalog>,
    ssh: Option<RawSsh>,
    storage: Option<RawStorage>,
    mongo: Option<RawMongo>,
    services: Option<RawServices>,
    clone: Option<RawClone>,
    reaper: Option<RawReaper>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSsh {
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<String>,
    connect_timeout_secs: Option<u64>,
    binary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    https: Option<bool>,
    port: Option<u16>,
    verify_tls: Option<bool>,
    timeout_secs: Option<u64>,
    api_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMongo {
    shell: Option<String>,
    balancer_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServices {
    database: Option<String>,
    multipath: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClone {
    mongod_bin: Option<String>,
    mongos_bin: Option<String>,
    run_user: Option<String>,
    pid_file: Option<String>,
    mongos_log_path: Option<String>,
    settle_secs: Option<u64>,
    teardown_settle_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReaper {
    interval_secs: Option<u64>,
}

pub(crate) mod config_helpers {
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    use anyhow::Result;

    pub(crate) struct Normalizer<'a> {
        pub base_dir: &'a Path,
    }

    impl<'a> Normalizer<'a> {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        #[inline]
        pub fn resolve(&self, p: &str) -> PathBuf {
            let pb = PathBuf::from(p.trim());
            if pb.is_absolute() {
                pb
            } else {
                self.base_dir.join(pb)
            }
        }

        pub fn read_secret(&self, p: &Path) -> Result<String> {
            let mut s = String::from_utf8(fs::read(p)?)?;
            while s.ends_with('\n') || s.ends_with('\r') {
                s.pop();
            }
            Ok(s)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(path: &Path, s: &str) {
        fs::write(path, s).unwrap();
    }

    #[test]
    fn empty_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(&cfg_path, "");
        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.ssh.user, "root");
        assert_eq!(cfg.reaper.interval_secs, 60);
        assert_eq!(cfg.mongo.balancer_poll_ms, 1000);
        assert_eq!(cfg.storage.port, 443);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let cfg_path = dir.join("config.toml");
        write(
            &cfg_path,
            r#"
[catalog]
path = "state"

[ssh]
user = "mongo-admin"
identity_file = "keys/id_ed25519"

[storage]
https = false

[clone]
settle_secs = 1
"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.catalog.path, dir.join("state"));
        assert_eq!(cfg.ssh.identity_file, Some(dir.join("keys/id_ed25519")));
        assert_eq!(cfg.ssh.user, "mongo-admin");
        assert_eq!(cfg.storage.port, 80);
        assert_eq!(cfg.clone.settle_secs, 1);
        assert_eq!(cfg.clone.mongod_bin, "/usr/bin/mongod");
    }

    #[test]
    fn unknown_keys_rejected() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(&cfg_path, "[ssh]\nusr = \"x\"\n");
        assert!(Config::load(&cfg_path).is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(&cfg_path, "[reaper]\ninterval_secs = 0\n");
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("interval_secs"), "{err}");
    }

    #[test]
    fn print_config_is_toml() {
        let printed = Config::default().to_redacted_toml().unwrap();
        assert!(printed.contains("[ssh]"));
        assert!(printed.contains(r#"shell = "mongosh""#));
    }

    #[test]
    fn read_secret_strips_newlines() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("pw");
        write(&p, "s3cret\r\n");
        let n = config_helpers::Normalizer {
            base_dir: tmp.path(),
        };
        assert_eq!(n.read_secret(&p).unwrap(), "s3cret");
    }
}
