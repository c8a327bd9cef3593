use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::{
    config::Ssh,
    error::KairosError,
    utils::process::{CmdSpec, Runner},
};

const INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
const ISCSI_PORT: u16 = 3260;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountInfo {
    pub source: String,
    pub fstype: String,
    pub target: String,
}

/// One LUN as reported by the host's SAN utilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanLun {
    pub svm_name: String,
    pub volume: String,
    pub lun_name: String,
    pub lun_id: String,
    /// Multipath wwid, `dm-N` and `sdX` names the LUN surfaces as.
    pub devices: Vec<String>,
}

impl SanLun {
    pub fn backs(&self, device: &str) -> bool {
        let base = device.rsplit('/').next().unwrap_or(device);
        self.devices.iter().any(|d| d == base)
    }
}

pub trait HostPort: Send + Sync {
    fn address(&self) -> &str;
    fn run_command(&self, cmd: CmdSpec) -> Result<String>;
    fn read_file(&self, path: &str) -> Result<String>;
    fn hostname(&self) -> Result<String>;
    fn find_mount(&self, path: &str) -> Result<MountInfo>;
    fn logical_volume_group(&self, device: &str) -> Result<Option<String>>;
    fn volume_group_devices(&self, vg: &str) -> Result<Vec<String>>;
    fn san_luns(&self) -> Result<Vec<SanLun>>;
    fn stop_service(&self, name: &str) -> Result<()>;
    fn start_service(&self, name: &str) -> Result<()>;
    fn deactivate_vg(&self, vg: &str) -> Result<()>;
    fn activate_vg(&self, vg: &str) -> Result<()>;
    fn unmount(&self, mountpoint: &str) -> Result<()>;
    fn mount(&self, device: &str, mountpoint: &str, fs_type: &str) -> Result<()>;
    fn iscsi_initiator_name(&self) -> Result<String>;
    fn iscsi_discover(&self, target: &str) -> Result<()>;
    fn iscsi_login_all(&self) -> Result<()>;
    fn rescan(&self) -> Result<()>;
    fn remove_file(&self, path: &str) -> Result<()>;
    /// `Ok(false)` when no such process was running.
    fn kill_process(&self, name: &str) -> Result<bool>;
    fn run_as(&self, user: &str, cmd: CmdSpec) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct SshHost {
    runner: Arc<DynRunner>,
    ssh: Arc<Ssh>,
    address: String,
    user: String,
}

impl SshHost {
    pub fn new(runner: Arc<DynRunner>, ssh: Arc<Ssh>, address: &str, user: &str) -> Self {
        Self {
            runner,
            ssh,
            address: address.to_string(),
            user: user.to_string(),
        }
    }

    fn wrap(&self, remote: &CmdSpec) -> CmdSpec {
        let mut cmd = CmdSpec::new(&self.ssh.binary).args([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout_secs),
            "-p".to_string(),
            self.ssh.port.to_string(),
        ]);
        if let Some(key) = &self.ssh.identity_file {
            cmd = cmd.arg("-i").arg(key.display().to_string());
        }
        cmd = cmd.args(["-l", &self.user, &self.address, "--"]);
        if remote.has_secrets() {
            cmd.secret(remote.to_shell())
        } else {
            cmd.arg(remote.to_shell())
        }
    }

    fn exec(&self, remote: CmdSpec) -> Result<String> {
        self.runner
            .capture(&self.wrap(&remote))
            .map_err(|e| KairosError::remote(&self.address, format!("{}: {e:#}", remote.render())).into())
    }

    fn exec_probe(&self, remote: CmdSpec) -> Result<bool> {
        self.runner
            .probe(&self.wrap(&remote))
            .with_context(|| format!("{}: {}", self.address, remote.render()))
    }

    fn exec_unit(&self, remote: CmdSpec) -> Result<()> {
        self.exec(remote).map(|_| ())
    }
}

impl HostPort for SshHost {
    fn address(&self) -> &str {
        &self.address
    }

    fn run_command(&self, cmd: CmdSpec) -> Result<String> {
        self.exec(cmd)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        self.exec(CmdSpec::new("cat").arg(path))
    }

    fn hostname(&self) -> Result<String> {
        let out = self.exec(CmdSpec::new("hostname"))?;
        let name = out.trim();
        if name.is_empty() {
            bail!("{}: empty hostname", self.address);
        }
        Ok(name.to_string())
    }

    fn find_mount(&self, path: &str) -> Result<MountInfo> {
        let out = self.exec(CmdSpec::new("findmnt").args([
            "-J",
            "-T",
            path,
            "-o",
            "SOURCE,FSTYPE,TARGET",
        ]))?;
        parse_findmnt(&out).with_context(|| format!("{}: findmnt {path}", self.address))
    }

    fn logical_volume_group(&self, device: &str) -> Result<Option<String>> {
        if !self.exec_probe(CmdSpec::new("lvs").arg(device))? {
            return Ok(None);
        }
        let out = self.exec(CmdSpec::new("lvs").args([
            "--reportformat",
            "json",
            "-o",
            "vg_name",
            device,
        ]))?;
        let json: LvsJson = serde_json::from_str(&out).context("parse lvs json")?;
        Ok(json
            .report
            .into_iter()
            .flat_map(|r| r.lv)
            .map(|lv| lv.vg_name)
            .next())
    }

    fn volume_group_devices(&self, vg: &str) -> Result<Vec<String>> {
        let out = self.exec(CmdSpec::new("pvs").args([
            "--reportformat",
            "json",
            "-o",
            "pv_name,vg_name",
        ]))?;
        let json: PvsJson = serde_json::from_str(&out).context("parse pvs json")?;
        Ok(json
            .report
            .into_iter()
            .flat_map(|r| r.pv)
            .filter(|pv| pv.vg_name == vg)
            .map(|pv| pv.pv_name)
            .collect())
    }

    fn san_luns(&self) -> Result<Vec<SanLun>> {
        let out = self.exec(CmdSpec::new("sanlun").args(["lun", "show", "-p"]))?;
        Ok(parse_sanlun(&out))
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("systemctl").args(["stop", name]))
    }

    fn start_service(&self, name: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("systemctl").args(["start", name]))
    }

    fn deactivate_vg(&self, vg: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("vgchange").args(["-an", vg]))
    }

    fn activate_vg(&self, vg: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("vgchange").args(["-ay", vg]))
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("umount").args(["-f", mountpoint]))
    }

    fn mount(&self, device: &str, mountpoint: &str, fs_type: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("mount").args([
            "-t", fs_type, "-o", "noatime", device, mountpoint,
        ]))
    }

    fn iscsi_initiator_name(&self) -> Result<String> {
        let out = self.read_file(INITIATOR_FILE)?;
        parse_initiator_name(&out)
            .ok_or_else(|| anyhow!("{}: no InitiatorName in {INITIATOR_FILE}", self.address))
    }

    fn iscsi_discover(&self, target: &str) -> Result<()> {
        let portal = format!("{target}:{ISCSI_PORT}");
        self.exec_unit(CmdSpec::new("iscsiadm").args([
            "-m", "discovery", "-t", "st", "-p", &portal,
        ]))
    }

    fn iscsi_login_all(&self) -> Result<()> {
        self.exec_unit(CmdSpec::new("iscsiadm").args(["-m", "node", "-L", "all"]))
    }

    fn rescan(&self) -> Result<()> {
        self.exec_unit(CmdSpec::new("iscsiadm").args(["-m", "session", "--rescan"]))
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.exec_unit(CmdSpec::new("rm").args(["-f", path]))
    }

    fn kill_process(&self, name: &str) -> Result<bool> {
        self.exec_probe(CmdSpec::new("pkill").args(["-x", name]))
    }

    fn run_as(&self, user: &str, cmd: CmdSpec) -> Result<()> {
        self.exec_unit(cmd.under("runuser", ["-u", user, "--"]))
    }
}

#[derive(Deserialize)]
struct LvsJson {
    report: Vec<LvReport>,
}

#[derive(Deserialize)]
struct LvReport {
    #[serde(default)]
    lv: Vec<LvInfo>,
}

#[derive(Deserialize)]
struct LvInfo {
    vg_name: String,
}

#[derive(Deserialize)]
struct PvsJson {
    report: Vec<PvReport>,
}

#[derive(Deserialize)]
struct PvReport {
    #[serde(default)]
    pv: Vec<PvInfo>,
}

#[derive(Deserialize)]
struct PvInfo {
    pv_name: String,
    vg_name: String,
}

#[derive(Deserialize)]
struct FindmntJson {
    filesystems: Vec<MountInfo>,
}

fn parse_findmnt(out: &str) -> Result<MountInfo> {
    let json: FindmntJson = serde_json::from_str(out).context("parse findmnt json")?;
    json.filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no filesystem reported"))
}

#[derive(Deserialize)]
struct MongodConf {
    #[serde(default)]
    storage: Option<MongodStorage>,
}

#[derive(Deserialize)]
struct MongodStorage {
    #[serde(rename = "dbPath")]
    db_path: Option<String>,
}

/// `storage.dbPath` from a mongod YAML config; `None` when it is not set.
pub fn parse_db_path(conf: &str) -> Result<Option<String>> {
    if conf.trim().is_empty() {
        return Ok(None);
    }
    let parsed: MongodConf = serde_yaml::from_str(conf).context("parse mongod config")?;
    Ok(parsed
        .storage
        .and_then(|s| s.db_path)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty()))
}

fn parse_initiator_name(s: &str) -> Option<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|l| l.strip_prefix("InitiatorName="))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses `sanlun lun show -p` blocks:
/// `ONTAP Path: svm:/vol/<volume>/<lun>`, `LUN: <id>`, `Host Device: <wwid>(dm-N)`
/// followed by a path table whose third column is the `sdX` node.
pub fn parse_sanlun(out: &str) -> Vec<SanLun> {
    let mut luns: Vec<SanLun> = Vec::new();
    for raw in out.lines() {
        let line = raw.trim();
        if let Some(path) = field(line, "ONTAP Path") {
            let Some((svm, lun_path)) = path.split_once(':') else {
                continue;
            };
            let mut parts = lun_path.trim_start_matches("/vol/").splitn(2, '/');
            let (Some(volume), Some(lun)) = (parts.next(), parts.next()) else {
                continue;
            };
            luns.push(SanLun {
                svm_name: svm.trim().to_string(),
                volume: volume.to_string(),
                lun_name: lun.to_string(),
                lun_id: String::new(),
                devices: Vec::new(),
            });
            continue;
        }
        let Some(cur) = luns.last_mut() else { continue };
        if let Some(id) = field(line, "LUN") {
            cur.lun_id = id.to_string();
        } else if let Some(dev) = field(line, "Host Device") {
            match dev.split_once('(') {
                Some((wwid, dm)) => {
                    cur.devices.push(wwid.trim().to_string());
                    cur.devices.push(dm.trim_end_matches(')').trim().to_string());
                }
                None => cur.devices.push(dev.to_string()),
            }
        } else {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() >= 3
                && matches!(cols[0], "up" | "down")
                && !cur.devices.iter().any(|d| d == cols[2])
            {
                cur.devices.push(cols[2].to_string());
            }
        }
    }
    luns
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    (k.trim() == name).then(|| v.trim())
}
