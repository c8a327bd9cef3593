use std::{
    collections::BTreeSet,
    env,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{config::Config, error::KairosError};

/// Local programs every run shells out to: the ssh client and the mongo shell.
/// Host-side tools (lvm, iscsiadm, sanlun) are resolved remotely.
pub fn required_bins(cfg: &Config) -> BTreeSet<&str> {
    [cfg.ssh.binary.as_str(), cfg.mongo.shell.as_str()]
        .into_iter()
        .collect()
}

pub fn ensure_bins<I, S>(bins: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let missing = missing(bins);
    if missing.is_empty() {
        return Ok(());
    }
    Err(KairosError::Validation(format!("not found in PATH: {}", missing.join(", "))).into())
}

fn missing<I, S>(bins: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    bins.into_iter()
        .filter(|b| which(b.as_ref()).is_none())
        .map(|b| b.as_ref().to_string())
        .collect()
}

pub fn which(bin: &str) -> Option<PathBuf> {
    let p = Path::new(bin);
    if p.components().count() > 1 {
        return is_executable(p).then(|| p.to_path_buf());
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(bin))
        .find(|cand| is_executable(cand))
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(p) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::*;

    #[test]
    fn explicit_paths_need_exec_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = tmp.path().join("mongosh");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        let path = tool.to_str().unwrap();

        fs::set_permissions(&tool, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(which(path).is_none());
        assert_eq!(missing([path]), vec![path.to_string()]);

        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(which(path), Some(tool.clone()));
        ensure_bins([path]).unwrap();
    }

    #[test]
    fn defaults_name_ssh_and_shell() {
        let cfg = Config::default();
        let bins = required_bins(&cfg);
        assert!(bins.contains(cfg.ssh.binary.as_str()));
        assert!(bins.contains(cfg.mongo.shell.as_str()));
    }
}
