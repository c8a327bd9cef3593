use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing as log;

use crate::{error::KairosError, utils::time::current_epoch};

/// Exclusive flock held for the lifetime of the guard. The kernel drops it if the process dies.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockGuard {
    /// Single-flight lease for one cluster under `<dir>/locks`. A held lease
    /// yields `OperationInProgress` at once.
    pub fn for_cluster(dir: &Path, cluster: &str) -> Result<Self> {
        let path = dir.join("locks").join(lease_file(cluster));
        let file = open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if contended(&e) => {
                log::warn!("[lock] {cluster} busy: {}", holder(&path));
                return Err(KairosError::OperationInProgress(cluster.to_string()).into());
            }
            Err(e) => return Err(e).with_context(|| format!("flock {}", path.display())),
        }
        let mut guard = Self { file, path };
        guard.stamp()?;
        log::debug!("[lock] acquired {}", guard.path.display());
        Ok(guard)
    }

    /// Waits for the lock; used around catalog rewrites.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open(path)?;
        file.lock_exclusive()
            .with_context(|| format!("flock {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn stamp(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.rewind()?;
        writeln!(self.file, "pid={} since={}", std::process::id(), current_epoch())
            .with_context(|| format!("write {}", self.path.display()))
    }
}

fn contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn holder(path: &Path) -> String {
    let mut s = String::new();
    match File::open(path).and_then(|mut f| f.read_to_string(&mut s)) {
        Ok(_) if !s.trim().is_empty() => format!("held by {}", s.trim()),
        _ => "held by another process".into(),
    }
}

fn open(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create lock dir {}", dir.display()))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lockfile {}", path.display()))
}

/// `lock_cluster-<name>.lock`, keeping only filename-safe characters.
fn lease_file(cluster: &str) -> String {
    let safe: String = cluster
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    format!("lock_cluster-{}.lock", safe.trim_start_matches('.'))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let g1 = LockGuard::for_cluster(tmp.path(), "rs0").unwrap();
        let stamp = fs::read_to_string(tmp.path().join("locks/lock_cluster-rs0.lock")).unwrap();
        assert!(stamp.starts_with(&format!("pid={}", std::process::id())));
        drop(g1);

        let _g2 = LockGuard::for_cluster(tmp.path(), "rs0").unwrap();
    }

    #[test]
    fn second_operation_on_cluster_refused() {
        let tmp = TempDir::new().unwrap();
        let _g1 = LockGuard::for_cluster(tmp.path(), "rs0").unwrap();
        let err = LockGuard::for_cluster(tmp.path(), "rs0").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KairosError>(),
            Some(KairosError::OperationInProgress(c)) if c == "rs0"
        ));
        let _other = LockGuard::for_cluster(tmp.path(), "rs1").unwrap();
    }

    #[test]
    fn lease_names_stay_inside_lock_dir() {
        assert_eq!(lease_file("prod-rs.0"), "lock_cluster-prod-rs.0.lock");
        assert_eq!(lease_file("../etc/x"), "lock_cluster-etcx.lock");
    }
}
