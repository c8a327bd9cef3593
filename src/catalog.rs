use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing as log;

use crate::{error::KairosError, records::Record, utils::lock::LockGuard};

const CATALOG_FILE: &str = "catalog.json";
const CATALOG_LOCK: &str = "catalog.lock";

type Collections = BTreeMap<String, Vec<Value>>;

/// JSON document store: one file, one array per collection, every mutation
/// under an exclusive flock and replaced atomically.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create catalog dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fails with `DuplicateKey` when a record with the same key exists; nothing is written then.
    pub fn add<R: Record>(&self, rec: &R) -> Result<()> {
        let key = rec.key();
        self.mutate(|all| {
            let docs = all.entry(R::COLLECTION.to_string()).or_default();
            for d in docs.iter() {
                let existing: R = decode(d)?;
                if existing.key() == key {
                    return Err(KairosError::DuplicateKey {
                        collection: R::COLLECTION,
                        key: key.clone(),
                    }
                    .into());
                }
            }
            docs.push(serde_json::to_value(rec).context("encode record")?);
            Ok(())
        })?;
        log::debug!("[catalog] {} += {key}", R::COLLECTION);
        Ok(())
    }

    pub fn find_one<R: Record>(&self, pred: impl Fn(&R) -> bool) -> Result<Option<R>> {
        Ok(self.find_all(pred)?.into_iter().next())
    }

    pub fn find_all<R: Record>(&self, pred: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let all = self.load()?;
        let mut out = Vec::new();
        for d in all.get(R::COLLECTION).into_iter().flatten() {
            let r: R = decode(d)?;
            if pred(&r) {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Applies `f` to every match; the key must not change.
    pub fn edit<R: Record>(&self, pred: impl Fn(&R) -> bool, mut f: impl FnMut(&mut R)) -> Result<usize> {
        self.mutate(|all| {
            let mut n = 0;
            for d in all.entry(R::COLLECTION.to_string()).or_default().iter_mut() {
                let mut r: R = decode(d)?;
                if pred(&r) {
                    let key = r.key();
                    f(&mut r);
                    if r.key() != key {
                        return Err(KairosError::Validation(format!(
                            "edit may not change key of {} record {key}",
                            R::COLLECTION
                        ))
                        .into());
                    }
                    *d = serde_json::to_value(&r).context("encode record")?;
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    pub fn remove_one<R: Record>(&self, pred: impl Fn(&R) -> bool) -> Result<bool> {
        self.mutate(|all| {
            let docs = all.entry(R::COLLECTION.to_string()).or_default();
            for (i, d) in docs.iter().enumerate() {
                let r: R = decode(d)?;
                if pred(&r) {
                    docs.remove(i);
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    pub fn remove_many<R: Record>(&self, pred: impl Fn(&R) -> bool) -> Result<usize> {
        self.mutate(|all| {
            let docs = all.entry(R::COLLECTION.to_string()).or_default();
            let mut keep = Vec::with_capacity(docs.len());
            let mut removed = 0;
            for d in docs.drain(..) {
                let r: R = decode(&d)?;
                if pred(&r) {
                    removed += 1;
                } else {
                    keep.push(d);
                }
            }
            *docs = keep;
            Ok(removed)
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    fn load(&self) -> Result<Collections> {
        let path = self.path();
        match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Collections::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse catalog {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Collections::new()),
            Err(e) => Err(e).with_context(|| format!("read catalog {}", path.display())),
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Collections) -> Result<T>) -> Result<T> {
        let _lock = LockGuard::exclusive(&self.dir.join(CATALOG_LOCK))?;
        let mut all = self.load()?;
        let out = f(&mut all)?;
        self.store(&all)?;
        Ok(out)
    }

    fn store(&self, all: &Collections) -> Result<()> {
        let path = self.path();
        let tmp = self.dir.join(format!(".{CATALOG_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(all).context("encode catalog")?;
        {
            let mut opts = fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut f = opts
                .open(&tmp)
                .with_context(|| format!("open {}", tmp.display()))?;
            f.write_all(&body)
                .and_then(|_| f.sync_all())
                .with_context(|| format!("write {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))
    }
}

fn decode<R: Record>(v: &Value) -> Result<R> {
    R::deserialize(v).with_context(|| format!("decode {} record", R::COLLECTION))
}
