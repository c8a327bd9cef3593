use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing as log;

use crate::{
    AppCtx,
    catalog::Catalog,
    config::{Config, config_helpers::Normalizer},
    error::KairosError,
    records::StorageSystemRecord,
    tooling::Tooling,
    ui,
};

#[derive(Debug, Args)]
pub struct StorageArgs {
    #[command(subcommand)]
    pub cmd: StorageCmd,
}

impl StorageArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        self.cmd.run(ctx)
    }
}

#[derive(Debug, Subcommand)]
pub enum StorageCmd {
    Add(AddArgs),
    Remove(RemoveArgs),
    List,
}

impl StorageCmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            StorageCmd::Add(args) => args.run(ctx),
            StorageCmd::Remove(args) => args.run(ctx),
            StorageCmd::List => ui::log_storage(&ctx.catalog.find_all::<StorageSystemRecord>(|_| true)?),
        }
    }
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Cluster management address
    #[arg(long)]
    pub ip: String,

    #[arg(long)]
    pub svm: String,

    #[arg(long)]
    pub username: String,

    #[arg(long)]
    pub password_file: PathBuf,
}

impl AddArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let password = Normalizer {
            base_dir: Path::new("."),
        }
        .read_secret(&self.password_file)
        .with_context(|| format!("read {}", self.password_file.display()))?;
        let rec = StorageSystemRecord {
            netapp_ip: self.ip.clone(),
            svm_name: self.svm.clone(),
            username: self.username.clone(),
            password,
        };
        add(&ctx.catalog, ctx.tools.as_ref(), &rec)
    }
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(long)]
    pub ip: String,

    #[arg(long)]
    pub svm: String,
}

impl RemoveArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let removed = ctx
            .catalog
            .remove_one::<StorageSystemRecord>(|s| s.netapp_ip == self.ip && s.svm_name == self.svm)?;
        if !removed {
            return Err(KairosError::not_found("storage system", format!("{}/{}", self.ip, self.svm)).into());
        }
        log::info!("[storage] removed {}/{}", self.ip, self.svm);
        Ok(())
    }
}

pub fn add(catalog: &Catalog, tools: &dyn Tooling, rec: &StorageSystemRecord) -> Result<()> {
    if !Config::valid_name(&rec.svm_name) {
        return Err(KairosError::Validation(format!("invalid svm name '{}'", rec.svm_name)).into());
    }
    if rec.password.is_empty() {
        return Err(KairosError::Validation("empty password".into()).into());
    }
    let version = tools
        .storage(rec)?
        .ping()
        .with_context(|| format!("reach {} ({})", rec.netapp_ip, rec.svm_name))?;
    catalog.add(rec)?;
    log::info!("[storage] registered {}/{}: {version}", rec.netapp_ip, rec.svm_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fakes::{FakeTools, World, catalog_with};

    fn sys(svm: &str, pw: &str) -> StorageSystemRecord {
        StorageSystemRecord {
            netapp_ip: "10.1.1.1".into(),
            svm_name: svm.into(),
            username: "admin".into(),
            password: pw.into(),
        }
    }

    #[test]
    fn add_pings_array_first() {
        let w = Arc::new(World::default());
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &[]);
        add(&cat, &tools, &sys("svm7", "secret")).unwrap();
        assert_eq!(w.journal(), vec!["svm7: ping".to_string()]);

        let dup = add(&cat, &tools, &sys("svm7", "secret")).unwrap_err();
        assert!(matches!(
            dup.downcast_ref::<KairosError>(),
            Some(KairosError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn empty_password_rejected() {
        let w = Arc::new(World::default());
        let tools = FakeTools(w.clone());
        let (_tmp, cat) = catalog_with("rs0", &[]);
        assert!(add(&cat, &tools, &sys("svm7", "")).is_err());
        assert!(w.journal().is_empty());
    }
}
