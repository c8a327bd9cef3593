use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing as log;

use crate::{
    AppCtx,
    catalog::Catalog,
    config::Config,
    error::KairosError,
    records::{AuthMode, BackupRecord, CloneRecord, ClusterRecord},
    tooling::Tooling,
    ui,
};

#[derive(Debug, Args)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub cmd: ClusterCmd,
}

impl ClusterArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        self.cmd.run(ctx)
    }
}

#[derive(Debug, Subcommand)]
pub enum ClusterCmd {
    Add(AddArgs),
    Remove(RemoveArgs),
    List,
}

impl ClusterCmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            ClusterCmd::Add(args) => args.run(ctx),
            ClusterCmd::Remove(args) => args.run(ctx),
            ClusterCmd::List => ui::log_clusters(&ctx.catalog.find_all::<ClusterRecord>(|_| true)?),
        }
    }
}

#[derive(Args, Debug)]
pub struct AddArgs {
    #[arg(long)]
    pub name: String,

    /// Replica set, or config server replica set for sharded clusters
    #[arg(long)]
    pub uri: String,

    #[arg(long, value_enum, default_value_t = AuthMode::None)]
    pub auth_mode: AuthMode,

    #[arg(long, default_value = "/etc/mongod.conf")]
    pub mongod_config: String,

    /// Defaults to `[ssh] user`
    #[arg(long)]
    pub ssh_user: Option<String>,
}

impl AddArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let rec = ClusterRecord {
            cluster_name: self.name.clone(),
            mongodb_uri: self.uri.clone(),
            auth_mode: self.auth_mode,
            mongod_config_path: self.mongod_config.clone(),
            ssh_username: self
                .ssh_user
                .clone()
                .unwrap_or_else(|| ctx.cfg.ssh.user.clone()),
        };
        add(&ctx.catalog, ctx.tools.as_ref(), &rec)
    }
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(long)]
    pub name: String,

    /// Drop the registration even if backups or clones still reference it
    #[arg(long)]
    pub force: bool,
}

impl RemoveArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        remove(&ctx.catalog, &self.name, self.force)
    }
}

pub fn add(catalog: &Catalog, tools: &dyn Tooling, rec: &ClusterRecord) -> Result<()> {
    if !Config::valid_name(&rec.cluster_name) {
        return Err(KairosError::Validation(format!("invalid cluster name '{}'", rec.cluster_name)).into());
    }
    if rec.auth_mode == AuthMode::Password && !rec.mongodb_uri.contains('@') {
        return Err(KairosError::Validation("auth mode 'password' needs credentials in the URI".into()).into());
    }
    if catalog
        .find_one::<ClusterRecord>(|c| c.cluster_name == rec.cluster_name)?
        .is_some()
    {
        return Err(KairosError::DuplicateKey {
            collection: "clusters",
            key: rec.cluster_name.clone(),
        }
        .into());
    }
    tools
        .topology(&rec.mongodb_uri)
        .ping()
        .with_context(|| format!("reach cluster {}", rec.cluster_name))?;
    catalog.add(rec)?;
    log::info!("[cluster] registered {}", rec.cluster_name);
    Ok(())
}

pub fn remove(catalog: &Catalog, name: &str, force: bool) -> Result<()> {
    let backups = catalog.find_all::<BackupRecord>(|b| b.cluster_name == name)?.len();
    let clones = catalog.find_all::<CloneRecord>(|c| c.cluster_name == name)?.len();
    if (backups > 0 || clones > 0) && !force {
        return Err(KairosError::Validation(format!(
            "cluster {name} still has {backups} backups and {clones} clones; use --force"
        ))
        .into());
    }
    if !catalog.remove_one::<ClusterRecord>(|c| c.cluster_name == name)? {
        return Err(KairosError::not_found("cluster", name).into());
    }
    log::info!("[cluster] removed {name}");
    Ok(())
}
