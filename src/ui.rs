use anyhow::Result;
use prettytable::{Cell, Row, Table};

use crate::{
    records::{BackupRecord, CloneRecord, ClusterRecord, StorageSystemRecord},
    tooling::mongo::redact_uri,
    utils::time::fmt_utc,
};

fn when(ts: time::OffsetDateTime) -> String {
    fmt_utc(ts).unwrap_or_else(|_| ts.to_string())
}

fn print(titles: &[&str], rows: Vec<Vec<String>>, empty: &str) {
    if rows.is_empty() {
        tracing::info!("{empty}");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(titles.iter().map(|t| Cell::new(t)).collect()));
    for r in rows {
        table.add_row(Row::new(r.iter().map(|c| Cell::new(c)).collect()));
    }
    table.printstd();
}

pub fn log_clusters(clusters: &[ClusterRecord]) -> Result<()> {
    let rows = clusters
        .iter()
        .map(|c| {
            vec![
                c.cluster_name.clone(),
                redact_uri(&c.mongodb_uri),
                format!("{:?}", c.auth_mode).to_lowercase(),
                c.mongod_config_path.clone(),
                c.ssh_username.clone(),
            ]
        })
        .collect();
    print(
        &["Cluster", "URI", "Auth", "mongod config", "SSH user"],
        rows,
        "<no clusters>",
    );
    Ok(())
}

pub fn log_storage(systems: &[StorageSystemRecord]) -> Result<()> {
    let rows = systems
        .iter()
        .map(|s| {
            vec![
                s.netapp_ip.clone(),
                s.svm_name.clone(),
                s.username.clone(),
                "<redacted>".to_string(),
            ]
        })
        .collect();
    print(&["Address", "SVM", "User", "Password"], rows, "<no storage systems>");
    Ok(())
}

pub fn log_backups(backups: &[BackupRecord]) {
    let rows = backups
        .iter()
        .map(|b| {
            vec![
                b.cluster_name.clone(),
                b.backup_name.clone(),
                when(b.created_at),
                when(b.retention),
                b.topology.kind().to_string(),
            ]
        })
        .collect();
    print(
        &["Cluster", "Backup", "Created (UTC)", "Expires (UTC)", "Type"],
        rows,
        "<no backups>",
    );
}

pub fn log_clones(clones: &[CloneRecord]) {
    let rows = clones
        .iter()
        .map(|c| {
            vec![
                c.cluster_name.clone(),
                c.clone_name.clone(),
                when(c.created_at),
                c.backup_name.clone(),
                c.topology.members().len().to_string(),
                c.description.clone(),
            ]
        })
        .collect();
    print(
        &["Cluster", "Clone", "Created (UTC)", "From backup", "Members", "Description"],
        rows,
        "<no clones>",
    );
}
