use crate::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_postgres::Client;
use tracing::info;

/// Scripts executed on `--setup`, in order. The first creates the queue
/// schema and table, the second installs the capture trigger functions.
pub const PROVISION_SCRIPTS: [&str; 2] = ["migrations.sql", "triggers.sql"];

/// Paths of the provisioning scripts under `sql_dir`, in execution order.
pub fn script_paths(sql_dir: &Path) -> Vec<PathBuf> {
    PROVISION_SCRIPTS.iter().map(|name| sql_dir.join(name)).collect()
}

/// Reads every provisioning script. Fails on the first missing file, before
/// anything has been executed.
pub async fn read_scripts(sql_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut scripts = Vec::with_capacity(PROVISION_SCRIPTS.len());
    for path in script_paths(sql_dir) {
        let sql = fs::read_to_string(&path).await?;
        scripts.push((path, sql));
    }
    Ok(scripts)
}

pub async fn run(client: &Client, sql_dir: &Path) -> Result<()> {
    for (path, sql) in read_scripts(sql_dir).await? {
        info!(script = %path.display(), "Running provisioning script");
        client.batch_execute(&sql).await?;
    }

    info!("Event queue schema and triggers provisioned");
    Ok(())
}
