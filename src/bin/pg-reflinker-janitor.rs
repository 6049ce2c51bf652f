//! Snapshot directory janitor for pg-reflinker.
//!
//! This binary removes snapshot directories under this node's destination
//! root that no published volume references, then verifies they are gone.

use std::io::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use clap::Parser;
use pg_reflinker::backup::SnapshotStore;
use pg_reflinker::cluster::KubeCluster;
use pg_reflinker::config::ReflinkerConfig;
use pg_reflinker::janitor::{DEFAULT_MIN_AGE_SECS, Janitor, JanitorConfig};
use pg_reflinker::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "pg-reflinker-janitor",
    about = "Remove snapshot directories no published volume references"
)]
struct Cli {
    /// Leave directories modified within this many seconds untouched.
    #[arg(long, default_value_t = DEFAULT_MIN_AGE_SECS)]
    min_age_secs: u64,
    /// Also remove committed snapshots that no volume references.
    #[arg(long)]
    delete_unreferenced: bool,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let config = ReflinkerConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    telemetry::init(config.log_format().map_err(|err| err.to_string())?)
        .map_err(|err| err.to_string())?;
    let store = SnapshotStore::open(
        &config.destination_root(),
        &config.host_view(&config.destination_root),
    )
    .map_err(|err| err.to_string())?;
    let cluster = KubeCluster::try_default()
        .await
        .map_err(|err| err.to_string())?;

    let janitor = Janitor::new(
        Arc::new(cluster),
        store,
        JanitorConfig::new(cli.min_age_secs, cli.delete_unreferenced),
    );
    let summary = janitor
        .sweep(SystemTime::now())
        .await
        .map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "janitor sweep complete: referenced={}, removed_partial={}, removed_unreferenced={}, kept_unreferenced={}, skipped_recent={}",
        summary.referenced,
        summary.removed_partial,
        summary.removed_unreferenced,
        summary.kept_unreferenced.len(),
        summary.skipped_recent
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
