//! CLI `backfill` command: index every stored row into the vector backend.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

use crate::config::HindsightConfig;
use crate::db::manager::DatabaseManager;
use crate::lifecycle::process::ProcessRegistry;

pub async fn backfill(config: &HindsightConfig) -> Result<()> {
    let registry = Arc::new(ProcessRegistry::new(config.vector.max_processes));
    let store = DatabaseManager::open(config, Arc::clone(&registry))?;
    let vector = Arc::clone(store.vector());

    if !vector.is_enabled() {
        println!("No vector backend is configured; nothing to backfill.");
        store.close().await?;
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg} ({elapsed})")
            .context("invalid progress template")?,
    );
    spinner.set_message(format!("indexing into {}", vector.backend_name()));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = vector.ensure_backfilled().await;
    spinner.finish_and_clear();
    store.close().await?;
    registry.kill_all();

    let report = result.context("backfill failed")?;
    println!("Backfill complete.");
    println!("  Observations:    {}", report.observations);
    println!("  Summaries:       {}", report.summaries);
    println!("  Prompts:         {}", report.prompts);
    println!("  Documents added: {}", report.documents_added);
    Ok(())
}
