//! CLI `doctor` command: store diagnostics and a health report.

use anyhow::{Context, Result};

use crate::config::HindsightConfig;
use crate::db;

pub fn doctor(config: &HindsightConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `hindsight start` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("hindsight health report");
    println!("=======================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Vector backend:    {}", config.vector.backend);
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {}", config.vector.model);
    if let Some(stored) = &report.embedding_model {
        if stored != &config.vector.model {
            println!("  WARNING: model mismatch. Existing vectors were built with a different model.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Sessions:        {}", report.session_count);
    println!("  Observations:    {}", report.observation_count);
    println!("  Summaries:       {}", report.summary_count);
    println!("  Prompts:         {}", report.prompt_count);
    println!("  Pending queue:   {}", report.pending_count);
    println!("  Vector docs:     {}", report.vector_document_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery: stop the worker and restore {} from a backup.", db_path.display());
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
