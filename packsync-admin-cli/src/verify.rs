//! Offline integrity check and repair of a repository directory

use anyhow::{anyhow, Result};
use packsync_core::Repository;
use std::path::Path;

/// Check a repository without repairing it.
///
/// Fails when any invariant violation is found so scripts can rely on
/// the exit status.
pub async fn verify_repository(path: &Path, quiet: bool) -> Result<()> {
    let repo = Repository::open_existing(path)?;
    let report = repo.coordinator().verify().await?;

    if !quiet {
        println!("Verifying repository: {}", path.display());
        for problem in &report.problems {
            eprintln!("  ERROR: {}", problem);
        }
    }

    println!("\nVerification:");
    println!("  Refs checked:     {}", report.refs_checked);
    println!("  Records checked:  {}", report.records_checked);
    println!("  Packs checked:    {}", report.packs_checked);
    println!("  Problems:         {}", report.problems.len());

    if report.is_ok() {
        if !quiet {
            println!("\n✓ Repository is healthy");
        }
        Ok(())
    } else {
        Err(anyhow!(
            "Repository verification failed with {} problem(s)",
            report.problems.len()
        ))
    }
}

/// Run the reconcile pass and print what it changed.
pub async fn repair_repository(path: &Path) -> Result<()> {
    let repo = Repository::open_existing(path)?;
    let report = repo.reconcile().await?;

    if report.is_clean() {
        println!("Nothing to repair");
        return Ok(());
    }
    for record in &report.appended {
        println!(
            "  logged   {} {} -> {} (seq {})",
            record.name, record.old_oid, record.new_oid, record.seq
        );
    }
    for entry in &report.restored {
        println!("  restored {} -> {}", entry.name, entry.oid);
    }
    println!(
        "Repaired: {} record(s) appended, {} ref(s) restored",
        report.appended.len(),
        report.restored.len()
    );
    Ok(())
}
