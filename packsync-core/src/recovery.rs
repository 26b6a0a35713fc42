//! Crash reconciliation and invariant verification
//!
//! Refs are committed before the log is appended, so a crash between the
//! two leaves a ref ahead of its log. `reconcile` appends the missing
//! record instead of dropping the update. A ref that exists only in the
//! log is restored from its last record.

use crate::coordinator::SyncCoordinator;
use crate::error::Result;
use crate::types::{NewUpdateRecord, RefEntry, UpdateRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Outcome of a reconciliation pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    /// Records appended for refs that were ahead of the log
    pub appended: Vec<UpdateRecord>,
    /// Refs restored from the log
    pub restored: Vec<RefEntry>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.appended.is_empty() && self.restored.is_empty()
    }
}

/// Outcome of a verification pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    pub refs_checked: usize,
    pub records_checked: usize,
    pub packs_checked: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl SyncCoordinator {
    /// Bring the ref table and the update log back into agreement
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _exclusive = self.gate.write().await;
        self.reconcile_locked().await
    }

    /// Caller must hold the commit gate exclusively.
    pub(crate) async fn reconcile_locked(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let refs = self.refs.list().await?;
        let known: HashSet<String> = refs.iter().map(|r| r.name.clone()).collect();

        for entry in refs {
            let records = self.log.query_by_ref(&entry.name).await?;
            let logged_tip = records.last().map(|r| r.new_oid.as_str()).unwrap_or("");
            if logged_tip == entry.oid {
                continue;
            }

            // Refs are committed before the log, so a ref that still exists
            // can only be ahead of its log, even when its oid appeared earlier
            // in the history.
            let (size, sha256) = match self.blobs.stat(&entry.pack_id).await? {
                Some(info) => (info.size, info.sha256),
                None => {
                    tracing::error!(
                        ref_name = %entry.name,
                        pack = %entry.pack_id,
                        "pack missing while repairing update log, recording without size or digest"
                    );
                    (0, String::new())
                }
            };
            tracing::warn!(
                ref_name = %entry.name,
                logged = %logged_tip,
                current = %entry.oid,
                "ref ahead of update log, appending repair record"
            );
            let appended = self
                .log
                .append(vec![NewUpdateRecord {
                    name: entry.name.clone(),
                    old_oid: logged_tip.to_string(),
                    new_oid: entry.oid.clone(),
                    pack_id: entry.pack_id.clone(),
                    size,
                    sha256,
                    timestamp: chrono::Utc::now().timestamp(),
                }])
                .await?;
            report.appended.extend(appended);
        }

        // Refs that exist only in the log.
        let mut orphaned: BTreeMap<String, UpdateRecord> = BTreeMap::new();
        for record in self.log.all().await? {
            if !known.contains(&record.name) {
                orphaned.insert(record.name.clone(), record);
            }
        }
        for (name, last) in orphaned {
            let first_old = self
                .log
                .query_by_ref(&name)
                .await?
                .first()
                .map(|r| r.old_oid.clone())
                .unwrap_or_default();
            if !first_old.is_empty() {
                tracing::error!(ref_name = %name, "logged history does not start at an empty ref");
                continue;
            }
            tracing::warn!(ref_name = %name, to = %last.new_oid, "ref missing from ref table, restoring");
            self.refs
                .compare_and_swap(&name, "", &last.new_oid, &last.pack_id)
                .await?;
            report.restored.push(RefEntry {
                name,
                oid: last.new_oid,
                pack_id: last.pack_id,
            });
        }

        if !report.is_clean() {
            tracing::info!(
                appended = report.appended.len(),
                restored = report.restored.len(),
                "reconciliation repaired repository"
            );
        }
        Ok(report)
    }

    /// Check every invariant without modifying anything
    pub async fn verify(&self) -> Result<VerifyReport> {
        let _shared = self.gate.read().await;
        let mut report = VerifyReport::default();

        let refs = self.refs.list().await?;
        let records = self.log.all().await?;
        report.refs_checked = refs.len();
        report.records_checked = records.len();

        let mut chains: BTreeMap<&str, Vec<&UpdateRecord>> = BTreeMap::new();
        for r in &records {
            chains.entry(r.name.as_str()).or_default().push(r);
        }

        for (name, chain) in &chains {
            if let Some(first) = chain.first() {
                if !first.old_oid.is_empty() {
                    report.problems.push(format!(
                        "ref '{}': first record (seq {}) starts at '{}' instead of an empty ref",
                        name, first.seq, first.old_oid
                    ));
                }
            }
            for pair in chain.windows(2) {
                if pair[1].old_oid != pair[0].new_oid {
                    report.problems.push(format!(
                        "ref '{}': record seq {} starts at '{}' but seq {} ended at '{}'",
                        name, pair[1].seq, pair[1].old_oid, pair[0].seq, pair[0].new_oid
                    ));
                }
            }
        }

        for entry in &refs {
            let logged_tip = chains
                .get(entry.name.as_str())
                .and_then(|c| c.last())
                .map(|r| r.new_oid.as_str())
                .unwrap_or("");
            if logged_tip != entry.oid {
                report.problems.push(format!(
                    "ref '{}': points at '{}' but update log ends at '{}'",
                    entry.name, entry.oid, logged_tip
                ));
            }
        }
        for name in chains.keys() {
            if !refs.iter().any(|r| r.name == *name) {
                report
                    .problems
                    .push(format!("ref '{}': logged but missing from ref table", name));
            }
        }

        let referenced: HashSet<&str> = refs
            .iter()
            .map(|r| r.pack_id.as_str())
            .chain(records.iter().map(|r| r.pack_id.as_str()))
            .collect();
        report.packs_checked = referenced.len();
        for pack_id in referenced {
            match self.blobs.stat(pack_id).await {
                Ok(Some(_)) => {}
                Ok(None) => report.problems.push(format!("pack {} is missing", pack_id)),
                Err(e) => report.problems.push(format!("pack {}: {}", pack_id, e)),
            }
        }

        Ok(report)
    }
}
