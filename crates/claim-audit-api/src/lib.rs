use std::path::PathBuf;

use claim_audit_core::{
    build_record_migration, retention_cutoff, AppliedMovement, ArchivePassSummary, AuditError,
    Denial, DenialDraft, DenialId, MovementCandidate, Record, RecordAggregate, RecordDraft,
    RecordId, ARCHIVE_BATCH_SIZE,
};
use claim_audit_store_sqlite::{
    IntegrityReport, SchemaStatus, SqliteStore, CACHE_TAG_RECORDS,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Operation facade consumed by the HTTP layer, the CLI, and the external
/// scheduler. One store is opened per call; concurrent callers serialize at
/// the store.
#[derive(Debug, Clone)]
pub struct ClaimAuditApi {
    db_path: PathBuf,
}

impl ClaimAuditApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, AuditError> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, AuditError> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, AuditError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a record with its automatic intake movement.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn create_record(&self, draft: &RecordDraft) -> Result<Record, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.create_record(draft)
    }

    /// Validate and apply one proposed movement.
    ///
    /// # Errors
    /// [`AuditError::Validation`], [`AuditError::Sequence`],
    /// [`AuditError::NotFound`], or [`AuditError::Transaction`] per the
    /// movement rules; a failed proposal has no partial effect.
    pub fn propose_movement(
        &self,
        record_id: RecordId,
        candidate: &MovementCandidate,
    ) -> Result<AppliedMovement, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.apply_movement(record_id, candidate)
    }

    /// Append an active denial to a record.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_denial(
        &self,
        record_id: RecordId,
        draft: &DenialDraft,
    ) -> Result<Denial, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.add_denial(record_id, draft)
    }

    /// Soft-delete a denial, preserving its row for audit.
    ///
    /// # Errors
    /// Returns an error when the denial does not exist or the update fails.
    pub fn remove_denial(&self, denial_id: DenialId) -> Result<Denial, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.remove_denial(denial_id)
    }

    /// Active denials for one record, in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_active_denials(&self, record_id: RecordId) -> Result<Vec<Denial>, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_active_denials(record_id)
    }

    /// Live-record lookup by external number.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] when no live record carries the number.
    pub fn lookup_record(&self, external_number: &str) -> Result<RecordAggregate, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.record_aggregate(external_number)
    }

    /// Archived-record lookup by external number; same aggregate shape as a
    /// live lookup, tagged `is_archived = true`.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] when the number was never archived.
    pub fn lookup_archived(&self, external_number: &str) -> Result<RecordAggregate, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.lookup_archived(external_number)
    }

    /// All live records, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_records(&self) -> Result<Vec<Record>, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_records()
    }

    /// The single scheduler-facing entry point: migrate every aged,
    /// terminal-status record (and its dependents) into the archive mirror.
    ///
    /// Eligible ids are processed in fixed-size batches, strictly
    /// sequentially. Each record migrates in its own transaction: a
    /// transaction failure is counted and the pass moves on, while an
    /// unavailable store abandons the remaining work and reports partial
    /// progress. Space reclamation runs once at the end, never per batch.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be opened or the
    /// eligibility query fails; per-record failures are reported in the
    /// summary, not raised.
    pub fn run_archival_pass(&self) -> Result<ArchivePassSummary, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let now = OffsetDateTime::now_utc();
        let cutoff = retention_cutoff(now);
        let eligible = store.eligible_record_ids(cutoff)?;
        if eligible.is_empty() {
            tracing::debug!("archival pass found no eligible records");
            return Ok(ArchivePassSummary { archived: 0, failed: 0, cutoff, aborted: false });
        }

        let mut archived = 0_usize;
        let mut failed = 0_usize;
        let mut aborted = false;

        'batches: for batch in eligible.chunks(ARCHIVE_BATCH_SIZE) {
            for record_id in batch {
                match migrate_record(&mut store, *record_id, now) {
                    Ok(()) => archived += 1,
                    Err(AuditError::Unavailable(detail)) => {
                        tracing::warn!(
                            "archival pass abandoned after {archived} records, store unavailable: {detail}"
                        );
                        aborted = true;
                        break 'batches;
                    }
                    Err(err) => {
                        failed += 1;
                        tracing::warn!("migration of record {record_id} rolled back: {err}");
                    }
                }
            }
        }

        if archived > 0 && !aborted {
            if let Err(err) = store.reclaim_space() {
                tracing::warn!("space reclamation after archival failed: {err}");
            }
        }
        store.invalidate_cache(CACHE_TAG_RECORDS);

        tracing::info!(
            "archival pass finished: archived={archived} failed={failed} aborted={aborted}"
        );
        Ok(ArchivePassSummary { archived, failed, cutoff, aborted })
    }

    /// Run the store's integrity probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Write a backup of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &std::path::Path) -> Result<(), AuditError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// Restore the database from a backup file.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing or the restore fails.
    pub fn restore_database(&self, in_file: &std::path::Path) -> Result<(), AuditError> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }
}

fn migrate_record(
    store: &mut SqliteStore,
    record_id: RecordId,
    archived_at: OffsetDateTime,
) -> Result<(), AuditError> {
    let bundle = store.fetch_bundle(record_id)?;
    let statements = build_record_migration(&bundle, archived_at)?;
    store.apply_statements(&statements)
}
