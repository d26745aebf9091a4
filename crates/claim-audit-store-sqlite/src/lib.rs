use std::collections::HashMap;
use std::fs;
use std::path::Path;

use claim_audit_core::{
    parse_rfc3339, rfc3339, AppliedMovement, AuditError, Competence, Denial, DenialDraft,
    DenialId, EncounterId, Money, Movement, MovementCandidate, MovementId, MovementKind, Record,
    RecordAggregate, RecordBundle, RecordDraft, RecordId, RecordStatus, ServiceEncounter,
    Signoff, SqlStatement, SqlValue,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Cache tag that drops every cached aggregate; any other tag evicts the
/// aggregate cached under that external number.
pub const CACHE_TAG_RECORDS: &str = "records";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_LIVE_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  external_number TEXT NOT NULL UNIQUE,
  initial_value_cents INTEGER NOT NULL,
  current_value_cents INTEGER NOT NULL,
  status INTEGER NOT NULL CHECK (status IN (1, 2, 3, 4)),
  competence TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS movements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id INTEGER NOT NULL REFERENCES records(id),
  kind TEXT NOT NULL CHECK (kind IN ('intake', 'discharge')),
  moved_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  declared_value_cents INTEGER NOT NULL,
  competence TEXT NOT NULL,
  medicine_professional TEXT,
  nursing_professional TEXT,
  physiotherapy_professional TEXT,
  maxillofacial_professional TEXT,
  asserted_status INTEGER NOT NULL CHECK (asserted_status IN (1, 2, 3, 4)),
  notes TEXT
);

CREATE TABLE IF NOT EXISTS denials (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id INTEGER NOT NULL REFERENCES records(id),
  line_code TEXT NOT NULL,
  kind TEXT NOT NULL,
  professional TEXT NOT NULL,
  quantity INTEGER NOT NULL CHECK (quantity >= 1),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_encounters (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id INTEGER NOT NULL REFERENCES records(id),
  encounter_number TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_movements_record ON movements(record_id);
CREATE INDEX IF NOT EXISTS idx_denials_record ON denials(record_id);
CREATE INDEX IF NOT EXISTS idx_service_encounters_record ON service_encounters(record_id);
CREATE INDEX IF NOT EXISTS idx_records_status_created ON records(status, created_at);
";

const MIGRATION_002_ARCHIVE_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS archive_records (
  id INTEGER PRIMARY KEY,
  external_number TEXT NOT NULL UNIQUE,
  initial_value_cents INTEGER NOT NULL,
  current_value_cents INTEGER NOT NULL,
  status INTEGER NOT NULL CHECK (status IN (1, 2, 3, 4)),
  competence TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_movements (
  id INTEGER PRIMARY KEY,
  record_id INTEGER NOT NULL REFERENCES archive_records(id),
  kind TEXT NOT NULL CHECK (kind IN ('intake', 'discharge')),
  moved_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  declared_value_cents INTEGER NOT NULL,
  competence TEXT NOT NULL,
  medicine_professional TEXT,
  nursing_professional TEXT,
  physiotherapy_professional TEXT,
  maxillofacial_professional TEXT,
  asserted_status INTEGER NOT NULL CHECK (asserted_status IN (1, 2, 3, 4)),
  notes TEXT,
  archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_denials (
  id INTEGER PRIMARY KEY,
  record_id INTEGER NOT NULL REFERENCES archive_records(id),
  line_code TEXT NOT NULL,
  kind TEXT NOT NULL,
  professional TEXT NOT NULL,
  quantity INTEGER NOT NULL CHECK (quantity >= 1),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL,
  archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_service_encounters (
  id INTEGER PRIMARY KEY,
  record_id INTEGER NOT NULL REFERENCES archive_records(id),
  encounter_number TEXT NOT NULL,
  archived_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archive_movements_record ON archive_movements(record_id);
CREATE INDEX IF NOT EXISTS idx_archive_denials_record ON archive_denials(record_id);
CREATE INDEX IF NOT EXISTS idx_archive_service_encounters_record ON archive_service_encounters(record_id);
";

const RECORD_COLUMNS: &str = "id, external_number, initial_value_cents, current_value_cents,
    status, competence, created_at, created_by";

const MOVEMENT_COLUMNS: &str = "id, record_id, kind, moved_at, actor, declared_value_cents,
    competence, medicine_professional, nursing_professional, physiotherapy_professional,
    maxillofacial_professional, asserted_status, notes";

const DENIAL_COLUMNS: &str =
    "id, record_id, line_code, kind, professional, quantity, active, created_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// SQLite-backed record store. All mutating operations run inside a single
/// transaction, so a failed call leaves no partial effect.
pub struct SqliteStore {
    conn: Connection,
    aggregate_cache: HashMap<String, RecordAggregate>,
}

impl SqliteStore {
    /// Open the store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`AuditError::Unavailable`] when the database cannot be opened
    /// or the pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open(path).map_err(AuditError::unavailable)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(AuditError::unavailable)?;

        Ok(Self { conn, aggregate_cache: HashMap::new() })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, AuditError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(AuditError::unavailable)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all pending schema migrations.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<(), AuditError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(AuditError::unavailable)?;

        let current = current_schema_version(&self.conn)?;
        let migrations: [(i64, &str); 2] = [
            (1, MIGRATION_001_LIVE_TABLES_SQL),
            (2, MIGRATION_002_ARCHIVE_TABLES_SQL),
        ];

        for (version, sql) in migrations {
            if version > current {
                tracing::info!("applying schema migration v{version}");
                self.conn.execute_batch(sql).map_err(AuditError::transaction)?;
                record_schema_version(&self.conn, version)?;
            }
        }

        Ok(())
    }

    /// Create a record with its automatic intake movement and any service
    /// encounters, in one transaction.
    ///
    /// # Errors
    /// Returns [`AuditError::Validation`] for bad input (including an external
    /// number already in use) or [`AuditError::Transaction`] when the write fails.
    pub fn create_record(&mut self, draft: &RecordDraft) -> Result<Record, AuditError> {
        draft.validate()?;

        let created_at = OffsetDateTime::now_utc();
        let created_at_text = rfc3339(created_at)?;
        let tx = self.conn.transaction().map_err(AuditError::transaction)?;

        let taken: i64 = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM records WHERE external_number = ?1)",
                params![draft.external_number],
                |row| row.get(0),
            )
            .map_err(AuditError::transaction)?;
        if taken == 1 {
            return Err(AuditError::Validation {
                reasons: vec![format!(
                    "external number {} is already in use",
                    draft.external_number
                )],
            });
        }

        tx.execute(
            "INSERT INTO records(
                external_number, initial_value_cents, current_value_cents,
                status, competence, created_at, created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                draft.external_number,
                draft.initial_value.cents(),
                draft.initial_value.cents(),
                RecordStatus::ActiveDiscussion.code(),
                draft.competence.to_string(),
                created_at_text,
                draft.created_by,
            ],
        )
        .map_err(AuditError::transaction)?;
        let record_id = RecordId(tx.last_insert_rowid());

        insert_movement_row(
            &tx,
            record_id,
            MovementKind::Intake,
            created_at,
            &draft.created_by,
            draft.initial_value,
            draft.competence,
            &draft.signoff,
            RecordStatus::ActiveDiscussion,
            None,
        )?;

        for encounter_number in &draft.encounter_numbers {
            tx.execute(
                "INSERT INTO service_encounters(record_id, encounter_number) VALUES (?1, ?2)",
                params![record_id.0, encounter_number],
            )
            .map_err(AuditError::transaction)?;
        }

        tx.commit().map_err(AuditError::transaction)?;
        self.invalidate_cache(&draft.external_number);

        Ok(Record {
            id: record_id,
            external_number: draft.external_number.clone(),
            initial_value: draft.initial_value,
            current_value: draft.initial_value,
            status: RecordStatus::ActiveDiscussion,
            competence: draft.competence,
            created_at,
            created_by: draft.created_by.clone(),
        })
    }

    /// Validate and apply one proposed movement: sequence check against the
    /// latest movement, insert, and record status/value update all commit or
    /// fail together.
    ///
    /// # Errors
    /// [`AuditError::Validation`] for signoff/field violations (all collected),
    /// [`AuditError::Sequence`] when the proposed kind is not the legal next
    /// one, [`AuditError::NotFound`] for an unknown record, and
    /// [`AuditError::Transaction`] when the store aborts (retryable).
    pub fn apply_movement(
        &mut self,
        record_id: RecordId,
        candidate: &MovementCandidate,
    ) -> Result<AppliedMovement, AuditError> {
        candidate.validate()?;

        let moved_at = OffsetDateTime::now_utc();
        let tx = self.conn.transaction().map_err(AuditError::transaction)?;

        let mut record = record_by_id(&tx, record_id)?
            .ok_or_else(|| AuditError::not_found(format!("record {record_id}")))?;

        let latest = latest_movement_kind(&tx, record_id)?;
        let expected = MovementKind::next_allowed(latest);
        if candidate.kind != expected {
            return Err(AuditError::Sequence { expected, got: candidate.kind });
        }

        let movement_id = insert_movement_row(
            &tx,
            record_id,
            candidate.kind,
            moved_at,
            &candidate.actor,
            candidate.declared_value,
            candidate.competence,
            &candidate.signoff,
            candidate.asserted_status,
            candidate.notes.as_deref(),
        )?;

        tx.execute(
            "UPDATE records SET status = ?1, current_value_cents = ?2 WHERE id = ?3",
            params![
                candidate.asserted_status.code(),
                candidate.declared_value.cents(),
                record_id.0
            ],
        )
        .map_err(AuditError::transaction)?;

        tx.commit().map_err(AuditError::transaction)?;

        record.status = candidate.asserted_status;
        record.current_value = candidate.declared_value;
        let external_number = record.external_number.clone();
        self.invalidate_cache(&external_number);

        Ok(AppliedMovement {
            movement: Movement {
                id: movement_id,
                record_id,
                kind: candidate.kind,
                moved_at,
                actor: candidate.actor.clone(),
                declared_value: candidate.declared_value,
                competence: candidate.competence,
                signoff: candidate.signoff.clone(),
                asserted_status: candidate.asserted_status,
                notes: candidate.notes.clone(),
            },
            record,
        })
    }

    /// Append an active denial. Denials never touch record status/value.
    ///
    /// # Errors
    /// [`AuditError::Validation`] for bad input, [`AuditError::NotFound`] for
    /// an unknown record, [`AuditError::Transaction`] when the write fails.
    pub fn add_denial(
        &mut self,
        record_id: RecordId,
        draft: &DenialDraft,
    ) -> Result<Denial, AuditError> {
        draft.validate()?;

        let record = record_by_id(&self.conn, record_id)?
            .ok_or_else(|| AuditError::not_found(format!("record {record_id}")))?;

        let created_at = OffsetDateTime::now_utc();
        self.conn
            .execute(
                "INSERT INTO denials(record_id, line_code, kind, professional, quantity, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    record_id.0,
                    draft.line_code,
                    draft.kind,
                    draft.professional,
                    i64::from(draft.quantity),
                    rfc3339(created_at)?,
                ],
            )
            .map_err(AuditError::transaction)?;
        let denial_id = DenialId(self.conn.last_insert_rowid());
        self.invalidate_cache(&record.external_number);

        Ok(Denial {
            id: denial_id,
            record_id,
            line_code: draft.line_code.clone(),
            kind: draft.kind.clone(),
            professional: draft.professional.clone(),
            quantity: draft.quantity,
            active: true,
            created_at,
        })
    }

    /// Soft-delete a denial: the active flag flips, the row stays for audit.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] for an unknown denial id,
    /// [`AuditError::Transaction`] when the update fails.
    pub fn remove_denial(&mut self, denial_id: DenialId) -> Result<Denial, AuditError> {
        let mut denial = denial_by_id(&self.conn, denial_id)?
            .ok_or_else(|| AuditError::not_found(format!("denial {denial_id}")))?;

        self.conn
            .execute("UPDATE denials SET active = 0 WHERE id = ?1", params![denial_id.0])
            .map_err(AuditError::transaction)?;
        denial.active = false;

        if let Some(record) = record_by_id(&self.conn, denial.record_id)? {
            self.invalidate_cache(&record.external_number);
        }

        Ok(denial)
    }

    /// Active denials for one record, in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_active_denials(&self, record_id: RecordId) -> Result<Vec<Denial>, AuditError> {
        let sql = format!(
            "SELECT {DENIAL_COLUMNS} FROM denials
             WHERE record_id = ?1 AND active = 1 ORDER BY id ASC"
        );
        collect_denials(&self.conn, &sql, params![record_id.0])
    }

    /// Live records whose age and terminal status make them archival-eligible.
    /// Archived records are absent from live tables and can never reappear here.
    ///
    /// # Errors
    /// Returns an error when the eligibility query fails.
    pub fn eligible_record_ids(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<RecordId>, AuditError> {
        let cutoff_text = rfc3339(cutoff)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id FROM records
                 WHERE created_at < ?1 AND status IN (1, 4)
                 ORDER BY id ASC",
            )
            .map_err(AuditError::transaction)?;
        let rows = stmt
            .query_map(params![cutoff_text], |row| row.get::<_, i64>(0))
            .map_err(AuditError::transaction)?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(RecordId(row.map_err(AuditError::transaction)?));
        }
        Ok(ids)
    }

    /// One record plus every dependent row, as input to the migration builder.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] for an unknown record, otherwise read errors.
    pub fn fetch_bundle(&self, record_id: RecordId) -> Result<RecordBundle, AuditError> {
        let record = record_by_id(&self.conn, record_id)?
            .ok_or_else(|| AuditError::not_found(format!("record {record_id}")))?;

        let movements_sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements WHERE record_id = ?1 ORDER BY id ASC"
        );
        let denials_sql =
            format!("SELECT {DENIAL_COLUMNS} FROM denials WHERE record_id = ?1 ORDER BY id ASC");

        Ok(RecordBundle {
            movements: collect_movements(&self.conn, &movements_sql, params![record_id.0])?,
            denials: collect_denials(&self.conn, &denials_sql, params![record_id.0])?,
            encounters: collect_encounters(&self.conn, record_id)?,
            record,
        })
    }

    /// Execute a prepared statement list as one all-or-nothing transaction.
    ///
    /// # Errors
    /// Returns [`AuditError::Transaction`] and rolls everything back when any
    /// statement fails.
    pub fn apply_statements(&mut self, statements: &[SqlStatement]) -> Result<(), AuditError> {
        let tx = self.conn.transaction().map_err(AuditError::transaction)?;
        for statement in statements {
            let values = statement.params.iter().map(to_sqlite_value).collect::<Vec<_>>();
            tx.execute(&statement.sql, rusqlite::params_from_iter(values))
                .map_err(AuditError::transaction)?;
        }
        tx.commit().map_err(AuditError::transaction)?;
        Ok(())
    }

    /// Checkpoint the WAL and run a full VACUUM. Expensive and exclusive; run
    /// once per archival pass, never per batch.
    ///
    /// # Errors
    /// Returns [`AuditError::Transaction`] when the checkpoint or VACUUM fails.
    pub fn reclaim_space(&mut self) -> Result<(), AuditError> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(AuditError::transaction)?;
        self.conn.execute_batch("VACUUM;").map_err(AuditError::transaction)?;
        Ok(())
    }

    /// Drop cached aggregates: [`CACHE_TAG_RECORDS`] clears everything, any
    /// other tag evicts the aggregate cached under that external number.
    pub fn invalidate_cache(&mut self, tag: &str) {
        if tag == CACHE_TAG_RECORDS {
            self.aggregate_cache.clear();
        } else {
            self.aggregate_cache.remove(tag);
        }
    }

    /// Live-record lookup by external number, served from the aggregate cache
    /// when possible.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] when no live record carries the number.
    pub fn record_aggregate(
        &mut self,
        external_number: &str,
    ) -> Result<RecordAggregate, AuditError> {
        if let Some(aggregate) = self.aggregate_cache.get(external_number) {
            return Ok(aggregate.clone());
        }

        let record = record_by_external(&self.conn, external_number)?
            .ok_or_else(|| AuditError::not_found(format!("record {external_number}")))?;
        let bundle = self.fetch_bundle(record.id)?;
        let aggregate = RecordAggregate {
            record: bundle.record,
            movements: bundle.movements,
            denials: bundle.denials,
            encounter_numbers: bundle
                .encounters
                .into_iter()
                .map(|encounter| encounter.encounter_number)
                .collect(),
            is_archived: false,
        };
        self.aggregate_cache.insert(external_number.to_string(), aggregate.clone());
        Ok(aggregate)
    }

    /// Reconstruct the same aggregate shape as a live lookup from the archive
    /// mirror, tagged `is_archived = true`.
    ///
    /// # Errors
    /// [`AuditError::NotFound`] when the number was never archived.
    pub fn lookup_archived(
        &self,
        external_number: &str,
    ) -> Result<RecordAggregate, AuditError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM archive_records WHERE external_number = ?1");
        let record = self
            .conn
            .query_row(&sql, params![external_number], record_row)
            .optional()
            .map_err(AuditError::transaction)?
            .ok_or_else(|| AuditError::not_found(format!("archived record {external_number}")))?
            .into_record()?;

        let movements_sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM archive_movements WHERE record_id = ?1 ORDER BY id ASC"
        );
        let denials_sql = format!(
            "SELECT {DENIAL_COLUMNS} FROM archive_denials WHERE record_id = ?1 ORDER BY id ASC"
        );
        let movements = collect_movements(&self.conn, &movements_sql, params![record.id.0])?;
        let denials = collect_denials(&self.conn, &denials_sql, params![record.id.0])?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT encounter_number FROM archive_service_encounters
                 WHERE record_id = ?1 ORDER BY id ASC",
            )
            .map_err(AuditError::transaction)?;
        let rows = stmt
            .query_map(params![record.id.0], |row| row.get::<_, String>(0))
            .map_err(AuditError::transaction)?;
        let mut encounter_numbers = Vec::new();
        for row in rows {
            encounter_numbers.push(row.map_err(AuditError::transaction)?);
        }

        Ok(RecordAggregate { record, movements, denials, encounter_numbers, is_archived: true })
    }

    /// All live records, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_records(&self) -> Result<Vec<Record>, AuditError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql).map_err(AuditError::transaction)?;
        let rows = stmt.query_map([], record_row).map_err(AuditError::transaction)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(AuditError::transaction)?.into_record()?);
        }
        Ok(records)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, AuditError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(AuditError::transaction)?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .map_err(AuditError::transaction)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .map_err(AuditError::transaction)?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.map_err(AuditError::transaction)?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Create a SQLite backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), AuditError> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(AuditError::unavailable)?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .map_err(AuditError::transaction)
    }

    /// Restore this database from a SQLite backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or
    /// migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), AuditError> {
        if !in_file.exists() {
            return Err(AuditError::not_found(format!(
                "backup file {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .map_err(AuditError::transaction)?;
        self.invalidate_cache(CACHE_TAG_RECORDS);
        self.migrate()
    }
}

// Raw row shapes: read untyped first, convert with the core parsers so a
// corrupted column surfaces as a store error instead of a panic.
struct RecordRow {
    id: i64,
    external_number: String,
    initial_value_cents: i64,
    current_value_cents: i64,
    status: i64,
    competence: String,
    created_at: String,
    created_by: String,
}

impl RecordRow {
    fn into_record(self) -> Result<Record, AuditError> {
        Ok(Record {
            id: RecordId(self.id),
            external_number: self.external_number,
            initial_value: Money::from_cents(self.initial_value_cents),
            current_value: Money::from_cents(self.current_value_cents),
            status: RecordStatus::from_code(self.status).ok_or_else(|| {
                AuditError::transaction(format!("unknown record status code {}", self.status))
            })?,
            competence: parse_competence(&self.competence)?,
            created_at: parse_rfc3339(&self.created_at)?,
            created_by: self.created_by,
        })
    }
}

struct MovementRow {
    id: i64,
    record_id: i64,
    kind: String,
    moved_at: String,
    actor: String,
    declared_value_cents: i64,
    competence: String,
    medicine: Option<String>,
    nursing: Option<String>,
    physiotherapy: Option<String>,
    maxillofacial: Option<String>,
    asserted_status: i64,
    notes: Option<String>,
}

impl MovementRow {
    fn into_movement(self) -> Result<Movement, AuditError> {
        Ok(Movement {
            id: MovementId(self.id),
            record_id: RecordId(self.record_id),
            kind: MovementKind::parse(&self.kind).ok_or_else(|| {
                AuditError::transaction(format!("unknown movement kind {}", self.kind))
            })?,
            moved_at: parse_rfc3339(&self.moved_at)?,
            actor: self.actor,
            declared_value: Money::from_cents(self.declared_value_cents),
            competence: parse_competence(&self.competence)?,
            signoff: Signoff {
                medicine: self.medicine,
                nursing: self.nursing,
                physiotherapy: self.physiotherapy,
                maxillofacial: self.maxillofacial,
            },
            asserted_status: RecordStatus::from_code(self.asserted_status).ok_or_else(|| {
                AuditError::transaction(format!(
                    "unknown record status code {}",
                    self.asserted_status
                ))
            })?,
            notes: self.notes,
        })
    }
}

struct DenialRow {
    id: i64,
    record_id: i64,
    line_code: String,
    kind: String,
    professional: String,
    quantity: i64,
    active: i64,
    created_at: String,
}

impl DenialRow {
    fn into_denial(self) -> Result<Denial, AuditError> {
        Ok(Denial {
            id: DenialId(self.id),
            record_id: RecordId(self.record_id),
            line_code: self.line_code,
            kind: self.kind,
            professional: self.professional,
            quantity: u32::try_from(self.quantity).map_err(|_| {
                AuditError::transaction(format!("invalid denial quantity {}", self.quantity))
            })?,
            active: self.active == 1,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        external_number: row.get(1)?,
        initial_value_cents: row.get(2)?,
        current_value_cents: row.get(3)?,
        status: row.get(4)?,
        competence: row.get(5)?,
        created_at: row.get(6)?,
        created_by: row.get(7)?,
    })
}

fn movement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MovementRow> {
    Ok(MovementRow {
        id: row.get(0)?,
        record_id: row.get(1)?,
        kind: row.get(2)?,
        moved_at: row.get(3)?,
        actor: row.get(4)?,
        declared_value_cents: row.get(5)?,
        competence: row.get(6)?,
        medicine: row.get(7)?,
        nursing: row.get(8)?,
        physiotherapy: row.get(9)?,
        maxillofacial: row.get(10)?,
        asserted_status: row.get(11)?,
        notes: row.get(12)?,
    })
}

fn denial_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DenialRow> {
    Ok(DenialRow {
        id: row.get(0)?,
        record_id: row.get(1)?,
        line_code: row.get(2)?,
        kind: row.get(3)?,
        professional: row.get(4)?,
        quantity: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn parse_competence(raw: &str) -> Result<Competence, AuditError> {
    Competence::parse(raw)
        .ok_or_else(|| AuditError::transaction(format!("invalid competence value: {raw}")))
}

fn record_by_id(conn: &Connection, record_id: RecordId) -> Result<Option<Record>, AuditError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
    conn.query_row(&sql, params![record_id.0], record_row)
        .optional()
        .map_err(AuditError::transaction)?
        .map(RecordRow::into_record)
        .transpose()
}

fn record_by_external(
    conn: &Connection,
    external_number: &str,
) -> Result<Option<Record>, AuditError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE external_number = ?1");
    conn.query_row(&sql, params![external_number], record_row)
        .optional()
        .map_err(AuditError::transaction)?
        .map(RecordRow::into_record)
        .transpose()
}

fn denial_by_id(conn: &Connection, denial_id: DenialId) -> Result<Option<Denial>, AuditError> {
    let sql = format!("SELECT {DENIAL_COLUMNS} FROM denials WHERE id = ?1");
    conn.query_row(&sql, params![denial_id.0], denial_row)
        .optional()
        .map_err(AuditError::transaction)?
        .map(DenialRow::into_denial)
        .transpose()
}

fn latest_movement_kind(
    conn: &Connection,
    record_id: RecordId,
) -> Result<Option<MovementKind>, AuditError> {
    let raw = conn
        .query_row(
            "SELECT kind FROM movements WHERE record_id = ?1 ORDER BY id DESC LIMIT 1",
            params![record_id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(AuditError::transaction)?;

    match raw {
        Some(raw) => MovementKind::parse(&raw)
            .map(Some)
            .ok_or_else(|| AuditError::transaction(format!("unknown movement kind {raw}"))),
        None => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_movement_row(
    conn: &Connection,
    record_id: RecordId,
    kind: MovementKind,
    moved_at: OffsetDateTime,
    actor: &str,
    declared_value: Money,
    competence: Competence,
    signoff: &Signoff,
    asserted_status: RecordStatus,
    notes: Option<&str>,
) -> Result<MovementId, AuditError> {
    conn.execute(
        "INSERT INTO movements(
            record_id, kind, moved_at, actor, declared_value_cents, competence,
            medicine_professional, nursing_professional, physiotherapy_professional,
            maxillofacial_professional, asserted_status, notes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record_id.0,
            kind.as_str(),
            rfc3339(moved_at)?,
            actor,
            declared_value.cents(),
            competence.to_string(),
            signoff.medicine,
            signoff.nursing,
            signoff.physiotherapy,
            signoff.maxillofacial,
            asserted_status.code(),
            notes,
        ],
    )
    .map_err(AuditError::transaction)?;

    Ok(MovementId(conn.last_insert_rowid()))
}

fn collect_movements(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Movement>, AuditError> {
    let mut stmt = conn.prepare(sql).map_err(AuditError::transaction)?;
    let rows = stmt.query_map(params, movement_row).map_err(AuditError::transaction)?;

    let mut movements = Vec::new();
    for row in rows {
        movements.push(row.map_err(AuditError::transaction)?.into_movement()?);
    }
    Ok(movements)
}

fn collect_denials(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Denial>, AuditError> {
    let mut stmt = conn.prepare(sql).map_err(AuditError::transaction)?;
    let rows = stmt.query_map(params, denial_row).map_err(AuditError::transaction)?;

    let mut denials = Vec::new();
    for row in rows {
        denials.push(row.map_err(AuditError::transaction)?.into_denial()?);
    }
    Ok(denials)
}

fn collect_encounters(
    conn: &Connection,
    record_id: RecordId,
) -> Result<Vec<ServiceEncounter>, AuditError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, record_id, encounter_number FROM service_encounters
             WHERE record_id = ?1 ORDER BY id ASC",
        )
        .map_err(AuditError::transaction)?;
    let rows = stmt
        .query_map(params![record_id.0], |row| {
            Ok(ServiceEncounter {
                id: EncounterId(row.get(0)?),
                record_id: RecordId(row.get(1)?),
                encounter_number: row.get(2)?,
            })
        })
        .map_err(AuditError::transaction)?;

    let mut encounters = Vec::new();
    for row in rows {
        encounters.push(row.map_err(AuditError::transaction)?);
    }
    Ok(encounters)
}

fn to_sqlite_value(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(inner) => rusqlite::types::Value::Integer(*inner),
        SqlValue::Text(inner) => rusqlite::types::Value::Text(inner.clone()),
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64, AuditError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .map_err(AuditError::transaction)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), AuditError> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .map_err(AuditError::transaction)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use claim_audit_core::{build_record_migration, retention_cutoff};
    use time::Duration;

    use super::*;

    fn open_memory_store() -> Result<SqliteStore, AuditError> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn fixture_competence() -> Competence {
        match Competence::parse("07/2025") {
            Some(competence) => competence,
            None => panic!("fixture competence should parse"),
        }
    }

    fn fixture_signoff() -> Signoff {
        Signoff {
            medicine: Some("M1".to_string()),
            nursing: Some("N1".to_string()),
            physiotherapy: None,
            maxillofacial: None,
        }
    }

    fn fixture_draft(external_number: &str) -> RecordDraft {
        RecordDraft {
            external_number: external_number.to_string(),
            initial_value: match Money::parse("1000.00") {
                Some(value) => value,
                None => panic!("fixture value should parse"),
            },
            competence: fixture_competence(),
            created_by: "creator-1".to_string(),
            signoff: fixture_signoff(),
            encounter_numbers: vec!["ENC-0001".to_string()],
        }
    }

    fn discharge_candidate(value: &str) -> MovementCandidate {
        MovementCandidate {
            kind: MovementKind::Discharge,
            actor: "auditor-1".to_string(),
            declared_value: match Money::parse(value) {
                Some(value) => value,
                None => panic!("candidate value should parse"),
            },
            competence: fixture_competence(),
            signoff: fixture_signoff(),
            asserted_status: RecordStatus::FinalizedDirect,
            notes: None,
        }
    }

    fn fixture_denial_draft(professional: &str) -> DenialDraft {
        DenialDraft {
            line_code: "0301010010".to_string(),
            kind: "quantity".to_string(),
            professional: professional.to_string(),
            quantity: 1,
        }
    }

    fn backdate_record(
        store: &SqliteStore,
        record_id: RecordId,
        years: i64,
    ) -> Result<(), AuditError> {
        let shifted = OffsetDateTime::now_utc() - Duration::days(365 * years + 30);
        store
            .conn
            .execute(
                "UPDATE records SET created_at = ?1 WHERE id = ?2",
                params![rfc3339(shifted)?, record_id.0],
            )
            .map_err(AuditError::transaction)?;
        Ok(())
    }

    fn set_record_status(
        store: &SqliteStore,
        record_id: RecordId,
        status: RecordStatus,
    ) -> Result<(), AuditError> {
        store
            .conn
            .execute(
                "UPDATE records SET status = ?1 WHERE id = ?2",
                params![status.code(), record_id.0],
            )
            .map_err(AuditError::transaction)?;
        Ok(())
    }

    fn count_rows(store: &SqliteStore, table: &str) -> Result<i64, AuditError> {
        store
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(AuditError::transaction)
    }

    fn migrate_record(store: &mut SqliteStore, record_id: RecordId) -> Result<(), AuditError> {
        let bundle = store.fetch_bundle(record_id)?;
        let statements = build_record_migration(&bundle, OffsetDateTime::now_utc())?;
        store.apply_statements(&statements)?;
        store.invalidate_cache(CACHE_TAG_RECORDS);
        Ok(())
    }

    #[test]
    fn migrate_reaches_latest_schema_version() -> Result<(), AuditError> {
        let store = open_memory_store()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn created_record_starts_in_discussion_with_automatic_intake() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;

        assert_eq!(record.status, RecordStatus::ActiveDiscussion);
        assert_eq!(record.current_value, record.initial_value);

        let aggregate = store.record_aggregate("AIH-000001")?;
        assert_eq!(aggregate.movements.len(), 1);
        assert_eq!(aggregate.movements[0].kind, MovementKind::Intake);
        assert_eq!(aggregate.movements[0].declared_value, record.initial_value);
        assert_eq!(aggregate.encounter_numbers, vec!["ENC-0001".to_string()]);
        assert!(!aggregate.is_archived);
        Ok(())
    }

    #[test]
    fn duplicate_external_number_is_rejected_as_validation() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        store.create_record(&fixture_draft("AIH-000001"))?;

        let err = match store.create_record(&fixture_draft("AIH-000001")) {
            Ok(_) => panic!("duplicate external number should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Validation { .. }));
        Ok(())
    }

    // Scenario: create at 1000.00, discharge at 950.00 asserting status 1, then
    // an immediate second discharge must fail with the expected/got pair.
    #[test]
    fn discharge_updates_record_and_second_discharge_is_out_of_sequence(
    ) -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;

        let applied = store.apply_movement(record.id, &discharge_candidate("950.00"))?;
        assert_eq!(applied.record.status, RecordStatus::FinalizedDirect);
        assert_eq!(applied.record.current_value.to_string(), "950.00");
        assert_eq!(applied.movement.kind, MovementKind::Discharge);

        let err = match store.apply_movement(record.id, &discharge_candidate("900.00")) {
            Ok(_) => panic!("second discharge in a row should be rejected"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            AuditError::Sequence {
                expected: MovementKind::Intake,
                got: MovementKind::Discharge,
            }
        );

        // The failed proposal must leave no partial effect.
        let aggregate = store.record_aggregate("AIH-000001")?;
        assert_eq!(aggregate.movements.len(), 2);
        assert_eq!(aggregate.record.current_value.to_string(), "950.00");
        Ok(())
    }

    #[test]
    fn invalid_candidate_is_rejected_without_touching_the_record() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;

        let mut candidate = discharge_candidate("950.00");
        candidate.signoff = Signoff::default();

        let err = match store.apply_movement(record.id, &candidate) {
            Ok(_) => panic!("candidate without signoff should be rejected"),
            Err(err) => err,
        };
        let AuditError::Validation { reasons } = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(reasons.len(), 2);

        assert_eq!(count_rows(&store, "movements")?, 1);
        let aggregate = store.record_aggregate("AIH-000001")?;
        assert_eq!(aggregate.record.status, RecordStatus::ActiveDiscussion);
        Ok(())
    }

    #[test]
    fn movement_on_unknown_record_is_not_found() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let err = match store.apply_movement(RecordId(999), &discharge_candidate("1.00")) {
            Ok(_) => panic!("unknown record should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn intake_after_discharge_is_legal_again() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        store.apply_movement(record.id, &discharge_candidate("950.00"))?;

        let mut intake = discharge_candidate("950.00");
        intake.kind = MovementKind::Intake;
        intake.asserted_status = RecordStatus::ActiveDiscussion;
        let applied = store.apply_movement(record.id, &intake)?;
        assert_eq!(applied.record.status, RecordStatus::ActiveDiscussion);
        Ok(())
    }

    #[test]
    fn duplicate_denial_lines_across_professionals_are_valid() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;

        store.add_denial(record.id, &fixture_denial_draft("N1"))?;
        store.add_denial(record.id, &fixture_denial_draft("N2"))?;

        let active = store.list_active_denials(record.id)?;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].line_code, active[1].line_code);
        assert!(active[0].id < active[1].id);
        Ok(())
    }

    #[test]
    fn removed_denial_is_kept_but_inactive() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        let denial = store.add_denial(record.id, &fixture_denial_draft("N1"))?;

        let removed = store.remove_denial(denial.id)?;
        assert!(!removed.active);
        assert!(store.list_active_denials(record.id)?.is_empty());
        assert_eq!(count_rows(&store, "denials")?, 1);
        Ok(())
    }

    #[test]
    fn removing_unknown_denial_is_not_found() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let err = match store.remove_denial(DenialId(404)) {
            Ok(_) => panic!("unknown denial should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn denials_never_touch_record_status_or_value() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        store.add_denial(record.id, &fixture_denial_draft("N1"))?;

        let aggregate = store.record_aggregate("AIH-000001")?;
        assert_eq!(aggregate.record.status, RecordStatus::ActiveDiscussion);
        assert_eq!(aggregate.record.current_value, record.initial_value);
        Ok(())
    }

    #[test]
    fn eligibility_requires_age_and_terminal_status() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;

        let aged_final = store.create_record(&fixture_draft("AIH-000001"))?;
        backdate_record(&store, aged_final.id, 4)?;
        set_record_status(&store, aged_final.id, RecordStatus::FinalizedDirect)?;

        let aged_active = store.create_record(&fixture_draft("AIH-000002"))?;
        backdate_record(&store, aged_active.id, 4)?;
        set_record_status(&store, aged_active.id, RecordStatus::ActiveIndirect)?;

        let fresh_final = store.create_record(&fixture_draft("AIH-000003"))?;
        set_record_status(&store, fresh_final.id, RecordStatus::FinalizedAfterDiscussion)?;

        let eligible = store.eligible_record_ids(retention_cutoff(OffsetDateTime::now_utc()))?;
        assert_eq!(eligible, vec![aged_final.id]);
        Ok(())
    }

    #[test]
    fn migration_statement_list_moves_a_record_to_the_archive() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        store.apply_movement(record.id, &discharge_candidate("950.00"))?;
        let denial = store.add_denial(record.id, &fixture_denial_draft("N1"))?;
        store.remove_denial(denial.id)?;

        let before = store.record_aggregate("AIH-000001")?;
        migrate_record(&mut store, record.id)?;

        assert_eq!(count_rows(&store, "records")?, 0);
        assert_eq!(count_rows(&store, "movements")?, 0);
        assert_eq!(count_rows(&store, "denials")?, 0);
        assert_eq!(count_rows(&store, "service_encounters")?, 0);

        let archived = store.lookup_archived("AIH-000001")?;
        assert!(archived.is_archived);
        assert_eq!(archived.record, before.record);
        assert_eq!(archived.movements, before.movements);
        assert_eq!(archived.denials, before.denials);
        assert_eq!(archived.encounter_numbers, before.encounter_numbers);

        let err = match store.record_aggregate("AIH-000001") {
            Ok(_) => panic!("archived record must be gone from live storage"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn failing_statement_rolls_back_the_whole_migration() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        store.apply_movement(record.id, &discharge_candidate("950.00"))?;
        store.add_denial(record.id, &fixture_denial_draft("N1"))?;

        let bundle = store.fetch_bundle(record.id)?;
        let mut statements = build_record_migration(&bundle, OffsetDateTime::now_utc())?;
        // A second insert of the archive record row violates its primary key
        // partway through the list and must take the earlier statements down
        // with it.
        if let Some(first) = statements.first().cloned() {
            statements.insert(2, first);
        }

        let err = match store.apply_statements(&statements) {
            Ok(()) => panic!("duplicated archive insert should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Transaction(_)));

        assert_eq!(count_rows(&store, "records")?, 1);
        assert_eq!(count_rows(&store, "movements")?, 2);
        assert_eq!(count_rows(&store, "denials")?, 1);
        assert_eq!(count_rows(&store, "archive_records")?, 0);
        assert_eq!(count_rows(&store, "archive_movements")?, 0);
        Ok(())
    }

    #[test]
    fn archived_record_is_no_longer_eligible() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        backdate_record(&store, record.id, 4)?;
        set_record_status(&store, record.id, RecordStatus::FinalizedDirect)?;

        let cutoff = retention_cutoff(OffsetDateTime::now_utc());
        assert_eq!(store.eligible_record_ids(cutoff)?, vec![record.id]);

        migrate_record(&mut store, record.id)?;
        assert!(store.eligible_record_ids(cutoff)?.is_empty());
        Ok(())
    }

    #[test]
    fn lookup_archived_unknown_number_is_not_found() -> Result<(), AuditError> {
        let store = open_memory_store()?;
        let err = match store.lookup_archived("AIH-999999") {
            Ok(_) => panic!("unknown archived number should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn aggregate_cache_serves_repeat_lookups_and_honors_invalidation(
    ) -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;

        let first = store.record_aggregate("AIH-000001")?;
        assert_eq!(store.aggregate_cache.len(), 1);

        // A movement behind the cache's back would go stale without the hook.
        store.apply_movement(record.id, &discharge_candidate("950.00"))?;
        let second = store.record_aggregate("AIH-000001")?;
        assert_eq!(first.movements.len() + 1, second.movements.len());

        store.record_aggregate("AIH-000001")?;
        store.invalidate_cache(CACHE_TAG_RECORDS);
        assert!(store.aggregate_cache.is_empty());
        Ok(())
    }

    #[test]
    fn reclaim_space_runs_after_bulk_deletes() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        let record = store.create_record(&fixture_draft("AIH-000001"))?;
        migrate_record(&mut store, record.id)?;
        store.reclaim_space()?;
        assert_eq!(count_rows(&store, "archive_records")?, 1);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_healthy_database() -> Result<(), AuditError> {
        let mut store = open_memory_store()?;
        store.create_record(&fixture_draft("AIH-000001"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn backup_and_restore_round_trip() -> Result<(), AuditError> {
        let dir = tempfile::tempdir().map_err(AuditError::unavailable)?;
        let db_path = dir.path().join("claim_audit.sqlite3");
        let backup_path = dir.path().join("backups/claim_audit.backup");

        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.create_record(&fixture_draft("AIH-000001"))?;
            store.backup_database(&backup_path)?;
            store.create_record(&fixture_draft("AIH-000002"))?;
            store.restore_database(&backup_path)?;

            assert_eq!(store.list_records()?.len(), 1);
            assert!(store.record_aggregate("AIH-000001").is_ok());
        }
        Ok(())
    }
}
