use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Duration, OffsetDateTime};

/// Records older than this (with a terminal status) become archival-eligible.
pub const RETENTION_YEARS: i32 = 3;

/// Upper bound on records handled between batch boundaries of an archival pass.
pub const ARCHIVE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("validation failed: {}", .reasons.join("; "))]
    Validation { reasons: Vec<String> },
    #[error("movement out of sequence: expected {expected}, got {got}")]
    Sequence {
        expected: MovementKind,
        got: MovementKind,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transaction aborted: {0}")]
    Transaction(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl AuditError {
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    #[must_use]
    pub fn transaction(detail: impl Display) -> Self {
        Self::Transaction(detail.to_string())
    }

    #[must_use]
    pub fn unavailable(detail: impl Display) -> Self {
        Self::Unavailable(detail.to_string())
    }

    /// Whether the caller may retry the same call without re-deriving state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MovementId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DenialId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EncounterId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for MovementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for DenialId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for EncounterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monetary value in cents. Serialized as its decimal string form ("950.00").
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Money(i64);

impl Money {
    #[must_use]
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    #[must_use]
    pub fn cents(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Parse a decimal amount with at most two fraction digits.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let (sign, magnitude) = match trimmed.strip_prefix('-') {
            Some(rest) => (-1_i64, rest),
            None => (1_i64, trimmed),
        };

        let (whole, fraction) = match magnitude.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (magnitude, ""),
        };

        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        if fraction.len() > 2 || !fraction.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }

        let whole_cents = if whole.is_empty() {
            0
        } else {
            whole.parse::<i64>().ok()?.checked_mul(100)?
        };
        let fraction_cents = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().ok()? * 10,
            _ => fraction.parse::<i64>().ok()?,
        };

        Some(Self(sign * (whole_cents + fraction_cents)))
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid monetary value: {raw}")))
    }
}

/// Year-month billing period. Serialized as "MM/YYYY".
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Competence {
    month: u8,
    year: u16,
}

impl Competence {
    #[must_use]
    pub fn new(month: u8, year: u16) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { month, year })
        } else {
            None
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (month_raw, year_raw) = value.trim().split_once('/')?;
        if month_raw.len() != 2 || year_raw.len() != 4 {
            return None;
        }
        let month = month_raw.parse::<u8>().ok()?;
        let year = year_raw.parse::<u16>().ok()?;
        Self::new(month, year)
    }

    #[must_use]
    pub fn month(self) -> u8 {
        self.month
    }

    #[must_use]
    pub fn year(self) -> u16 {
        self.year
    }
}

impl Display for Competence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

impl Serialize for Competence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Competence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid competence: {raw}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    FinalizedDirect,
    ActiveIndirect,
    ActiveDiscussion,
    FinalizedAfterDiscussion,
}

impl RecordStatus {
    /// Numeric code persisted by the store.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::FinalizedDirect => 1,
            Self::ActiveIndirect => 2,
            Self::ActiveDiscussion => 3,
            Self::FinalizedAfterDiscussion => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::FinalizedDirect),
            2 => Some(Self::ActiveIndirect),
            3 => Some(Self::ActiveDiscussion),
            4 => Some(Self::FinalizedAfterDiscussion),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinalizedDirect => "finalized_direct",
            Self::ActiveIndirect => "active_indirect",
            Self::ActiveDiscussion => "active_discussion",
            Self::FinalizedAfterDiscussion => "finalized_after_discussion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "finalized_direct" => Some(Self::FinalizedDirect),
            "active_indirect" => Some(Self::ActiveIndirect),
            "active_discussion" => Some(Self::ActiveDiscussion),
            "finalized_after_discussion" => Some(Self::FinalizedAfterDiscussion),
            _ => None,
        }
    }

    /// Terminal statuses are the only ones eligible for archival.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinalizedDirect | Self::FinalizedAfterDiscussion)
    }
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Intake,
    Discharge,
}

impl MovementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Discharge => "discharge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intake" => Some(Self::Intake),
            "discharge" => Some(Self::Discharge),
            _ => None,
        }
    }

    /// The single transition rule of the audit workflow: no movement yet or a
    /// discharge allows an intake next; an intake allows a discharge next.
    #[must_use]
    pub fn next_allowed(latest: Option<Self>) -> Self {
        match latest {
            None | Some(Self::Discharge) => Self::Intake,
            Some(Self::Intake) => Self::Discharge,
        }
    }
}

impl Display for MovementKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Professional signatures attached to one movement. All fields are optional in
/// the model; which combinations are acceptable is decided by [`Signoff::violations`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signoff {
    pub medicine: Option<String>,
    pub nursing: Option<String>,
    pub physiotherapy: Option<String>,
    pub maxillofacial: Option<String>,
}

fn filled(field: Option<&str>) -> bool {
    field.is_some_and(|value| !value.trim().is_empty())
}

impl Signoff {
    /// Every signoff rule broken by this combination, in a stable order.
    /// Physiotherapy is always optional and never checked.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !filled(self.nursing.as_deref()) {
            reasons.push("nursing professional MUST be provided".to_string());
        }
        if !filled(self.medicine.as_deref()) && !filled(self.maxillofacial.as_deref()) {
            reasons.push(
                "at least one of medicine or maxillofacial surgery MUST sign".to_string(),
            );
        }
        reasons
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub external_number: String,
    pub initial_value: Money,
    pub current_value: Money,
    pub status: RecordStatus,
    pub competence: Competence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Movement {
    pub id: MovementId,
    pub record_id: RecordId,
    pub kind: MovementKind,
    #[serde(with = "time::serde::rfc3339")]
    pub moved_at: OffsetDateTime,
    pub actor: String,
    pub declared_value: Money,
    pub competence: Competence,
    pub signoff: Signoff,
    pub asserted_status: RecordStatus,
    pub notes: Option<String>,
}

/// A movement as proposed by a caller, before sequencing and persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MovementCandidate {
    pub kind: MovementKind,
    pub actor: String,
    pub declared_value: Money,
    pub competence: Competence,
    pub signoff: Signoff,
    pub asserted_status: RecordStatus,
    pub notes: Option<String>,
}

impl MovementCandidate {
    /// Validate signoff and field rules, collecting ALL violations instead of
    /// failing on the first one.
    ///
    /// # Errors
    /// Returns [`AuditError::Validation`] carrying every broken rule.
    pub fn validate(&self) -> Result<(), AuditError> {
        let mut reasons = self.signoff.violations();
        if self.actor.trim().is_empty() {
            reasons.push("actor MUST be provided".to_string());
        }
        if self.declared_value.is_negative() {
            reasons.push("declared value MUST NOT be negative".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(AuditError::Validation { reasons })
        }
    }
}

/// Input for record creation. The signoff seeds the automatic intake movement
/// and is held to the same rules as any proposed movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordDraft {
    pub external_number: String,
    pub initial_value: Money,
    pub competence: Competence,
    pub created_by: String,
    pub signoff: Signoff,
    #[serde(default)]
    pub encounter_numbers: Vec<String>,
}

impl RecordDraft {
    /// # Errors
    /// Returns [`AuditError::Validation`] carrying every broken rule.
    pub fn validate(&self) -> Result<(), AuditError> {
        let mut reasons = self.signoff.violations();
        if self.external_number.trim().is_empty() {
            reasons.push("external number MUST be provided".to_string());
        }
        if self.created_by.trim().is_empty() {
            reasons.push("creator MUST be provided".to_string());
        }
        if self.initial_value.is_negative() {
            reasons.push("initial value MUST NOT be negative".to_string());
        }
        if self.encounter_numbers.iter().any(|number| number.trim().is_empty()) {
            reasons.push("encounter numbers MUST NOT be blank".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(AuditError::Validation { reasons })
        }
    }
}

/// Input for a new denial line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DenialDraft {
    pub line_code: String,
    pub kind: String,
    pub professional: String,
    pub quantity: u32,
}

impl DenialDraft {
    /// # Errors
    /// Returns [`AuditError::Validation`] carrying every broken rule.
    pub fn validate(&self) -> Result<(), AuditError> {
        let mut reasons = Vec::new();
        if self.line_code.trim().is_empty() {
            reasons.push("line code MUST be provided".to_string());
        }
        if self.kind.trim().is_empty() {
            reasons.push("denial type MUST be provided".to_string());
        }
        if self.professional.trim().is_empty() {
            reasons.push("professional MUST be provided".to_string());
        }
        if self.quantity == 0 {
            reasons.push("quantity MUST be at least 1".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(AuditError::Validation { reasons })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Denial {
    pub id: DenialId,
    pub record_id: RecordId,
    pub line_code: String,
    pub kind: String,
    pub professional: String,
    pub quantity: u32,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEncounter {
    pub id: EncounterId,
    pub record_id: RecordId,
    pub encounter_number: String,
}

/// The lookup shape shared by live and archived records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordAggregate {
    pub record: Record,
    pub movements: Vec<Movement>,
    pub denials: Vec<Denial>,
    pub encounter_numbers: Vec<String>,
    pub is_archived: bool,
}

/// A record plus every dependent row, as fetched for one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBundle {
    pub record: Record,
    pub movements: Vec<Movement>,
    pub denials: Vec<Denial>,
    pub encounters: Vec<ServiceEncounter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedMovement {
    pub movement: Movement,
    pub record: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivePassSummary {
    pub archived: usize,
    pub failed: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub cutoff: OffsetDateTime,
    pub aborted: bool,
}

/// The eligibility cutoff: `now` minus the retention window, in calendar years.
/// Falls back to a day-count shift when the shifted date does not exist
/// (Feb 29 of a leap year).
#[must_use]
pub fn retention_cutoff(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_year(now.year() - RETENTION_YEARS)
        .unwrap_or_else(|_| now - Duration::days(365 * i64::from(RETENTION_YEARS)))
}

/// Format a timestamp the way the store persists it.
///
/// # Errors
/// Returns [`AuditError::Transaction`] when the value cannot be represented
/// as RFC 3339.
pub fn rfc3339(value: OffsetDateTime) -> Result<String, AuditError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AuditError::Transaction(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parse a timestamp persisted by the store.
///
/// # Errors
/// Returns [`AuditError::Transaction`] when the stored text is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, AuditError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|_| AuditError::Transaction(format!("invalid RFC3339 timestamp: {value}")))
}

/// One parameter of a prepared statement, kept store-agnostic so statement
/// lists can be built and inspected without a database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(text) => Self::Text(text),
            None => Self::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), params }
    }
}

/// Build the flat, ordered statement list that migrates one record and all of
/// its dependents into the archive mirror and removes them from live storage.
///
/// Order matters twice over: archive inserts run parent-before-child and live
/// deletes run child-before-parent, so the whole list can execute inside one
/// transaction with foreign keys enforced. Primary keys are carried verbatim.
///
/// # Errors
/// Returns [`AuditError::Transaction`] when a timestamp cannot be formatted.
pub fn build_record_migration(
    bundle: &RecordBundle,
    archived_at: OffsetDateTime,
) -> Result<Vec<SqlStatement>, AuditError> {
    let archived_at_text = rfc3339(archived_at)?;
    let record = &bundle.record;
    let mut statements = Vec::with_capacity(
        5 + bundle.movements.len() + bundle.denials.len() + bundle.encounters.len(),
    );

    statements.push(SqlStatement::new(
        "INSERT INTO archive_records(
            id, external_number, initial_value_cents, current_value_cents,
            status, competence, created_at, created_by, archived_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        vec![
            record.id.0.into(),
            record.external_number.clone().into(),
            record.initial_value.cents().into(),
            record.current_value.cents().into(),
            record.status.code().into(),
            record.competence.to_string().into(),
            rfc3339(record.created_at)?.into(),
            record.created_by.clone().into(),
            archived_at_text.clone().into(),
        ],
    ));

    for movement in &bundle.movements {
        statements.push(SqlStatement::new(
            "INSERT INTO archive_movements(
                id, record_id, kind, moved_at, actor, declared_value_cents, competence,
                medicine_professional, nursing_professional, physiotherapy_professional,
                maxillofacial_professional, asserted_status, notes, archived_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            vec![
                movement.id.0.into(),
                movement.record_id.0.into(),
                movement.kind.as_str().into(),
                rfc3339(movement.moved_at)?.into(),
                movement.actor.clone().into(),
                movement.declared_value.cents().into(),
                movement.competence.to_string().into(),
                movement.signoff.medicine.clone().into(),
                movement.signoff.nursing.clone().into(),
                movement.signoff.physiotherapy.clone().into(),
                movement.signoff.maxillofacial.clone().into(),
                movement.asserted_status.code().into(),
                movement.notes.clone().into(),
                archived_at_text.clone().into(),
            ],
        ));
    }

    for denial in &bundle.denials {
        statements.push(SqlStatement::new(
            "INSERT INTO archive_denials(
                id, record_id, line_code, kind, professional, quantity, active,
                created_at, archived_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            vec![
                denial.id.0.into(),
                denial.record_id.0.into(),
                denial.line_code.clone().into(),
                denial.kind.clone().into(),
                denial.professional.clone().into(),
                i64::from(denial.quantity).into(),
                i64::from(denial.active).into(),
                rfc3339(denial.created_at)?.into(),
                archived_at_text.clone().into(),
            ],
        ));
    }

    for encounter in &bundle.encounters {
        statements.push(SqlStatement::new(
            "INSERT INTO archive_service_encounters(id, record_id, encounter_number, archived_at)
             VALUES (?1, ?2, ?3, ?4)",
            vec![
                encounter.id.0.into(),
                encounter.record_id.0.into(),
                encounter.encounter_number.clone().into(),
                archived_at_text.clone().into(),
            ],
        ));
    }

    for table in ["movements", "denials", "service_encounters"] {
        statements.push(SqlStatement::new(
            format!("DELETE FROM {table} WHERE record_id = ?1"),
            vec![record.id.0.into()],
        ));
    }
    statements.push(SqlStatement::new(
        "DELETE FROM records WHERE id = ?1",
        vec![record.id.0.into()],
    ));

    Ok(statements)
}
