use crate::config::DatabaseConfig;
use crate::memory_store::MemoryRecordStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// URL scheme that selects the in-process store instead of PostgreSQL
pub const MEMORY_URL_SCHEME: &str = "memory://";

/// Record store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            _ => StoreError::Persistence(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Triage status of a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportStatus {
    #[default]
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "pending_sync")]
    PendingSync,
    #[serde(rename = "online")]
    Online,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 5] = [
        ReportStatus::Pending,
        ReportStatus::InProgress,
        ReportStatus::Completed,
        ReportStatus::PendingSync,
        ReportStatus::Online,
    ];

    /// Wire and column spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::InProgress => "in-progress",
            ReportStatus::Completed => "completed",
            ReportStatus::PendingSync => "pending_sync",
            ReportStatus::Online => "online",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status value outside the enumeration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status '{0}'")]
pub struct InvalidStatus(pub String);

impl FromStr for ReportStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ReportStatus::Pending),
            "in-progress" => Ok(ReportStatus::InProgress),
            "completed" => Ok(ReportStatus::Completed),
            "pending_sync" | "pending-sync" => Ok(ReportStatus::PendingSync),
            "online" => Ok(ReportStatus::Online),
            _ => Err(InvalidStatus(s.to_string())),
        }
    }
}

/// Stored staff credential
#[derive(Debug, Clone, FromRow)]
pub struct StaffCredential {
    pub id: i64,
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Stored problem report
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemReport {
    /// Monotonically increasing report ID
    pub id: i64,
    /// Room or location the report is about
    pub room_id: String,
    pub category: Option<String>,
    pub user_name: Option<String>,
    /// Reporter's role tag (student, staff, visitor, ...)
    pub user_status: Option<String>,
    pub user_phone: Option<String>,
    pub user_email: Option<String>,
    pub problem_desc: Option<String>,
    /// Retrieval path of the attachment, `/uploads/<name>`
    pub img_path: Option<String>,
    pub status: ReportStatus,
    /// Correlation token chosen by the reporter's client
    pub reporter_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProblemReport {
    /// Overwrite the fields present in `patch`, leaving the rest untouched
    pub fn apply(&mut self, patch: &ReportPatch) {
        if let Some(room_id) = &patch.room_id {
            self.room_id = room_id.clone();
        }
        for (slot, value) in [
            (&mut self.category, &patch.category),
            (&mut self.user_name, &patch.user_name),
            (&mut self.user_status, &patch.user_status),
            (&mut self.user_phone, &patch.user_phone),
            (&mut self.user_email, &patch.user_email),
            (&mut self.problem_desc, &patch.problem_desc),
        ] {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(img_path) = &patch.img_path {
            self.img_path = Some(img_path.clone());
        }
    }
}

/// A report about to be inserted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewReport {
    pub room_id: String,
    pub category: Option<String>,
    pub user_name: Option<String>,
    pub user_status: Option<String>,
    pub user_phone: Option<String>,
    pub user_email: Option<String>,
    pub problem_desc: Option<String>,
    pub img_path: Option<String>,
    pub status: ReportStatus,
    pub reporter_token: Option<String>,
}

/// Partial update of a report.
///
/// `None` leaves a field untouched. For nullable columns `Some(None)` clears
/// the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPatch {
    pub room_id: Option<String>,
    pub category: Option<Option<String>>,
    pub user_name: Option<Option<String>>,
    pub user_status: Option<Option<String>>,
    pub user_phone: Option<Option<String>>,
    pub user_email: Option<Option<String>>,
    pub problem_desc: Option<Option<String>>,
    pub status: Option<ReportStatus>,
    pub img_path: Option<String>,
}

impl ReportPatch {
    /// Column assignments in a stable order, values rendered as text
    fn assignments(&self) -> Vec<(&'static str, Option<String>)> {
        let mut out = Vec::new();
        if let Some(room_id) = &self.room_id {
            out.push(("room_id", Some(room_id.clone())));
        }
        for (column, value) in [
            ("category", &self.category),
            ("user_name", &self.user_name),
            ("user_status", &self.user_status),
            ("user_phone", &self.user_phone),
            ("user_email", &self.user_email),
            ("problem_desc", &self.problem_desc),
        ] {
            if let Some(value) = value {
                out.push((column, value.clone()));
            }
        }
        if let Some(status) = self.status {
            out.push(("status", Some(status.as_str().to_string())));
        }
        if let Some(img_path) = &self.img_path {
            out.push(("img_path", Some(img_path.clone())));
        }
        out
    }
}

/// A committed report update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedReport {
    pub report: ProblemReport,
    /// Attachment the row pointed at right before this update
    pub previous_img_path: Option<String>,
}

/// Persistence contract for staff credentials and problem reports
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Cheap connectivity check
    async fn ping(&self) -> StoreResult<()>;

    /// Whether any staff credential exists
    async fn has_staff(&self) -> StoreResult<bool>;

    async fn find_staff_by_username(&self, username: &str)
        -> StoreResult<Option<StaffCredential>>;

    async fn find_staff_by_id(&self, id: i64) -> StoreResult<Option<StaffCredential>>;

    async fn insert_staff(&self, username: &str, password_hash: &str)
        -> StoreResult<StaffCredential>;

    async fn insert_report(&self, report: NewReport) -> StoreResult<ProblemReport>;

    async fn get_report(&self, id: i64) -> StoreResult<Option<ProblemReport>>;

    /// All reports, newest first
    async fn list_reports(&self) -> StoreResult<Vec<ProblemReport>>;

    /// Apply `patch` and refresh `updated_at` atomically.
    ///
    /// The previous attachment path is read under the same row lock as the
    /// write, so concurrent updates each see the value they replaced.
    async fn update_report(&self, id: i64, patch: &ReportPatch) -> StoreResult<UpdatedReport>;

    /// Remove a report, returning what was removed
    async fn delete_report(&self, id: i64) -> StoreResult<ProblemReport>;
}

/// Open the record store named by `config.url`
pub async fn open(config: &DatabaseConfig) -> Result<Arc<dyn RecordStore>> {
    if config.url.starts_with(MEMORY_URL_SCHEME) {
        info!("Using in-memory record store");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }

    let store = PgRecordStore::new(config).await?;
    if config.run_migrations {
        store.run_migrations().await?;
    }
    Ok(Arc::new(store))
}

const REPORT_COLUMNS: &str = "id, room_id, category, user_name, user_status, user_phone, \
     user_email, problem_desc, img_path, status, reporter_token, created_at, updated_at";

/// Partial update that locks the row, rewrites the assigned columns and
/// returns the new row plus the attachment path it replaced.
///
/// `$1` is the report id, assignment values follow in order.
fn update_statement(columns: &[&str]) -> String {
    let mut sql = String::from(
        "WITH old AS (SELECT id, img_path FROM problems WHERE id = $1 FOR UPDATE) \
         UPDATE problems SET updated_at = NOW()",
    );
    for (param, column) in columns.iter().enumerate() {
        sql.push_str(&format!(", {} = ${}", column, param + 2));
    }

    let returning = REPORT_COLUMNS
        .split(',')
        .map(|column| format!("problems.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(
        " FROM old WHERE problems.id = old.id \
         RETURNING {returning}, old.img_path AS previous_img_path"
    ));
    sql
}

/// Row shape of the `problems` table
#[derive(Debug, FromRow)]
struct ReportRow {
    id: i64,
    room_id: String,
    category: Option<String>,
    user_name: Option<String>,
    user_status: Option<String>,
    user_phone: Option<String>,
    user_email: Option<String>,
    problem_desc: Option<String>,
    img_path: Option<String>,
    status: String,
    reporter_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct UpdatedRow {
    #[sqlx(flatten)]
    report: ReportRow,
    previous_img_path: Option<String>,
}

impl TryFrom<ReportRow> for ProblemReport {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> StoreResult<Self> {
        let status = row.status.parse().map_err(|e: InvalidStatus| {
            StoreError::Persistence(format!("report {}: {}", row.id, e))
        })?;

        Ok(Self {
            id: row.id,
            room_id: row.room_id,
            category: row.category,
            user_name: row.user_name,
            user_status: row.user_status,
            user_phone: row.user_phone,
            user_email: row.user_email,
            problem_desc: row.problem_desc,
            img_path: row.img_path,
            status,
            reporter_token: row.reporter_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn has_staff(&self) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM admins)")
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn find_staff_by_username(
        &self,
        username: &str,
    ) -> StoreResult<Option<StaffCredential>> {
        let staff = sqlx::query_as::<_, StaffCredential>(
            "SELECT id, username, password_hash, created_at FROM admins WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(staff)
    }

    async fn find_staff_by_id(&self, id: i64) -> StoreResult<Option<StaffCredential>> {
        let staff = sqlx::query_as::<_, StaffCredential>(
            "SELECT id, username, password_hash, created_at FROM admins WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(staff)
    }

    #[instrument(skip(self, password_hash))]
    async fn insert_staff(
        &self,
        username: &str,
        password_hash: &str,
    ) -> StoreResult<StaffCredential> {
        let staff = sqlx::query_as::<_, StaffCredential>(
            r#"
            INSERT INTO admins (username, password_hash, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id, username, password_hash, created_at
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(staff)
    }

    #[instrument(skip(self, report), fields(room_id = %report.room_id))]
    async fn insert_report(&self, report: NewReport) -> StoreResult<ProblemReport> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ReportRow>(&format!(
            r#"
            INSERT INTO problems (
                room_id, category, user_name, user_status, user_phone,
                user_email, problem_desc, img_path, status, reporter_token,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                NOW(), NOW()
            )
            RETURNING {REPORT_COLUMNS}
            "#
        ))
        .bind(&report.room_id)
        .bind(&report.category)
        .bind(&report.user_name)
        .bind(&report.user_status)
        .bind(&report.user_phone)
        .bind(&report.user_email)
        .bind(&report.problem_desc)
        .bind(&report.img_path)
        .bind(report.status.as_str())
        .bind(&report.reporter_token)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(report_id = row.id, "Report inserted");
        row.try_into()
    }

    async fn get_report(&self, id: i64) -> StoreResult<Option<ProblemReport>> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM problems WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProblemReport::try_from).transpose()
    }

    async fn list_reports(&self) -> StoreResult<Vec<ProblemReport>> {
        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM problems ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProblemReport::try_from).collect()
    }

    #[instrument(skip(self, patch))]
    async fn update_report(&self, id: i64, patch: &ReportPatch) -> StoreResult<UpdatedReport> {
        let assignments = patch.assignments();
        let columns: Vec<_> = assignments.iter().map(|(column, _)| *column).collect();
        let sql = update_statement(&columns);

        // Dropping the transaction without commit rolls every assignment back
        let mut tx = self.pool.begin().await?;

        let mut query = sqlx::query_as::<_, UpdatedRow>(&sql).bind(id);
        for (_, value) in assignments {
            query = query.bind(value);
        }
        let updated = query
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;

        tx.commit().await?;

        debug!(report_id = id, "Report updated");
        Ok(UpdatedReport {
            report: updated.report.try_into()?,
            previous_img_path: updated.previous_img_path,
        })
    }

    #[instrument(skip(self))]
    async fn delete_report(&self, id: i64) -> StoreResult<ProblemReport> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "DELETE FROM problems WHERE id = $1 RETURNING {REPORT_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        debug!(report_id = id, "Report deleted");
        row.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> ProblemReport {
        let now = Utc::now();
        ProblemReport {
            id: 7,
            room_id: "A101".to_string(),
            category: Some("plumbing".to_string()),
            user_name: Some("Tee".to_string()),
            user_status: Some("student".to_string()),
            user_phone: Some("0812345678".to_string()),
            user_email: None,
            problem_desc: Some("leak".to_string()),
            img_path: None,
            status: ReportStatus::Pending,
            reporter_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_parse_accepts_enumeration() {
        for status in ReportStatus::ALL {
            assert_eq!(status.as_str().parse::<ReportStatus>(), Ok(status));
        }
        assert_eq!("pending-sync".parse(), Ok(ReportStatus::PendingSync));
        assert_eq!(" Completed ".parse(), Ok(ReportStatus::Completed));
        assert_eq!(
            "done".parse::<ReportStatus>(),
            Err(InvalidStatus("done".to_string()))
        );
    }

    #[test]
    fn test_status_serializes_wire_names() {
        let json = serde_json::to_string(&ReportStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        assert_eq!(ReportStatus::default(), ReportStatus::Pending);
    }

    #[test]
    fn test_apply_only_touches_present_fields() {
        let mut report = sample_report();
        let before = report.clone();

        report.apply(&ReportPatch {
            status: Some(ReportStatus::Completed),
            user_phone: Some(None),
            ..Default::default()
        });

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.user_phone, None);
        assert_eq!(report.room_id, before.room_id);
        assert_eq!(report.category, before.category);
        assert_eq!(report.problem_desc, before.problem_desc);
    }

    #[test]
    fn test_patch_assignments_order_and_values() {
        let patch = ReportPatch {
            room_id: Some("B202".to_string()),
            problem_desc: Some(None),
            status: Some(ReportStatus::InProgress),
            ..Default::default()
        };

        assert_eq!(
            patch.assignments(),
            vec![
                ("room_id", Some("B202".to_string())),
                ("problem_desc", None),
                ("status", Some("in-progress".to_string())),
            ]
        );
    }

    #[test]
    fn test_update_statement_locks_row_and_returns_previous_image() {
        let sql = update_statement(&["status", "img_path"]);

        assert!(sql.starts_with(
            "WITH old AS (SELECT id, img_path FROM problems WHERE id = $1 FOR UPDATE)"
        ));
        assert!(sql.contains("SET updated_at = NOW(), status = $2, img_path = $3 FROM old"));
        assert!(sql.contains("RETURNING problems.id, problems.room_id,"));
        assert!(sql.contains("problems.updated_at, old.img_path AS previous_img_path"));
        assert!(!sql.contains("$4"));
    }

    #[test]
    fn test_row_with_unknown_status_is_rejected() {
        let now = Utc::now();
        let row = ReportRow {
            id: 1,
            room_id: "A101".to_string(),
            category: None,
            user_name: None,
            user_status: None,
            user_phone: None,
            user_email: None,
            problem_desc: None,
            img_path: None,
            status: "archived".to_string(),
            reporter_token: None,
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(
            ProblemReport::try_from(row),
            Err(StoreError::Persistence(_))
        ));
    }
}
