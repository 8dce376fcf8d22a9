//! SQLite database with Diesel ORM
//!
//! Holds the call analysis view, the per-run predictions and the analysis
//! log. `Database` is the pipeline's record store.

use crate::dates::{
    end_exclusive, parse_store_timestamp, start_of_day, to_store_date, to_store_timestamp,
    STORE_DATE_FORMAT,
};
use crate::config::{find_in_ancestors, Config, PROJECT_DIR};
use crate::error::{StoreError, StoreResult};
use crate::gateway::{Connector, RecordStore};
use crate::record::{CallRecord, PredictionRecord, ReconcileSummary, Verdict};
use crate::schema::*;
use chrono::NaiveDate;
use diesel::dsl::sql;
use diesel::expression::SqlLiteral;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "REPEAT_PREDICTOR_DB_PATH";

/// Database file name inside the project directory
pub const DB_FILE: &str = "calls.db";

/// Resolve the database path.
///
/// Order: explicit path, `REPEAT_PREDICTOR_DB_PATH`, `store.database_path`
/// from config, then `.repeat-predictor/calls.db` found by walking up.
pub fn resolve_db_path(explicit: Option<&Path>, config: &Config) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    // Check env var first - takes priority over config
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.store.database_path {
        return path.clone();
    }

    // Walk up directory tree to find the project folder
    if let Some(dir) = find_in_ancestors(Path::new(PROJECT_DIR)) {
        if dir.is_dir() {
            return dir.join(DB_FILE);
        }
    }

    // Nothing found - default to current directory
    // (init will create it here)
    Path::new(PROJECT_DIR).join(DB_FILE)
}

/// Text stored in `call_analysis.repeated`.
pub const REPEATED_YES: &str = "YES";
pub const REPEATED_NO: &str = "NO";

/// Largest number of identifiers bound into one `IN (...)` clause
const LOOKUP_CHUNK: usize = 500;

/// `attend_date_time` as `YYYY-MM-DD HH:MM:SS`.
///
/// `datetime()` folds bare dates and the `T` separator into that form. Text
/// it cannot read is compared as stored, so it still reaches `into_record`.
fn attended_at() -> SqlLiteral<Text> {
    sql::<Text>("coalesce(datetime(attend_date_time), attend_date_time)")
}

// ============================================================================
// Diesel Models
// ============================================================================

/// One row of the call analysis table
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = call_analysis)]
pub struct CallRow {
    pub incident: i64,
    pub attend_date_time: String,
    #[serde(default)]
    pub business_type: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub last_other_call_type: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_day: Option<String>,
    #[serde(default)]
    pub attend_day: Option<String>,
    #[serde(default)]
    pub post_code_area: Option<String>,
    #[serde(default)]
    pub first_engineer: Option<String>,
    #[serde(default)]
    pub symptom_code_id: Option<String>,
    #[serde(default)]
    pub device_age_days: Option<f64>,
    #[serde(default)]
    pub days_since_install: Option<f64>,
    #[serde(default)]
    pub days_since_last_break: Option<f64>,
    #[serde(default)]
    pub days_since_last_other_call: Option<f64>,
    #[serde(default)]
    pub meter_total: Option<f64>,
    #[serde(default)]
    pub meter_since_last_call: Option<f64>,
    #[serde(default)]
    pub repeated: Option<String>,
}

/// Map the stored repeat flag to ground truth
pub fn parse_repeated(value: Option<&str>) -> Option<bool> {
    value.map(|v| v.trim().eq_ignore_ascii_case(REPEATED_YES))
}

pub fn repeated_text(value: Option<bool>) -> Option<String> {
    value.map(|r| if r { REPEATED_YES } else { REPEATED_NO }.to_string())
}

impl CallRow {
    /// Same row with `attend_date_time` rewritten in store format
    pub fn canonical(&self) -> StoreResult<CallRow> {
        let attended = parse_store_timestamp(&self.attend_date_time).map_err(|e| {
            StoreError::Validation(format!("incident {}: {}", self.incident, e))
        })?;
        Ok(CallRow {
            attend_date_time: to_store_timestamp(attended),
            ..self.clone()
        })
    }

    /// Convert to a record in `FeatureSchema::standard()` order
    pub fn into_record(self) -> StoreResult<CallRecord> {
        let attend_at = parse_store_timestamp(&self.attend_date_time).map_err(|e| {
            StoreError::Validation(format!("incident {}: {}", self.incident, e))
        })?;
        let repeated = parse_repeated(self.repeated.as_deref());
        Ok(CallRecord {
            incident: self.incident,
            attend_at,
            categoricals: vec![
                self.business_type,
                self.manufacturer,
                self.product_id,
                self.device_type,
                self.last_other_call_type,
                self.created_by,
                self.created_day,
                self.attend_day,
                self.post_code_area,
                self.first_engineer,
                self.symptom_code_id,
            ],
            numerics: vec![
                self.device_age_days,
                self.days_since_install,
                self.days_since_last_break,
                self.days_since_last_other_call,
                self.meter_total,
                self.meter_since_last_call,
            ],
            repeated,
        })
    }
}

/// Insertable prediction
#[derive(Insertable)]
#[diesel(table_name = call_predictions)]
pub struct NewPrediction<'a> {
    pub prediction_date: &'a str,
    pub incident: i64,
    pub threshold: f64,
    pub predicted: bool,
    pub confidence: f64,
    pub actual: Option<bool>,
    pub correct: Option<&'a str>,
    pub created_at: &'a str,
}

/// Queryable prediction
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = call_predictions)]
pub struct StoredPrediction {
    pub id: i32,
    pub prediction_date: String,
    pub incident: i64,
    pub threshold: f64,
    pub predicted: bool,
    pub confidence: f64,
    pub actual: Option<bool>,
    pub correct: Option<String>,
    pub created_at: String,
}

impl StoredPrediction {
    pub fn into_record(self) -> StoreResult<PredictionRecord> {
        let run_date = NaiveDate::parse_from_str(&self.prediction_date, STORE_DATE_FORMAT)
            .map_err(|e| {
                StoreError::Validation(format!(
                    "prediction {} has bad date '{}': {}",
                    self.id, self.prediction_date, e
                ))
            })?;
        Ok(PredictionRecord {
            run_date,
            incident: self.incident,
            threshold: self.threshold,
            predicted: self.predicted,
            confidence: self.confidence,
            actual: self.actual,
            verdict: self.correct.as_deref().and_then(Verdict::parse),
        })
    }
}

/// Insertable log entry
#[derive(Insertable)]
#[diesel(table_name = call_analysis_log)]
pub struct NewLogEntry<'a> {
    pub logged_at: &'a str,
    pub description: &'a str,
}

/// Queryable log entry
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = call_analysis_log)]
pub struct LogEntry {
    pub id: i32,
    pub logged_at: String,
    pub description: String,
}

/// Predictions stored for one run date
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDateSummary {
    pub run_date: NaiveDate,
    pub predictions: i64,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create (or open) a database at a custom path
    pub fn new(path: &str) -> StoreResult<Self> {
        Self::open_at(path)
    }

    /// Open database at specified path, creating tables as needed
    pub fn open_at<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an existing database; a missing file is a connection failure
    pub fn open_existing<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StoreError::Connection(format!(
                "database not found at {} (run 'repeat-predictor init' first)",
                path.display()
            )));
        }
        Self::open_at(path)
    }

    fn get_conn(&self) -> StoreResult<DbConn> {
        self.pool.get().map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let mut conn = self.get_conn()?;

        // Run raw SQL to create tables if they don't exist
        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS call_analysis (
                incident BIGINT PRIMARY KEY NOT NULL,
                attend_date_time TEXT NOT NULL,
                business_type TEXT,
                manufacturer TEXT,
                product_id TEXT,
                device_type TEXT,
                last_other_call_type TEXT,
                created_by TEXT,
                created_day TEXT,
                attend_day TEXT,
                post_code_area TEXT,
                first_engineer TEXT,
                symptom_code_id TEXT,
                device_age_days REAL,
                days_since_install REAL,
                days_since_last_break REAL,
                days_since_last_other_call REAL,
                meter_total REAL,
                meter_since_last_call REAL,
                repeated TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS call_predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                prediction_date TEXT NOT NULL,
                incident BIGINT NOT NULL,
                threshold REAL NOT NULL,
                predicted BOOLEAN NOT NULL,
                confidence REAL NOT NULL,
                actual BOOLEAN,
                correct TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS call_analysis_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                logged_at TEXT NOT NULL,
                description TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        // Create indexes
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_calls_attended ON call_analysis(attend_date_time)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_predictions_date ON call_predictions(prediction_date)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_predictions_incident ON call_predictions(incident)").execute(&mut conn)?;

        Ok(())
    }

    // ========================================================================
    // Call Operations
    // ========================================================================

    /// Insert or replace call rows by incident. Returns rows written.
    ///
    /// Attend times are stored in canonical form; a row whose attend time
    /// cannot be parsed fails the whole batch.
    pub fn upsert_calls(&self, rows: &[CallRow]) -> StoreResult<usize> {
        let rows = rows
            .iter()
            .map(CallRow::canonical)
            .collect::<StoreResult<Vec<_>>>()?;
        let mut conn = self.get_conn()?;
        let written = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut written = 0;
            for row in &rows {
                written += diesel::replace_into(call_analysis::table)
                    .values(row)
                    .execute(conn)?;
            }
            Ok(written)
        })?;
        Ok(written)
    }

    pub fn call_count(&self) -> StoreResult<i64> {
        let mut conn = self.get_conn()?;
        let count = call_analysis::table.count().get_result(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Prediction Queries
    // ========================================================================

    /// Predictions stored for `run_date`, in incident order
    pub fn get_predictions(&self, run_date: NaiveDate) -> StoreResult<Vec<PredictionRecord>> {
        let mut conn = self.get_conn()?;
        call_predictions::table
            .filter(call_predictions::prediction_date.eq(to_store_date(run_date)))
            .order(call_predictions::incident.asc())
            .select(StoredPrediction::as_select())
            .load(&mut conn)?
            .into_iter()
            .map(StoredPrediction::into_record)
            .collect()
    }

    /// Every run date with stored predictions, newest first
    pub fn run_dates(&self) -> StoreResult<Vec<RunDateSummary>> {
        let mut conn = self.get_conn()?;
        let rows: Vec<(String, i64)> = call_predictions::table
            .group_by(call_predictions::prediction_date)
            .select((call_predictions::prediction_date, diesel::dsl::count_star()))
            .order(call_predictions::prediction_date.desc())
            .load(&mut conn)?;
        rows.into_iter()
            .map(|(date, predictions)| {
                NaiveDate::parse_from_str(&date, STORE_DATE_FORMAT)
                    .map(|run_date| RunDateSummary { run_date, predictions })
                    .map_err(|e| StoreError::Validation(format!("bad run date '{}': {}", date, e)))
            })
            .collect()
    }

    /// Most recent analysis log entries
    pub fn recent_log_entries(&self, limit: i64) -> StoreResult<Vec<LogEntry>> {
        let mut conn = self.get_conn()?;
        let entries = call_analysis_log::table
            .order(call_analysis_log::id.desc())
            .limit(limit)
            .select(LogEntry::as_select())
            .load(&mut conn)?;
        Ok(entries)
    }
}

fn insert_prediction_row(conn: &mut SqliteConnection, record: &PredictionRecord, now: &str) -> QueryResult<usize> {
    let date = to_store_date(record.run_date);
    let row = NewPrediction {
        prediction_date: &date,
        incident: record.incident,
        threshold: record.threshold,
        predicted: record.predicted,
        confidence: record.confidence,
        actual: record.actual,
        correct: record.verdict.map(|v| v.as_str()),
        created_at: now,
    };
    diesel::insert_into(call_predictions::table)
        .values(&row)
        .execute(conn)
}

impl RecordStore for Database {
    fn fetch_records(&self, start: NaiveDate, end: NaiveDate) -> StoreResult<Vec<CallRecord>> {
        let mut conn = self.get_conn()?;
        let from = to_store_timestamp(start_of_day(start));
        let until = to_store_timestamp(end_exclusive(end));
        let rows = call_analysis::table
            .filter(attended_at().ge(from))
            .filter(attended_at().lt(until))
            .order(call_analysis::incident.asc())
            .select(CallRow::as_select())
            .load(&mut conn)?;
        rows.into_iter().map(CallRow::into_record).collect()
    }

    fn fetch_min_identifier(&self, since: NaiveDate) -> StoreResult<Option<i64>> {
        let mut conn = self.get_conn()?;
        let min = call_analysis::table
            .filter(attended_at().ge(to_store_timestamp(start_of_day(since))))
            .select(diesel::dsl::min(call_analysis::incident))
            .first::<Option<i64>>(&mut conn)?;
        Ok(min)
    }

    fn purge_predictions(&self, run_date: NaiveDate) -> StoreResult<usize> {
        let mut conn = self.get_conn()?;
        let removed = diesel::delete(
            call_predictions::table
                .filter(call_predictions::prediction_date.eq(to_store_date(run_date))),
        )
        .execute(&mut conn)?;
        Ok(removed)
    }

    fn insert_prediction(&self, record: &PredictionRecord) -> StoreResult<()> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        insert_prediction_row(&mut conn, record, &now)?;
        Ok(())
    }

    fn insert_predictions(&self, records: &[PredictionRecord]) -> StoreResult<usize> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        let written = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut written = 0;
            for record in records {
                written += insert_prediction_row(conn, record, &now)?;
            }
            Ok(written)
        })?;
        Ok(written)
    }

    fn update_actual_and_correctness(&self, run_date: NaiveDate) -> StoreResult<ReconcileSummary> {
        let mut conn = self.get_conn()?;
        let date = to_store_date(run_date);

        let summary = conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let predictions: Vec<(i32, i64, bool)> = call_predictions::table
                .filter(call_predictions::prediction_date.eq(&date))
                .select((
                    call_predictions::id,
                    call_predictions::incident,
                    call_predictions::predicted,
                ))
                .load(conn)?;

            let incidents: Vec<i64> = predictions.iter().map(|(_, incident, _)| *incident).collect();
            let mut outcomes: HashMap<i64, Option<bool>> = HashMap::with_capacity(incidents.len());
            for chunk in incidents.chunks(LOOKUP_CHUNK) {
                let rows: Vec<(i64, Option<String>)> = call_analysis::table
                    .filter(call_analysis::incident.eq_any(chunk))
                    .select((call_analysis::incident, call_analysis::repeated))
                    .load(conn)?;
                for (incident, repeated) in rows {
                    outcomes.insert(incident, parse_repeated(repeated.as_deref()));
                }
            }

            let mut summary = ReconcileSummary::default();
            for (id, incident, predicted) in predictions {
                let actual = outcomes.get(&incident).copied().flatten();
                let verdict = Verdict::judge(predicted, actual);
                diesel::update(call_predictions::table.filter(call_predictions::id.eq(id)))
                    .set((
                        call_predictions::actual.eq(actual),
                        call_predictions::correct.eq(verdict.as_str()),
                    ))
                    .execute(conn)?;
                summary.add(verdict);
            }
            Ok(summary)
        })?;

        Ok(summary)
    }

    fn append_log_entry(&self, message: &str) -> StoreResult<()> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();
        diesel::insert_into(call_analysis_log::table)
            .values(&NewLogEntry {
                logged_at: &now,
                description: message,
            })
            .execute(&mut conn)?;
        Ok(())
    }
}

/// Connection settings for the call database.
///
/// SQLite does not authenticate, so the credentials only identify the
/// analyst in the analysis log.
#[derive(Clone)]
pub struct ConnectOptions {
    pub database_path: PathBuf,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("database_path", &self.database_path)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl Connector for ConnectOptions {
    type Store = Database;

    fn connect(&self) -> StoreResult<Database> {
        let db = Database::open_existing(&self.database_path)?;
        tracing::debug!(path = %self.database_path.display(), user = %self.username, "connected");
        Ok(db)
    }
}
