//! Import call records from JSON
//!
//! Accepts a JSON array of call analysis rows (the same snake_case columns as
//! the `call_analysis` table) and upserts them by incident. Re-importing a
//! call is how late-arriving repeat outcomes reach the store.

use std::collections::HashSet;
use std::path::Path;

use crate::dates::parse_store_timestamp;
use crate::db::{CallRow, Database, REPEATED_NO, REPEATED_YES};
use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid call record: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts from one import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub read: usize,
    pub written: usize,
    pub with_outcome: usize,
}

/// Parse a JSON array of call rows from `path`
pub fn read_calls(path: &Path) -> Result<Vec<CallRow>, ImportError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ImportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ImportError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Reject rows the pipeline could not use.
///
/// Timestamps are normalised to the stored `YYYY-MM-DD HH:MM:SS` form and
/// repeat flags to upper case.
pub fn normalise_calls(rows: &mut [CallRow]) -> Result<(), ImportError> {
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows.iter_mut() {
        if !seen.insert(row.incident) {
            return Err(ImportError::Invalid(format!(
                "incident {} appears more than once",
                row.incident
            )));
        }

        let attended = parse_store_timestamp(&row.attend_date_time)
            .map_err(|e| ImportError::Invalid(format!("incident {}: {}", row.incident, e)))?;
        row.attend_date_time = crate::dates::to_store_timestamp(attended);

        if let Some(flag) = row.repeated.take() {
            let flag = flag.trim().to_ascii_uppercase();
            if flag != REPEATED_YES && flag != REPEATED_NO {
                return Err(ImportError::Invalid(format!(
                    "incident {}: repeated must be {} or {}, got '{}'",
                    row.incident, REPEATED_YES, REPEATED_NO, flag
                )));
            }
            row.repeated = Some(flag);
        }
    }
    Ok(())
}

/// Read, check and upsert the calls in `path`
pub fn import_calls(db: &Database, path: &Path) -> Result<ImportSummary, ImportError> {
    let mut rows = read_calls(path)?;
    normalise_calls(&mut rows)?;
    let with_outcome = rows.iter().filter(|r| r.repeated.is_some()).count();
    let written = db.upsert_calls(&rows)?;
    tracing::info!(read = rows.len(), written, with_outcome, "imported calls");
    Ok(ImportSummary {
        read: rows.len(),
        written,
        with_outcome,
    })
}
