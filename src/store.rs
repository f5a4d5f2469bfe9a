//! Persistent storage collaborator.
//!
//! Sessions, measurements and logged readings are appended as [`Record`]s and
//! read back by series and time range. Nothing in instrument control or sweep
//! sequencing depends on a store; it is only used for bookkeeping and for
//! optional historical reads such as [`crate::instrument::Ppms::temperature_history`].
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`] - process-local, for tests and short scripts
//! - [`CsvStore`] - append-only CSV file (requires the `storage_csv` feature)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AppResult;

/// Series name for session start/end records.
pub const SESSION_SERIES: &str = "session";
/// Series name for measurement start/end records.
pub const MEASUREMENT_SERIES: &str = "measurement";

/// One appended row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// When the record was taken.
    pub timestamp: DateTime<Utc>,
    /// Series the record belongs to, e.g. `ppms.temperature`.
    pub series: String,
    /// Session that produced the record, if any.
    pub session_id: Option<String>,
    /// Numeric value, if the record carries one.
    pub value: Option<f64>,
    /// Free-form text (event name, notes).
    pub text: Option<String>,
}

impl Record {
    /// A numeric reading taken now.
    pub fn reading(series: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            timestamp: Utc::now(),
            series: series.into(),
            session_id: None,
            value,
            text: None,
        }
    }

    /// A text event taken now.
    pub fn event(series: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            series: series.into(),
            session_id: None,
            value: None,
            text: Some(text.into()),
        }
    }

    /// Attribute the record to a session.
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Append-only record storage with time-range reads.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Append one record.
    async fn insert(&self, record: Record) -> AppResult<()>;

    /// Records of `series` with `from <= timestamp <= to`, oldest first.
    async fn query_range(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Record>>;
}

fn select(records: impl IntoIterator<Item = Record>, series: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Record> {
    let mut rows: Vec<Record> = records
        .into_iter()
        .filter(|r| r.series == series && r.timestamp >= from && r.timestamp <= to)
        .collect();
    rows.sort_by_key(|r| r.timestamp);
    rows
}

/// Records kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<Record>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn insert(&self, record: Record) -> AppResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn query_range(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Record>> {
        let records = self.records.read().await;
        Ok(select(records.iter().cloned(), series, from, to))
    }
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;
    use tracing::debug;

    use super::{select, MeasurementStore, Record};
    use crate::error::{AppResult, FlexError};

    /// Records appended to a CSV file, one row per record.
    ///
    /// The file is created with a header row on first insert and never
    /// rewritten. Range queries scan the whole file.
    pub struct CsvStore {
        path: PathBuf,
        lock: Mutex<()>,
    }

    impl CsvStore {
        /// Store records in `path`.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                lock: Mutex::new(()),
            }
        }

        /// File backing this store.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    fn storage_error(path: &Path, e: impl std::fmt::Display) -> FlexError {
        FlexError::Storage(format!("{}: {e}", path.display()))
    }

    fn append_row(path: &Path, record: &Record) -> AppResult<()> {
        let is_new = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| storage_error(path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer.serialize(record).map_err(|e| storage_error(path, e))?;
        writer.flush().map_err(|e| storage_error(path, e))
    }

    fn read_rows(path: &Path) -> AppResult<Vec<Record>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path).map_err(|e| storage_error(path, e))?;
        reader
            .deserialize::<Record>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| storage_error(path, e))
    }

    #[async_trait]
    impl MeasurementStore for CsvStore {
        async fn insert(&self, record: Record) -> AppResult<()> {
            let _guard = self.lock.lock().await;
            let path = self.path.clone();
            let series = record.series.clone();
            tokio::task::spawn_blocking(move || append_row(&path, &record))
                .await
                .map_err(|e| storage_error(&self.path, e))??;
            debug!(path = %self.path.display(), %series, "Record appended");
            Ok(())
        }

        async fn query_range(
            &self,
            series: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> AppResult<Vec<Record>> {
            let _guard = self.lock.lock().await;
            let path = self.path.clone();
            let records = tokio::task::spawn_blocking(move || read_rows(&path))
                .await
                .map_err(|e| storage_error(&self.path, e))??;
            Ok(select(records, series, from, to))
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{MeasurementStore, Record};
    use crate::error::{AppResult, FlexError};

    /// Placeholder used when the `storage_csv` feature is off; every call fails.
    pub struct CsvStore {
        path: PathBuf,
    }

    impl CsvStore {
        /// Store records in `path`.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// File backing this store.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    fn disabled() -> FlexError {
        FlexError::Storage("CSV storage requires the storage_csv feature".to_string())
    }

    #[async_trait]
    impl MeasurementStore for CsvStore {
        async fn insert(&self, _record: Record) -> AppResult<()> {
            Err(disabled())
        }

        async fn query_range(
            &self,
            _series: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> AppResult<Vec<Record>> {
            Err(disabled())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvStore;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvStore;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    async fn fill(store: &dyn MeasurementStore) {
        for (offset, value) in [(20, 4.0), (0, 300.0), (10, 150.0), (30, 2.0)] {
            store
                .insert(Record::reading("ppms.temperature", Some(value)).at(t(offset)))
                .await
                .unwrap();
        }
        store
            .insert(Record::reading("ppms.field", Some(1.0)).at(t(10)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_range_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        fill(&store).await;
        let rows = store
            .query_range("ppms.temperature", t(0), t(20))
            .await
            .unwrap();
        let values: Vec<_> = rows.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![Some(300.0), Some(150.0), Some(4.0)]);
        assert_eq!(store.len().await, 5);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn csv_store_accepts_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(CsvStore::new(dir.path().join("records.csv")));

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let record =
                        Record::reading("ppms.temperature", Some(f64::from(i))).at(t(i64::from(i)));
                    store.insert(record).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let rows = store
            .query_range("ppms.temperature", t(0), t(19))
            .await
            .unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0].value, Some(0.0));
        assert_eq!(rows[19].value, Some(19.0));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn csv_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");

        fill(&CsvStore::new(&path)).await;
        let reopened = CsvStore::new(&path);
        reopened
            .insert(Record::event(SESSION_SERIES, "start").in_session("20250509070008").at(t(5)))
            .await
            .unwrap();

        let rows = reopened
            .query_range("ppms.temperature", t(5), t(30))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value, Some(150.0));

        let sessions = reopened
            .query_range(SESSION_SERIES, t(0), t(0) + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id.as_deref(), Some("20250509070008"));
        assert_eq!(sessions[0].value, None);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn missing_csv_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("absent.csv"));
        assert!(store.query_range("x", t(0), t(1)).await.unwrap().is_empty());
    }
}
