//! Experiment session bookkeeping.
//!
//! A [`SessionContext`] is an ordinary value created by the caller and passed
//! to whatever needs it (sweep coordinator, store writes). There is no
//! process-wide "current session".
//!
//! ```no_run
//! # async fn demo() -> flex_daq::AppResult<()> {
//! use flex_daq::session::SessionContext;
//! use flex_daq::store::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let session = SessionContext::begin("pubudu", "gate sweep at 2 K", &store).await?;
//! let mut measurement = session.measurement("first cooldown");
//! measurement.start(&store).await?;
//! // ... run sweeps ...
//! measurement.finish(&store).await?;
//! session.end(&store).await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Local, Utc};
use tracing::info;

use crate::error::{AppResult, FlexError};
use crate::store::{MeasurementStore, Record, MEASUREMENT_SERIES, SESSION_SERIES};

/// Format of session and measurement ids.
pub const ID_FORMAT: &str = "%Y%m%d%H%M%S";

fn timestamp_id(at: DateTime<Local>) -> String {
    at.format(ID_FORMAT).to_string()
}

/// One experiment session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    id: String,
    user: String,
    notes: Vec<String>,
    started_at: DateTime<Local>,
}

impl SessionContext {
    /// A session starting now, not yet recorded anywhere.
    pub fn new(user: impl Into<String>, notes: impl Into<String>) -> Self {
        let started_at = Local::now();
        let notes = notes.into();
        Self {
            id: timestamp_id(started_at),
            user: user.into(),
            notes: if notes.is_empty() { Vec::new() } else { vec![notes] },
            started_at,
        }
    }

    /// Start a session and record its start in `store`.
    pub async fn begin(
        user: impl Into<String>,
        notes: impl Into<String>,
        store: &dyn MeasurementStore,
    ) -> AppResult<Self> {
        let session = Self::new(user, notes);
        if session.user.trim().is_empty() {
            return Err(FlexError::Configuration("session user must not be empty".into()));
        }
        store
            .insert(
                Record::event(SESSION_SERIES, format!("start user={}", session.user))
                    .in_session(&session.id)
                    .at(session.started_at.with_timezone(&Utc)),
            )
            .await?;
        info!(session = %session.id, user = %session.user, "Session started");
        Ok(session)
    }

    /// Session id (`YYYYmmddHHMMSS` of the start time).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// User running the session.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Notes attached so far.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Start time.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Attach a note.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// A new measurement within this session.
    pub fn measurement(&self, notes: impl Into<String>) -> Measurement {
        let notes = notes.into();
        Measurement {
            id: timestamp_id(Local::now()),
            session_id: self.id.clone(),
            notes: if notes.is_empty() { Vec::new() } else { vec![notes] },
            started_at: None,
            ended_at: None,
        }
    }

    /// Record the end of the session in `store`.
    pub async fn end(self, store: &dyn MeasurementStore) -> AppResult<()> {
        let mut text = String::from("end");
        for note in &self.notes {
            text.push_str("; ");
            text.push_str(note);
        }
        store
            .insert(Record::event(SESSION_SERIES, text).in_session(&self.id))
            .await?;
        info!(session = %self.id, "Session ended");
        Ok(())
    }
}

/// A measurement scope inside a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    id: String,
    session_id: String,
    notes: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Measurement {
    /// Measurement id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the owning session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start and end times, once known.
    pub fn span(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.started_at, self.ended_at)
    }

    /// Attach a timestamped note.
    pub fn add_note(&mut self, note: impl AsRef<str>) {
        self.notes
            .push(format!("{}: {}", Local::now().to_rfc3339(), note.as_ref()));
    }

    /// Mark the start and record it.
    pub async fn start(&mut self, store: &dyn MeasurementStore) -> AppResult<()> {
        if self.started_at.is_some() {
            return Err(FlexError::Storage(format!("measurement {} already started", self.id)));
        }
        let now = Utc::now();
        self.started_at = Some(now);
        store
            .insert(
                Record::event(MEASUREMENT_SERIES, format!("start {}", self.id))
                    .in_session(&self.session_id)
                    .at(now),
            )
            .await
    }

    /// Mark the end and record it together with the notes.
    pub async fn finish(&mut self, store: &dyn MeasurementStore) -> AppResult<()> {
        if self.started_at.is_none() {
            return Err(FlexError::Storage(format!("measurement {} was never started", self.id)));
        }
        let now = Utc::now();
        self.ended_at = Some(now);
        let mut text = format!("end {}", self.id);
        for note in &self.notes {
            text.push_str("; ");
            text.push_str(note);
        }
        store
            .insert(
                Record::event(MEASUREMENT_SERIES, text)
                    .in_session(&self.session_id)
                    .at(now),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    #[test]
    fn id_is_start_time_to_the_second() {
        let session = SessionContext::new("aria", "");
        assert_eq!(session.id().len(), 14);
        assert!(session.id().chars().all(|c| c.is_ascii_digit()));
        assert_eq!(session.id(), session.started_at().format(ID_FORMAT).to_string());
        assert!(session.notes().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_is_recorded() {
        let store = MemoryStore::new();
        let mut session = SessionContext::begin("aria", "cooldown", &store).await.unwrap();
        session.add_note("helium refilled");

        let mut measurement = session.measurement("");
        assert_eq!(measurement.session_id(), session.id());
        measurement.start(&store).await.unwrap();
        measurement.add_note("gate leak at 3 V");
        measurement.finish(&store).await.unwrap();
        assert!(matches!(measurement.span(), (Some(_), Some(_))));

        let id = session.id().to_string();
        session.end(&store).await.unwrap();

        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        let sessions = store.query_range(SESSION_SERIES, from, to).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|r| r.session_id.as_deref() == Some(id.as_str())));
        assert!(sessions[1].text.as_deref().unwrap().contains("helium refilled"));

        let measurements = store.query_range(MEASUREMENT_SERIES, from, to).await.unwrap();
        assert_eq!(measurements.len(), 2);
        assert!(measurements[1].text.as_deref().unwrap().contains("gate leak"));
    }

    #[tokio::test]
    async fn finishing_unstarted_measurement_fails() {
        let store = MemoryStore::new();
        let session = SessionContext::new("aria", "");
        let mut measurement = session.measurement("");
        assert!(measurement.finish(&store).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn empty_user_is_rejected() {
        let store = MemoryStore::new();
        assert!(SessionContext::begin("  ", "", &store).await.is_err());
        assert!(store.is_empty().await);
    }
}
