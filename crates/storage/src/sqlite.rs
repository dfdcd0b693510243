//! SQLite backend built on rusqlite.
//!
//! A single connection sits behind a mutex; every statement runs on the
//! blocking pool. Snapshots are staged in memory and applied in one SQLite
//! transaction on commit.
//!
//! Row ids are allocated in-process from the table maxima read at open, so
//! only one process should insert into a given database file at a time.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    DataRecord, NewData, NewParticipant, ParticipantChanges, ParticipantRecord, TrialRecord,
};
use crate::snapshot::{StagedParticipant, StagedSnapshot, WriteKind};
use crate::status::ParticipantStatus;
use crate::traits::ExperimentStorage;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS data (
        id INTEGER PRIMARY KEY,
        worker_id TEXT,
        condition TEXT,
        json_data TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS participant (
        id INTEGER PRIMARY KEY,
        worker_id TEXT NOT NULL UNIQUE,
        hit_id TEXT,
        assignment_id TEXT,
        platform TEXT,
        condition TEXT,
        created_at TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        status TEXT,
        data_id INTEGER REFERENCES data(id)
    );
    CREATE INDEX IF NOT EXISTS ix_participant_status ON participant(status);
";

const DROP_TABLES: &str = "
    DROP TABLE IF EXISTS participant;
    DROP TABLE IF EXISTS data;
";

const PARTICIPANT_COLUMNS: &str = "id, worker_id, hit_id, assignment_id, platform, condition, \
     created_at, start_time, end_time, status, data_id";

/// Participant and data tables in a SQLite database file.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    last_participant_id: AtomicI64,
    last_data_id: AtomicI64,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and ensure the tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::from_connection(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(backend)?;
        conn.execute_batch(CREATE_TABLES).map_err(backend)?;
        let (participant_max, data_max) = max_ids(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            last_participant_id: AtomicI64::new(participant_max),
            last_data_id: AtomicI64::new(data_max),
        })
    }

    /// Create the tables if they are missing.
    pub async fn create_tables(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| conn.execute_batch(CREATE_TABLES).map_err(backend))
            .await
    }

    /// Drop both tables and everything in them.
    pub async fn drop_tables(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| conn.execute_batch(DROP_TABLES).map_err(backend))
            .await?;
        self.last_participant_id.store(0, Ordering::SeqCst);
        self.last_data_id.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Drop and recreate both tables.
    pub async fn reset(&self) -> Result<(), StorageError> {
        self.drop_tables().await?;
        self.create_tables().await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {e}")))?
    }

    async fn committed_participant(
        &self,
        worker_id: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError> {
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {PARTICIPANT_COLUMNS} FROM participant WHERE worker_id = ?1"),
                params![worker_id],
                participant_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn committed_data(&self, id: i64) -> Result<Option<DataRecord>, StorageError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, worker_id, condition, json_data FROM data WHERE id = ?1",
                params![id],
                data_from_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }
}

#[async_trait]
impl ExperimentStorage for SqliteStorage {
    type Snapshot = StagedSnapshot;

    async fn begin_snapshot(&self) -> Result<StagedSnapshot, StorageError> {
        Ok(StagedSnapshot::new())
    }

    async fn commit_snapshot(&self, snapshot: StagedSnapshot) -> Result<(), StorageError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            // Data first: participant.data_id references it.
            for (id, (kind, record)) in &snapshot.data {
                let json = serde_json::to_string(&record.json_data)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                match kind {
                    WriteKind::Insert => {
                        tx.execute(
                            "INSERT INTO data (id, worker_id, condition, json_data) \
                             VALUES (?1, ?2, ?3, ?4)",
                            params![id, record.worker_id, record.condition, json],
                        )
                        .map_err(backend)?;
                    }
                    WriteKind::Update => {
                        let changed = tx
                            .execute(
                                "UPDATE data SET worker_id = ?2, condition = ?3, json_data = ?4 \
                                 WHERE id = ?1",
                                params![id, record.worker_id, record.condition, json],
                            )
                            .map_err(backend)?;
                        if changed == 0 {
                            return Err(StorageError::DataNotFound { id: *id });
                        }
                    }
                }
            }
            for (worker_id, staged) in &snapshot.participants {
                match staged {
                    StagedParticipant::Insert(record) => {
                        let exists: Option<i64> = tx
                            .query_row(
                                "SELECT id FROM participant WHERE worker_id = ?1",
                                params![worker_id],
                                |row| row.get(0),
                            )
                            .optional()
                            .map_err(backend)?;
                        if exists.is_some() {
                            return Err(StorageError::AlreadyRegistered {
                                worker_id: worker_id.clone(),
                            });
                        }
                        tx.execute(
                            &format!(
                                "INSERT INTO participant ({PARTICIPANT_COLUMNS}) \
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                            ),
                            params![
                                record.id,
                                record.worker_id,
                                record.hit_id,
                                record.assignment_id,
                                record.platform,
                                record.condition,
                                format_time(record.created_at)?,
                                format_time(record.start_time)?,
                                record.end_time.map(format_time).transpose()?,
                                record.status.map(ParticipantStatus::as_str),
                                record.data_id,
                            ],
                        )
                        .map_err(backend)?;
                    }
                    StagedParticipant::Update { changes, .. } => {
                        if let Some(id) = changes.data_id {
                            let found: Option<i64> = tx
                                .query_row("SELECT id FROM data WHERE id = ?1", params![id], |row| {
                                    row.get(0)
                                })
                                .optional()
                                .map_err(backend)?;
                            if found.is_none() {
                                return Err(StorageError::DataNotFound { id });
                            }
                        }
                        // NULL parameters leave the committed column as it is.
                        let changed = tx
                            .execute(
                                "UPDATE participant SET status = COALESCE(?2, status), \
                                 start_time = COALESCE(?3, start_time), \
                                 end_time = COALESCE(?4, end_time), \
                                 data_id = COALESCE(?5, data_id) \
                                 WHERE worker_id = ?1",
                                params![
                                    worker_id,
                                    changes.status.map(ParticipantStatus::as_str),
                                    changes.start_time.map(format_time).transpose()?,
                                    changes.end_time.map(format_time).transpose()?,
                                    changes.data_id,
                                ],
                            )
                            .map_err(backend)?;
                        if changed == 0 {
                            return Err(StorageError::ParticipantNotFound {
                                worker_id: worker_id.clone(),
                            });
                        }
                    }
                }
            }
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn abort_snapshot(&self, _snapshot: StagedSnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_participant(
        &self,
        snapshot: &mut StagedSnapshot,
        participant: NewParticipant,
    ) -> Result<ParticipantRecord, StorageError> {
        if self
            .find_participant(snapshot, &participant.worker_id)
            .await?
            .is_some()
        {
            return Err(StorageError::AlreadyRegistered {
                worker_id: participant.worker_id,
            });
        }
        let id = self.last_participant_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = participant.into_record(id, OffsetDateTime::now_utc());
        snapshot.stage_insert(record.clone());
        Ok(record)
    }

    async fn find_participant(
        &self,
        snapshot: &mut StagedSnapshot,
        worker_id: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError> {
        if let Some(staged) = snapshot.staged_participant(worker_id) {
            return Ok(Some(staged.clone()));
        }
        self.committed_participant(worker_id).await
    }

    async fn update_participant(
        &self,
        snapshot: &mut StagedSnapshot,
        worker_id: &str,
        changes: ParticipantChanges,
    ) -> Result<ParticipantRecord, StorageError> {
        let current = self
            .find_participant(snapshot, worker_id)
            .await?
            .ok_or_else(|| StorageError::ParticipantNotFound {
                worker_id: worker_id.to_string(),
            })?;
        if let Some(id) = changes.data_id {
            self.get_data_for_update(snapshot, id).await?;
        }
        Ok(snapshot.stage_changes(current, changes))
    }

    async fn list_open_participants(
        &self,
        snapshot: &mut StagedSnapshot,
        statuses: &[ParticipantStatus],
    ) -> Result<Vec<ParticipantRecord>, StorageError> {
        let committed = self.list_participants().await?;
        Ok(snapshot
            .overlay_participants(committed)
            .into_iter()
            .filter(|p| p.end_time.is_none())
            .filter(|p| p.status.is_some_and(|s| statuses.contains(&s)))
            .collect())
    }

    async fn insert_data(
        &self,
        snapshot: &mut StagedSnapshot,
        data: NewData,
    ) -> Result<DataRecord, StorageError> {
        let id = self.last_data_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = data.into_record(id);
        snapshot.stage_data(WriteKind::Insert, record.clone());
        Ok(record)
    }

    async fn get_data_for_update(
        &self,
        snapshot: &mut StagedSnapshot,
        id: i64,
    ) -> Result<DataRecord, StorageError> {
        if let Some(staged) = snapshot.staged_data(id) {
            return Ok(staged.clone());
        }
        self.committed_data(id)
            .await?
            .ok_or(StorageError::DataNotFound { id })
    }

    async fn update_data(
        &self,
        snapshot: &mut StagedSnapshot,
        record: DataRecord,
    ) -> Result<(), StorageError> {
        self.get_data_for_update(snapshot, record.id).await?;
        snapshot.stage_data(WriteKind::Update, record);
        Ok(())
    }

    async fn get_participant(&self, worker_id: &str) -> Result<ParticipantRecord, StorageError> {
        self.committed_participant(worker_id)
            .await?
            .ok_or_else(|| StorageError::ParticipantNotFound {
                worker_id: worker_id.to_string(),
            })
    }

    async fn list_participants(&self) -> Result<Vec<ParticipantRecord>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PARTICIPANT_COLUMNS} FROM participant ORDER BY id ASC"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map([], participant_from_row)
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn get_data(&self, id: i64) -> Result<DataRecord, StorageError> {
        self.committed_data(id)
            .await?
            .ok_or(StorageError::DataNotFound { id })
    }

    async fn list_data(&self) -> Result<Vec<DataRecord>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, worker_id, condition, json_data FROM data ORDER BY id ASC")
                .map_err(backend)?;
            let rows = stmt.query_map([], data_from_row).map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }
}

fn backend(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn max_ids(conn: &Connection) -> Result<(i64, i64), StorageError> {
    let participant: i64 = conn
        .query_row("SELECT COALESCE(MAX(id), 0) FROM participant", [], |row| {
            row.get(0)
        })
        .map_err(backend)?;
    let data: i64 = conn
        .query_row("SELECT COALESCE(MAX(id), 0) FROM data", [], |row| row.get(0))
        .map_err(backend)?;
    Ok((participant, data))
}

fn format_time(t: OffsetDateTime) -> Result<String, StorageError> {
    t.format(&Rfc3339)
        .map_err(|e| StorageError::Backend(format!("timestamp format: {e}")))
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(row: &Row<'_>, column: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(column)?;
    OffsetDateTime::parse(&raw, &Rfc3339).map_err(|e| conversion_error(column, e))
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let end_time: Option<String> = row.get(8)?;
    let end_time = end_time
        .map(|raw| OffsetDateTime::parse(&raw, &Rfc3339).map_err(|e| conversion_error(8, e)))
        .transpose()?;
    // An unrecognised status string surfaces as a missing status.
    let status: Option<String> = row.get(9)?;
    let status = status.and_then(|s| s.parse::<ParticipantStatus>().ok());
    Ok(ParticipantRecord {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        hit_id: row.get(2)?,
        assignment_id: row.get(3)?,
        platform: row.get(4)?,
        condition: row.get(5)?,
        created_at: parse_time(row, 6)?,
        start_time: parse_time(row, 7)?,
        end_time,
        status,
        data_id: row.get(10)?,
    })
}

fn data_from_row(row: &Row<'_>) -> rusqlite::Result<DataRecord> {
    let raw: String = row.get(3)?;
    let json_data: Vec<TrialRecord> =
        serde_json::from_str(&raw).map_err(|e| conversion_error(3, e))?;
    Ok(DataRecord {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        condition: row.get(2)?,
        json_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::run_conformance_suite;

    #[tokio::test]
    async fn sqlite_conformance() {
        let report = run_conformance_suite(|| async {
            SqliteStorage::open_in_memory().expect("open in-memory sqlite")
        })
        .await;
        assert!(report.failed == 0, "{report}");
    }

    #[tokio::test]
    async fn ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.db");

        {
            let s = SqliteStorage::open(&path).unwrap();
            let mut snap = s.begin_snapshot().await.unwrap();
            s.insert_participant(&mut snap, NewParticipant::started("w1"))
                .await
                .unwrap();
            s.commit_snapshot(snap).await.unwrap();
        }

        let s = SqliteStorage::open(&path).unwrap();
        let mut snap = s.begin_snapshot().await.unwrap();
        let second = s
            .insert_participant(&mut snap, NewParticipant::started("w2"))
            .await
            .unwrap();
        s.commit_snapshot(snap).await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(s.list_participants().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_status_text_reads_as_missing() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let mut snap = s.begin_snapshot().await.unwrap();
        s.insert_participant(&mut snap, NewParticipant::started("w1"))
            .await
            .unwrap();
        s.commit_snapshot(snap).await.unwrap();

        s.with_conn(|conn| {
            conn.execute(
                "UPDATE participant SET status = 'consented' WHERE worker_id = 'w1'",
                [],
            )
            .map_err(backend)
        })
        .await
        .unwrap();

        let rec = s.get_participant("w1").await.unwrap();
        assert_eq!(rec.status, None);
    }

    #[tokio::test]
    async fn reset_empties_tables_and_restarts_ids() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let mut snap = s.begin_snapshot().await.unwrap();
        s.insert_participant(&mut snap, NewParticipant::started("w1"))
            .await
            .unwrap();
        s.insert_data(&mut snap, NewData::default()).await.unwrap();
        s.commit_snapshot(snap).await.unwrap();

        s.reset().await.unwrap();
        assert!(s.list_participants().await.unwrap().is_empty());
        assert!(s.list_data().await.unwrap().is_empty());

        let mut snap = s.begin_snapshot().await.unwrap();
        let rec = s
            .insert_participant(&mut snap, NewParticipant::started("w2"))
            .await
            .unwrap();
        assert_eq!(rec.id, 1);
    }

    #[tokio::test]
    async fn trial_keys_keep_submitted_order() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let trial: TrialRecord =
            serde_json::from_str(r#"{"rt": 812, "stimulus": "a.png", "response": "b"}"#).unwrap();
        let mut snap = s.begin_snapshot().await.unwrap();
        let data = s
            .insert_data(
                &mut snap,
                NewData {
                    json_data: vec![trial],
                    ..NewData::default()
                },
            )
            .await
            .unwrap();
        s.commit_snapshot(snap).await.unwrap();

        let stored = s.get_data(data.id).await.unwrap();
        let keys: Vec<&str> = stored.json_data[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["rt", "stimulus", "response"]);
    }
}
