//! In-process backend. Used by tests and by `DATABASE_URL=memory`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{DataRecord, NewData, NewParticipant, ParticipantChanges, ParticipantRecord};
use crate::snapshot::{StagedParticipant, StagedSnapshot, WriteKind};
use crate::status::ParticipantStatus;
use crate::traits::ExperimentStorage;

#[derive(Default)]
struct Tables {
    /// Keyed by worker id.
    participants: BTreeMap<String, ParticipantRecord>,
    data: BTreeMap<i64, DataRecord>,
    last_participant_id: i64,
    last_data_id: i64,
}

/// Participant and data tables held in memory behind a mutex.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl ExperimentStorage for MemoryStorage {
    type Snapshot = StagedSnapshot;

    async fn begin_snapshot(&self) -> Result<StagedSnapshot, StorageError> {
        Ok(StagedSnapshot::new())
    }

    async fn commit_snapshot(&self, snapshot: StagedSnapshot) -> Result<(), StorageError> {
        let mut tables = self.tables()?;

        // Validate everything first so a failed commit applies nothing.
        for (worker_id, staged) in &snapshot.participants {
            let exists = tables.participants.contains_key(worker_id);
            match staged {
                StagedParticipant::Insert(_) if exists => {
                    return Err(StorageError::AlreadyRegistered {
                        worker_id: worker_id.clone(),
                    })
                }
                StagedParticipant::Update { .. } if !exists => {
                    return Err(StorageError::ParticipantNotFound {
                        worker_id: worker_id.clone(),
                    })
                }
                StagedParticipant::Update { changes, .. } => {
                    if let Some(id) = changes.data_id {
                        if !tables.data.contains_key(&id) && !snapshot.data.contains_key(&id) {
                            return Err(StorageError::DataNotFound { id });
                        }
                    }
                }
                StagedParticipant::Insert(_) => {}
            }
        }
        for (id, (kind, _)) in &snapshot.data {
            if *kind == WriteKind::Update && !tables.data.contains_key(id) {
                return Err(StorageError::DataNotFound { id: *id });
            }
        }

        for (id, (_, record)) in snapshot.data {
            tables.data.insert(id, record);
        }
        for (worker_id, staged) in snapshot.participants {
            match staged {
                StagedParticipant::Insert(record) => {
                    tables.participants.insert(worker_id, record);
                }
                StagedParticipant::Update { changes, .. } => {
                    if let Some(row) = tables.participants.get_mut(&worker_id) {
                        changes.apply_to(row);
                    }
                }
            }
        }
        Ok(())
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
        let id = {
            let mut tables = self.tables()?;
            tables.last_participant_id += 1;
            tables.last_participant_id
        };
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
        Ok(self.tables()?.participants.get(worker_id).cloned())
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
        let committed: Vec<ParticipantRecord> =
            self.tables()?.participants.values().cloned().collect();
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
        let id = {
            let mut tables = self.tables()?;
            tables.last_data_id += 1;
            tables.last_data_id
        };
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
        self.tables()?
            .data
            .get(&id)
            .cloned()
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
        self.tables()?
            .participants
            .get(worker_id)
            .cloned()
            .ok_or_else(|| StorageError::ParticipantNotFound {
                worker_id: worker_id.to_string(),
            })
    }

    async fn list_participants(&self) -> Result<Vec<ParticipantRecord>, StorageError> {
        let mut rows: Vec<ParticipantRecord> =
            self.tables()?.participants.values().cloned().collect();
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    async fn get_data(&self, id: i64) -> Result<DataRecord, StorageError> {
        self.tables()?
            .data
            .get(&id)
            .cloned()
            .ok_or(StorageError::DataNotFound { id })
    }

    async fn list_data(&self) -> Result<Vec<DataRecord>, StorageError> {
        Ok(self.tables()?.data.values().cloned().collect())
    }
}
