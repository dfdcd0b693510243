//! Staged writes shared by the bundled backends.
//!
//! A [`StagedSnapshot`] collects inserts and column-level participant changes
//! without touching committed state. Reads made through the snapshot see its
//! own staged writes layered over committed rows. On commit the backend
//! applies everything in one step; dropping the snapshot discards it.

use std::collections::BTreeMap;

use crate::record::{DataRecord, ParticipantChanges, ParticipantRecord};

/// How a staged data row reaches the committed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// New row.
    Insert,
    /// Overwrite of an existing row; last writer wins.
    Update,
}

/// A participant write waiting for commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StagedParticipant {
    /// New row; commit fails if the worker id was registered meanwhile.
    Insert(ParticipantRecord),
    /// Changes to an existing row. `view` is what this snapshot reads back;
    /// only `changes` reach the committed row.
    Update {
        view: ParticipantRecord,
        changes: ParticipantChanges,
    },
}

impl StagedParticipant {
    pub(crate) fn view(&self) -> &ParticipantRecord {
        match self {
            StagedParticipant::Insert(record) => record,
            StagedParticipant::Update { view, .. } => view,
        }
    }
}

#[derive(Debug, Default)]
pub struct StagedSnapshot {
    /// Keyed by worker id.
    pub(crate) participants: BTreeMap<String, StagedParticipant>,
    /// Keyed by data id.
    pub(crate) data: BTreeMap<i64, (WriteKind, DataRecord)>,
}

impl StagedSnapshot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of staged row writes.
    pub fn pending_writes(&self) -> usize {
        self.participants.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_writes() == 0
    }

    pub(crate) fn staged_participant(&self, worker_id: &str) -> Option<&ParticipantRecord> {
        self.participants.get(worker_id).map(StagedParticipant::view)
    }

    pub(crate) fn staged_data(&self, id: i64) -> Option<&DataRecord> {
        self.data.get(&id).map(|(_, rec)| rec)
    }

    pub(crate) fn stage_insert(&mut self, record: ParticipantRecord) {
        self.participants
            .insert(record.worker_id.clone(), StagedParticipant::Insert(record));
    }

    /// Stage `changes` on top of `current`, the row as this snapshot sees it,
    /// and return the updated view. Changes to a staged insert fold into the
    /// inserted row.
    pub(crate) fn stage_changes(
        &mut self,
        current: ParticipantRecord,
        changes: ParticipantChanges,
    ) -> ParticipantRecord {
        let staged = match self.participants.remove(&current.worker_id) {
            Some(StagedParticipant::Insert(mut record)) => {
                changes.apply_to(&mut record);
                StagedParticipant::Insert(record)
            }
            Some(StagedParticipant::Update {
                mut view,
                changes: mut pending,
            }) => {
                changes.apply_to(&mut view);
                pending.merge(changes);
                StagedParticipant::Update {
                    view,
                    changes: pending,
                }
            }
            None => {
                let mut view = current;
                changes.apply_to(&mut view);
                StagedParticipant::Update { view, changes }
            }
        };
        let view = staged.view().clone();
        self.participants.insert(view.worker_id.clone(), staged);
        view
    }

    pub(crate) fn stage_data(&mut self, kind: WriteKind, record: DataRecord) {
        let kind = match self.data.get(&record.id) {
            Some((WriteKind::Insert, _)) => WriteKind::Insert,
            _ => kind,
        };
        self.data.insert(record.id, (kind, record));
    }

    /// Merge staged participants over `committed`, replacing rows with the
    /// same worker id and appending new ones. Result is ordered by id.
    pub(crate) fn overlay_participants(
        &self,
        committed: Vec<ParticipantRecord>,
    ) -> Vec<ParticipantRecord> {
        let mut by_worker: BTreeMap<String, ParticipantRecord> = committed
            .into_iter()
            .map(|p| (p.worker_id.clone(), p))
            .collect();
        for (worker_id, staged) in &self.participants {
            by_worker.insert(worker_id.clone(), staged.view().clone());
        }
        let mut rows: Vec<ParticipantRecord> = by_worker.into_values().collect();
        rows.sort_by_key(|p| p.id);
        rows
    }
}
