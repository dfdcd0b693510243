use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{DataRecord, NewData, NewParticipant, ParticipantChanges, ParticipantRecord};
use crate::status::ParticipantStatus;

/// The record store behind the participant lifecycle.
///
/// An `ExperimentStorage` implementation holds two tables: participants
/// (unique by `worker_id`) and submitted data (unique by `id`).
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` — start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` — commit and consume the transaction
///    OR `abort_snapshot(snapshot)` — roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, none of its writes become
/// visible. Reads made through a snapshot observe that snapshot's own writes.
///
/// ## Concurrency
///
/// No row locks are taken. Participant updates write only the columns they
/// change, so a commit never reverts a column another snapshot set in the
/// meantime; for a column both snapshots set, the last to commit wins.
/// Inserts re-check `worker_id` uniqueness at commit and fail with
/// `AlreadyRegistered` if another snapshot got there first.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait ExperimentStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable at once.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Participant operations (within snapshot) ─────────────────────────────

    /// Stage a new participant. The store assigns `id` and `created_at`.
    ///
    /// Returns `Err(StorageError::AlreadyRegistered)` if the worker id is
    /// already visible to this snapshot.
    async fn insert_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        participant: NewParticipant,
    ) -> Result<ParticipantRecord, StorageError>;

    /// Look up a participant by worker id as seen by this snapshot.
    async fn find_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        worker_id: &str,
    ) -> Result<Option<ParticipantRecord>, StorageError>;

    /// Read a participant that the caller intends to update.
    ///
    /// Returns `Err(StorageError::ParticipantNotFound)` if it does not exist.
    async fn get_participant_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        worker_id: &str,
    ) -> Result<ParticipantRecord, StorageError> {
        self.find_participant(snapshot, worker_id)
            .await?
            .ok_or_else(|| StorageError::ParticipantNotFound {
                worker_id: worker_id.to_string(),
            })
    }

    /// Stage `changes` to the participant with `worker_id` and return the
    /// record as this snapshot now sees it.
    ///
    /// Returns `Err(StorageError::ParticipantNotFound)` if the participant
    /// does not exist, and `Err(StorageError::DataNotFound)` if
    /// `changes.data_id` names a data record this snapshot cannot see.
    async fn update_participant(
        &self,
        snapshot: &mut Self::Snapshot,
        worker_id: &str,
        changes: ParticipantChanges,
    ) -> Result<ParticipantRecord, StorageError>;

    /// Participants with no `end_time` whose status is one of `statuses`,
    /// ordered by id.
    async fn list_open_participants(
        &self,
        snapshot: &mut Self::Snapshot,
        statuses: &[ParticipantStatus],
    ) -> Result<Vec<ParticipantRecord>, StorageError>;

    // ── Data operations (within snapshot) ────────────────────────────────────

    /// Stage a new data record. The store assigns `id`.
    async fn insert_data(
        &self,
        snapshot: &mut Self::Snapshot,
        data: NewData,
    ) -> Result<DataRecord, StorageError>;

    /// Read a data record that the caller intends to update.
    ///
    /// Returns `Err(StorageError::DataNotFound)` if it does not exist.
    async fn get_data_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: i64,
    ) -> Result<DataRecord, StorageError>;

    /// Stage a full-record overwrite of the data record with `record.id`.
    async fn update_data(
        &self,
        snapshot: &mut Self::Snapshot,
        record: DataRecord,
    ) -> Result<(), StorageError>;

    // ── Query operations (committed state only) ──────────────────────────────

    /// Read a committed participant.
    ///
    /// Returns `Err(StorageError::ParticipantNotFound)` if it does not exist.
    async fn get_participant(&self, worker_id: &str) -> Result<ParticipantRecord, StorageError>;

    /// All committed participants, ordered by id.
    async fn list_participants(&self) -> Result<Vec<ParticipantRecord>, StorageError>;

    /// Read a committed data record.
    ///
    /// Returns `Err(StorageError::DataNotFound)` if it does not exist.
    async fn get_data(&self, id: i64) -> Result<DataRecord, StorageError>;

    /// All committed data records, ordered by id.
    async fn list_data(&self) -> Result<Vec<DataRecord>, StorageError>;
}
