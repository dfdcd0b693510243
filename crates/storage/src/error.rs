/// All errors that can be returned by an ExperimentStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No participant with the given worker id.
    #[error("participant not found: {worker_id}")]
    ParticipantNotFound { worker_id: String },

    /// No data record with the given id.
    #[error("data record not found: {id}")]
    DataNotFound { id: i64 },

    /// A participant with this worker id already exists. Raised either when
    /// staging the insert or, if a concurrent snapshot won the race, at commit.
    #[error("participant already registered: {worker_id}")]
    AlreadyRegistered { worker_id: String },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
