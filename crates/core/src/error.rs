use cohort_storage::StorageError;

/// Errors from lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The worker id was never initiated.
    #[error("participant not found: {worker_id}")]
    ParticipantNotFound { worker_id: String },

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for LifecycleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ParticipantNotFound { worker_id } => {
                LifecycleError::ParticipantNotFound { worker_id }
            }
            other => LifecycleError::Storage(other),
        }
    }
}

/// Errors while loading [`Settings`](crate::Settings).
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// An environment override could not be parsed into the field's type.
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid setting {name}: {message}")]
    Invalid { name: &'static str, message: String },

    #[error("unsupported database url '{0}' (expected sqlite://<path>, a file path, or memory)")]
    UnsupportedDatabase(String),
}
