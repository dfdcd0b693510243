pub mod conformance;
mod error;
mod memory;
mod record;
mod snapshot;
#[cfg(feature = "sqlite")]
mod sqlite;
mod status;
mod traits;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use record::{
    DataRecord, NewData, NewParticipant, ParticipantChanges, ParticipantRecord, TrialRecord,
};
pub use snapshot::StagedSnapshot;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use status::{ParticipantStatus, StatusGroup, UnknownStatus};
pub use traits::ExperimentStorage;
