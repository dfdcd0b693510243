//! cohort-core: participant lifecycle for online experiments.
//!
//! Tracks each participant from initiation to completion or timeout on top of
//! any [`ExperimentStorage`] backend.
//!
//! # Public API
//!
//! Key types are re-exported at the crate root for convenience:
//!
//! - [`LifecycleEngine`] -- initiate, update status, submit data, summaries
//! - [`sweep()`] / [`spawn_sweeper`] -- reclamation of expired participants
//! - [`ExperimentConfiguration`] -- what a participant's browser receives
//! - [`Settings`] -- process-wide configuration, loaded once at startup
//! - [`LifecycleError`] / [`SettingsError`] -- error types

/// Version reported by the API health endpoint.
pub const COHORT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod configuration;
pub mod error;
pub mod lifecycle;
pub mod settings;
pub mod summary;
pub mod sweeper;

pub use cohort_storage::{
    DataRecord, ExperimentStorage, NewParticipant, ParticipantChanges, ParticipantRecord,
    ParticipantStatus, StatusGroup, StorageError, TrialRecord,
};
pub use configuration::ExperimentConfiguration;
pub use error::{LifecycleError, SettingsError};
pub use lifecycle::{LifecycleEngine, ParticipantDataIn, ParticipantIn, ParticipantUpdate};
pub use settings::{PublicSettings, Settings, StorageLocation, DEFAULT_SETTINGS_FILE};
pub use summary::StatusSummary;
pub use sweeper::{spawn_sweeper, sweep, SweeperHandle};
