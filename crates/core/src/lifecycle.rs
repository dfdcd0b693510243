//! The participant state machine.
//!
//! Every operation runs in its own storage snapshot. Reads outside a snapshot
//! see committed state only.

use std::sync::Arc;

use cohort_storage::{
    DataRecord, ExperimentStorage, NewData, NewParticipant, ParticipantChanges, ParticipantRecord,
    ParticipantStatus, StorageError, TrialRecord,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::configuration::ExperimentConfiguration;
use crate::error::LifecycleError;
use crate::settings::Settings;
use crate::summary::StatusSummary;
use crate::sweeper;

/// A participant arriving from a recruitment platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantIn {
    pub worker_id: String,
    pub hit_id: String,
    pub assignment_id: String,
    pub platform: String,
}

/// A status change reported by the participant's browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub worker_id: String,
    pub status: ParticipantStatus,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub data: Option<DataRecord>,
    #[serde(default)]
    pub data_id: Option<i64>,
}

impl ParticipantUpdate {
    pub fn status(worker_id: impl Into<String>, status: ParticipantStatus) -> Self {
        Self {
            worker_id: worker_id.into(),
            status,
            start_time: None,
            end_time: None,
            data: None,
            data_id: None,
        }
    }

    /// Explicit `data_id` wins over the id of an attached data record.
    fn linked_data_id(&self) -> Option<i64> {
        self.data_id.or_else(|| self.data.as_ref().map(|d| d.id))
    }
}

/// The final trial payload for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDataIn {
    pub worker_id: String,
    #[serde(default)]
    pub condition: Option<String>,
    pub json_data: Vec<TrialRecord>,
}

/// Drives participants through `started -> working* -> complete`, with
/// `timeout` applied by the sweeper.
pub struct LifecycleEngine<S> {
    storage: Arc<S>,
    settings: Arc<Settings>,
}

impl<S> Clone for LifecycleEngine<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<S: ExperimentStorage> LifecycleEngine<S> {
    pub fn new(storage: Arc<S>, settings: Arc<Settings>) -> Self {
        Self { storage, settings }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Enter the experiment. A returning worker gets their existing record
    /// back untouched; a new one is created as `started` in the configured
    /// condition.
    pub async fn initiate(
        &self,
        participant: ParticipantIn,
    ) -> Result<ExperimentConfiguration, LifecycleError> {
        let mut snap = self.storage.begin_snapshot().await?;
        if let Some(existing) = self
            .storage
            .find_participant(&mut snap, &participant.worker_id)
            .await?
        {
            self.storage.abort_snapshot(snap).await?;
            tracing::info!(worker_id = %existing.worker_id, "participant re-entered");
            return Ok(self.configuration_for(&existing));
        }

        let new = NewParticipant {
            worker_id: participant.worker_id,
            hit_id: Some(participant.hit_id),
            assignment_id: Some(participant.assignment_id),
            platform: Some(participant.platform),
            condition: Some(self.settings.condition.clone()),
            start_time: OffsetDateTime::now_utc(),
            status: Some(ParticipantStatus::Started),
        };
        let worker_id = new.worker_id.clone();
        let created = self.storage.insert_participant(&mut snap, new).await?;

        match self.storage.commit_snapshot(snap).await {
            Ok(()) => {
                tracing::info!(
                    worker_id = %created.worker_id,
                    id = created.id,
                    condition = ?created.condition,
                    "participant created"
                );
                Ok(self.configuration_for(&created))
            }
            Err(StorageError::AlreadyRegistered { .. }) => {
                // A concurrent initiate for the same worker committed first.
                let existing = self.storage.get_participant(&worker_id).await?;
                tracing::info!(worker_id = %existing.worker_id, "participant re-entered");
                Ok(self.configuration_for(&existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a participant record as given. Fails with `AlreadyRegistered`
    /// if the worker exists.
    pub async fn register(
        &self,
        participant: NewParticipant,
    ) -> Result<ParticipantRecord, LifecycleError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let created = self.storage.insert_participant(&mut snap, participant).await?;
        self.storage.commit_snapshot(snap).await?;
        tracing::info!(worker_id = %created.worker_id, id = created.id, "participant registered");
        Ok(created)
    }

    /// Apply a status change. A `complete` participant is never modified:
    /// the stored record comes back unchanged. Only the status and the
    /// fields present in `update` are written; a `data_id` that names no
    /// stored data record fails with `DataNotFound`.
    pub async fn update_status(
        &self,
        update: ParticipantUpdate,
    ) -> Result<ParticipantRecord, LifecycleError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let record = self
            .storage
            .get_participant_for_update(&mut snap, &update.worker_id)
            .await?;

        match record.status {
            None => {
                tracing::error!(worker_id = %record.worker_id, "participant has no status");
            }
            Some(ParticipantStatus::Complete) => {
                self.storage.abort_snapshot(snap).await?;
                tracing::error!(
                    worker_id = %record.worker_id,
                    requested = %update.status,
                    "participant already complete, update ignored"
                );
                return Ok(record);
            }
            Some(_) => {}
        }

        let changes = ParticipantChanges {
            status: Some(update.status),
            start_time: update.start_time,
            end_time: update.end_time,
            data_id: update.linked_data_id(),
        };
        let record = self
            .storage
            .update_participant(&mut snap, &record.worker_id, changes)
            .await?;
        self.storage.commit_snapshot(snap).await?;
        tracing::info!(worker_id = %record.worker_id, status = %update.status, "status updated");
        Ok(record)
    }

    /// Record the final payload and mark the participant complete.
    ///
    /// The data row is committed before the participant is looked up, so an
    /// unknown worker leaves an unlinked data row behind. The participant is
    /// completed whatever its current status.
    pub async fn submit_data(&self, submission: ParticipantDataIn) -> Result<(), LifecycleError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let mut data = self
            .storage
            .insert_data(
                &mut snap,
                NewData {
                    worker_id: None,
                    condition: submission.condition,
                    json_data: submission.json_data,
                },
            )
            .await?;
        self.storage.commit_snapshot(snap).await?;

        let mut snap = self.storage.begin_snapshot().await?;
        let completion = ParticipantChanges {
            status: Some(ParticipantStatus::Complete),
            end_time: Some(OffsetDateTime::now_utc()),
            data_id: Some(data.id),
            ..ParticipantChanges::default()
        };
        let participant = match self
            .storage
            .update_participant(&mut snap, &submission.worker_id, completion)
            .await
        {
            Ok(p) => p,
            Err(e @ StorageError::ParticipantNotFound { .. }) => {
                tracing::error!(
                    worker_id = %submission.worker_id,
                    data_id = data.id,
                    "data stored for unknown participant"
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.storage.commit_snapshot(snap).await?;

        let mut snap = self.storage.begin_snapshot().await?;
        data.worker_id = Some(participant.worker_id.clone());
        self.storage.update_data(&mut snap, data.clone()).await?;
        self.storage.commit_snapshot(snap).await?;

        tracing::info!(
            worker_id = %participant.worker_id,
            data_id = data.id,
            trials = data.json_data.len(),
            "participant complete"
        );
        Ok(())
    }

    pub async fn list_participants(&self) -> Result<Vec<ParticipantRecord>, LifecycleError> {
        Ok(self.storage.list_participants().await?)
    }

    pub async fn status_summary(&self) -> Result<StatusSummary, LifecycleError> {
        let participants = self.storage.list_participants().await?;
        let summary = StatusSummary::from_participants(&participants);
        tracing::info!(total = summary.total(), "status summary: {:?}", summary.entries());
        Ok(summary)
    }

    /// The data record linked to a participant, if any.
    pub async fn data_for(&self, worker_id: &str) -> Result<Option<DataRecord>, LifecycleError> {
        let participant = self.storage.get_participant(worker_id).await?;
        match participant.data_id {
            Some(id) => Ok(Some(self.storage.get_data(id).await?)),
            None => Ok(None),
        }
    }

    /// One sweep at the current time using the configured allotted time.
    pub async fn reclaim(&self) -> Result<Vec<ParticipantRecord>, LifecycleError> {
        let now = OffsetDateTime::now_utc();
        Ok(sweeper::sweep(self.storage.as_ref(), self.settings.allotted_time(), now).await?)
    }

    fn configuration_for(&self, participant: &ParticipantRecord) -> ExperimentConfiguration {
        ExperimentConfiguration::merge(&self.settings.public, participant)
    }
}

#[cfg(test)]
mod tests {
    use cohort_storage::MemoryStorage;

    use super::*;

    fn engine() -> LifecycleEngine<MemoryStorage> {
        LifecycleEngine::new(Arc::new(MemoryStorage::new()), Arc::new(Settings::default()))
    }

    fn arrival(worker: &str) -> ParticipantIn {
        ParticipantIn {
            worker_id: worker.to_string(),
            hit_id: "H1".to_string(),
            assignment_id: "A1".to_string(),
            platform: "prolific".to_string(),
        }
    }

    #[test]
    fn explicit_data_id_wins_over_attached_record() {
        let mut update = ParticipantUpdate::status("w", ParticipantStatus::Working);
        update.data = Some(DataRecord {
            id: 4,
            worker_id: None,
            condition: None,
            json_data: vec![],
        });
        assert_eq!(update.linked_data_id(), Some(4));
        update.data_id = Some(9);
        assert_eq!(update.linked_data_id(), Some(9));
    }

    #[test]
    fn update_accepts_minimal_body() {
        let update: ParticipantUpdate =
            serde_json::from_str(r#"{"worker_id":"w","status":"working"}"#).unwrap();
        assert_eq!(update, ParticipantUpdate::status("w", ParticipantStatus::Working));
    }

    #[test]
    fn update_rejects_unknown_status() {
        let result: Result<ParticipantUpdate, _> =
            serde_json::from_str(r#"{"worker_id":"w","status":"finished"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn initiate_assigns_configured_condition() {
        let engine = engine();
        let config = engine.initiate(arrival("w1")).await.unwrap();
        assert_eq!(config.condition.as_deref(), Some("trustworthy"));
        let stored = engine.storage().get_participant("w1").await.unwrap();
        assert_eq!(stored.hit_id.as_deref(), Some("H1"));
        assert_eq!(stored.platform.as_deref(), Some("prolific"));
        assert_eq!(stored.created_at, stored.start_time);
    }

    #[tokio::test]
    async fn update_unknown_worker_is_not_found() {
        let err = engine()
            .update_status(ParticipantUpdate::status("ghost", ParticipantStatus::Working))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ParticipantNotFound { worker_id } if worker_id == "ghost"));
    }

    #[tokio::test]
    async fn register_twice_is_already_registered() {
        let engine = engine();
        engine.register(NewParticipant::started("w1")).await.unwrap();
        let err = engine
            .register(NewParticipant::started("w1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Storage(StorageError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn missing_status_is_still_updated() {
        let engine = engine();
        let mut p = NewParticipant::started("w1");
        p.status = None;
        engine.register(p).await.unwrap();
        let rec = engine
            .update_status(ParticipantUpdate::status("w1", ParticipantStatus::Working))
            .await
            .unwrap();
        assert_eq!(rec.status, Some(ParticipantStatus::Working));
    }

    #[tokio::test]
    async fn data_for_without_submission_is_none() {
        let engine = engine();
        engine.initiate(arrival("w1")).await.unwrap();
        assert_eq!(engine.data_for("w1").await.unwrap(), None);
    }
}
