use cohort_storage::{ParticipantRecord, ParticipantStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::settings::PublicSettings;

/// What a participant's browser receives when it enters the experiment:
/// the public settings plus the participant's own persisted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    pub worker_id: String,
    pub status: Option<ParticipantStatus>,
    pub condition: Option<String>,
    pub data_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub public: PublicSettings,
}

impl ExperimentConfiguration {
    pub fn merge(public: &PublicSettings, participant: &ParticipantRecord) -> Self {
        Self {
            worker_id: participant.worker_id.clone(),
            status: participant.status,
            condition: participant.condition.clone(),
            data_id: participant.data_id,
            start_time: participant.start_time,
            end_time: participant.end_time,
            public: public.clone(),
        }
    }
}
