use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::status::ParticipantStatus;

/// One trial's worth of submitted data: an arbitrary JSON object. Keys keep
/// the order they were submitted in.
pub type TrialRecord = serde_json::Map<String, serde_json::Value>;

/// A participant as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: i64,
    pub worker_id: String,
    /// Study id on Prolific.
    pub hit_id: Option<String>,
    /// Session id on Prolific.
    pub assignment_id: Option<String>,
    /// prolific, mturk or cloudresearch.
    pub platform: Option<String>,
    pub condition: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Clock reference for reclamation.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    /// `None` only for rows written without a status; treated as an anomaly.
    pub status: Option<ParticipantStatus>,
    /// Id of the linked [`DataRecord`], set on completion.
    pub data_id: Option<i64>,
}

/// Fields for a participant that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub worker_id: String,
    #[serde(default)]
    pub hit_id: Option<String>,
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(with = "time::serde::rfc3339", default = "now_utc")]
    pub start_time: OffsetDateTime,
    #[serde(default = "default_status")]
    pub status: Option<ParticipantStatus>,
}

impl NewParticipant {
    /// A fresh `started` participant whose clock starts now.
    pub fn started(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            hit_id: None,
            assignment_id: None,
            platform: None,
            condition: None,
            start_time: OffsetDateTime::now_utc(),
            status: Some(ParticipantStatus::Started),
        }
    }

    /// Turn into a stored record with the given id and creation time.
    pub fn into_record(self, id: i64, created_at: OffsetDateTime) -> ParticipantRecord {
        ParticipantRecord {
            id,
            worker_id: self.worker_id,
            hit_id: self.hit_id,
            assignment_id: self.assignment_id,
            platform: self.platform,
            condition: self.condition,
            created_at,
            start_time: self.start_time,
            end_time: None,
            status: self.status,
            data_id: None,
        }
    }
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn default_status() -> Option<ParticipantStatus> {
    Some(ParticipantStatus::Started)
}

/// Column-level changes to a stored participant.
///
/// Only the fields that are `Some` are written; every other column keeps
/// whatever value is committed when the change lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipantChanges {
    pub status: Option<ParticipantStatus>,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    pub data_id: Option<i64>,
}

impl ParticipantChanges {
    /// A change of status and nothing else.
    pub fn status(status: ParticipantStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, record: &mut ParticipantRecord) {
        if let Some(status) = self.status {
            record.status = Some(status);
        }
        if let Some(start_time) = self.start_time {
            record.start_time = start_time;
        }
        if let Some(end_time) = self.end_time {
            record.end_time = Some(end_time);
        }
        if let Some(data_id) = self.data_id {
            record.data_id = Some(data_id);
        }
    }

    /// Fold `later` into `self`; fields set in `later` win.
    pub fn merge(&mut self, later: ParticipantChanges) {
        self.status = later.status.or(self.status);
        self.start_time = later.start_time.or(self.start_time);
        self.end_time = later.end_time.or(self.end_time);
        self.data_id = later.data_id.or(self.data_id);
    }
}

/// A submitted trial payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: i64,
    /// Back-filled once the data is linked to its participant.
    pub worker_id: Option<String>,
    pub condition: Option<String>,
    pub json_data: Vec<TrialRecord>,
}

/// Fields for a data record that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewData {
    pub worker_id: Option<String>,
    pub condition: Option<String>,
    pub json_data: Vec<TrialRecord>,
}

impl NewData {
    pub fn into_record(self, id: i64) -> DataRecord {
        DataRecord {
            id,
            worker_id: self.worker_id,
            condition: self.condition,
            json_data: self.json_data,
        }
    }
}
