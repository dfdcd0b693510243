use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a participant is in the experiment.
///
/// Every status belongs to exactly one [`StatusGroup`]; see
/// [`ParticipantStatus::group`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Started,
    Working,
    WorkingFinishedConsent,
    WorkingFinishedAttrition,
    WorkingFinishedInstructions,
    WorkingFinishedTask,
    WorkingFinishedSurvey,
    Complete,
    Timeout,
    Failed,
}

/// The three mutually exclusive status groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusGroup {
    /// Non-terminal, in progress. Eligible for reclamation.
    Working,
    /// Terminal, success.
    Complete,
    /// Terminal, failure.
    Incomplete,
}

impl ParticipantStatus {
    pub const ALL: [ParticipantStatus; 10] = [
        ParticipantStatus::Started,
        ParticipantStatus::Working,
        ParticipantStatus::WorkingFinishedConsent,
        ParticipantStatus::WorkingFinishedAttrition,
        ParticipantStatus::WorkingFinishedInstructions,
        ParticipantStatus::WorkingFinishedTask,
        ParticipantStatus::WorkingFinishedSurvey,
        ParticipantStatus::Complete,
        ParticipantStatus::Timeout,
        ParticipantStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Started => "started",
            ParticipantStatus::Working => "working",
            ParticipantStatus::WorkingFinishedConsent => "working_finished_consent",
            ParticipantStatus::WorkingFinishedAttrition => "working_finished_attrition",
            ParticipantStatus::WorkingFinishedInstructions => "working_finished_instructions",
            ParticipantStatus::WorkingFinishedTask => "working_finished_task",
            ParticipantStatus::WorkingFinishedSurvey => "working_finished_survey",
            ParticipantStatus::Complete => "complete",
            ParticipantStatus::Timeout => "timeout",
            ParticipantStatus::Failed => "failed",
        }
    }

    pub fn group(self) -> StatusGroup {
        match self {
            ParticipantStatus::Started
            | ParticipantStatus::Working
            | ParticipantStatus::WorkingFinishedConsent
            | ParticipantStatus::WorkingFinishedAttrition
            | ParticipantStatus::WorkingFinishedInstructions
            | ParticipantStatus::WorkingFinishedTask
            | ParticipantStatus::WorkingFinishedSurvey => StatusGroup::Working,
            ParticipantStatus::Complete => StatusGroup::Complete,
            ParticipantStatus::Timeout | ParticipantStatus::Failed => StatusGroup::Incomplete,
        }
    }

    pub fn is_working(self) -> bool {
        self.group() == StatusGroup::Working
    }
}

impl StatusGroup {
    /// Statuses belonging to this group, in declaration order.
    pub fn members(self) -> Vec<ParticipantStatus> {
        ParticipantStatus::ALL
            .into_iter()
            .filter(|s| s.group() == self)
            .collect()
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string that is not one of the known values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown participant status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ParticipantStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParticipantStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
