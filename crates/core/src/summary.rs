use std::collections::BTreeMap;

use cohort_storage::{ParticipantRecord, ParticipantStatus};
use serde::Serialize;

/// Participant counts per status, ordered by status name. Rows without a
/// status are counted under `None`, which sorts first.
///
/// Serializes as a list of `[status, count]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusSummary(Vec<(Option<ParticipantStatus>, usize)>);

impl StatusSummary {
    pub fn from_participants<'a, I>(participants: I) -> Self
    where
        I: IntoIterator<Item = &'a ParticipantRecord>,
    {
        let mut counts: BTreeMap<Option<&'static str>, (Option<ParticipantStatus>, usize)> =
            BTreeMap::new();
        for p in participants {
            let key = p.status.map(|s| s.as_str());
            counts.entry(key).or_insert((p.status, 0)).1 += 1;
        }
        Self(counts.into_values().collect())
    }

    pub fn entries(&self) -> &[(Option<ParticipantStatus>, usize)] {
        &self.0
    }

    pub fn count(&self, status: Option<ParticipantStatus>) -> usize {
        self.0
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }

    pub fn total(&self) -> usize {
        self.0.iter().map(|(_, n)| n).sum()
    }
}
