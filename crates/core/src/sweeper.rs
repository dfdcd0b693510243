//! Reclamation of participants who ran out of time.

use std::sync::Arc;

use cohort_storage::{
    ExperimentStorage, ParticipantChanges, ParticipantRecord, ParticipantStatus, StatusGroup,
    StorageError,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::LifecycleEngine;

/// Move every open working participant whose `start_time` is before
/// `now - allotted` to `timeout`, in a single snapshot.
///
/// Only the status is written, so an end time or data link committed by a
/// submission that lands before this sweep commits is kept. Returns the
/// transitioned records. Any store failure fails the whole batch.
pub async fn sweep<S: ExperimentStorage>(
    storage: &S,
    allotted: time::Duration,
    now: OffsetDateTime,
) -> Result<Vec<ParticipantRecord>, StorageError> {
    let Some(min_start_time) = now.checked_sub(allotted) else {
        return Ok(Vec::new());
    };
    let working = StatusGroup::Working.members();

    let mut snap = storage.begin_snapshot().await?;
    let open = storage.list_open_participants(&mut snap, &working).await?;

    let mut expired = Vec::new();
    for participant in open {
        if participant.start_time < min_start_time {
            let timed_out = storage
                .update_participant(
                    &mut snap,
                    &participant.worker_id,
                    ParticipantChanges::status(ParticipantStatus::Timeout),
                )
                .await?;
            expired.push(timed_out);
        }
    }

    if expired.is_empty() {
        storage.abort_snapshot(snap).await?;
    } else {
        storage.commit_snapshot(snap).await?;
        let workers: Vec<&str> = expired.iter().map(|p| p.worker_id.as_str()).collect();
        tracing::info!(count = expired.len(), ?workers, "participants timed out");
    }
    Ok(expired)
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("sweeper task ended abnormally: {e}");
        }
    }
}

/// Run [`sweep`] now and then every `every`, until the handle is shut down.
pub fn spawn_sweeper<S: ExperimentStorage>(
    engine: Arc<LifecycleEngine<S>>,
    every: std::time::Duration,
) -> SweeperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(every_secs = every.as_secs(), "sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = engine.reclaim().await {
                        tracing::warn!("sweep failed: {e}");
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
    });
    SweeperHandle { stop, task }
}
