use std::future::Future;
use std::sync::Arc;

use super::{make_data, make_participant, seed, TestResult};
use crate::{ExperimentStorage, ParticipantChanges, ParticipantStatus, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_registration_exactly_one_wins",
            concurrent_registration_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_updates_last_writer_wins",
            concurrent_updates_last_writer_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "sweep_after_submission_keeps_link",
            sweep_after_submission_keeps_link(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_registrations_different_workers_all_succeed",
            concurrent_registrations_different_workers_all_succeed(factory).await,
        ),
    ]
}

// ── Concurrent registration: exactly one wins ───────────────────────────────

/// N tasks each stage a registration for the same worker before any of them
/// commits. Exactly one commit succeeds; the rest get AlreadyRegistered.
async fn concurrent_registration_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    // Stage all inserts first so every snapshot saw the worker as absent.
    let mut staged = Vec::new();
    for _ in 0..N {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
            .await
            .map_err(|e| format!("stage: {e}"))?;
        staged.push(snap);
    }

    let mut handles = Vec::new();
    for snap in staged {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match s.commit_snapshot(snap).await {
                Ok(()) => Ok(true),
                Err(StorageError::AlreadyRegistered { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let rows = storage
        .list_participants()
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != 1 {
        return Err(format!("expected 1 participant row, got {}", rows.len()));
    }
    Ok(())
}

// ── Concurrent updates: no conflict detection ───────────────────────────────

/// N tasks read the same participant and each write a different status.
/// Every commit succeeds and the stored status is one of the written values.
async fn concurrent_updates_last_writer_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed(storage.as_ref(), make_participant("w1", ParticipantStatus::Started)).await?;

    let statuses = [
        ParticipantStatus::Working,
        ParticipantStatus::WorkingFinishedConsent,
        ParticipantStatus::WorkingFinishedTask,
    ];

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let status = statuses[i % statuses.len()];
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.get_participant_for_update(&mut snap, "w1").await?;
            s.update_participant(&mut snap, "w1", ParticipantChanges::status(status))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("update failed: {e}"))?;
    }

    let rec = storage
        .get_participant("w1")
        .await
        .map_err(|e| e.to_string())?;
    match rec.status {
        Some(s) if statuses.contains(&s) => Ok(()),
        other => Err(format!("final status {other:?} was never written")),
    }
}

// ── Interleaved updates: untouched columns survive ──────────────────────────

/// A timeout staged before a completion commits, and committed after it,
/// changes the status but keeps the end time and data link the completion
/// wrote.
async fn sweep_after_submission_keeps_link<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;

    let mut sweep = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_participant(&mut sweep, "w1", ParticipantChanges::status(ParticipantStatus::Timeout))
        .await
        .map_err(|e| format!("stage timeout: {e}"))?;

    let mut submit = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let data = s
        .insert_data(&mut submit, make_data("trustworthy", 1))
        .await
        .map_err(|e| e.to_string())?;
    let ended = time::OffsetDateTime::now_utc();
    s.update_participant(
        &mut submit,
        "w1",
        ParticipantChanges {
            status: Some(ParticipantStatus::Complete),
            end_time: Some(ended),
            data_id: Some(data.id),
            ..ParticipantChanges::default()
        },
    )
    .await
    .map_err(|e| format!("stage completion: {e}"))?;
    s.commit_snapshot(submit).await.map_err(|e| e.to_string())?;

    s.commit_snapshot(sweep)
        .await
        .map_err(|e| format!("commit timeout: {e}"))?;

    let rec = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if rec.data_id != Some(data.id) {
        return Err(format!("data link lost: {:?}", rec.data_id));
    }
    if rec.end_time.is_none() {
        return Err("end_time lost".to_string());
    }
    if rec.status != Some(ParticipantStatus::Timeout) {
        return Err(format!("expected last-written status timeout, got {:?}", rec.status));
    }
    Ok(())
}

async fn concurrent_registrations_different_workers_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let rec = s
                .insert_participant(
                    &mut snap,
                    make_participant(&format!("w{i}"), ParticipantStatus::Started),
                )
                .await?;
            s.commit_snapshot(snap).await?;
            Ok::<i64, StorageError>(rec.id)
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(
            handle
                .await
                .map_err(|e| format!("task panic: {e}"))?
                .map_err(|e| format!("registration failed: {e}"))?,
        );
    }
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != N {
        return Err(format!("expected {N} distinct ids, got {}", ids.len()));
    }
    let rows = storage
        .list_participants()
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != N {
        return Err(format!("expected {N} rows, got {}", rows.len()));
    }
    Ok(())
}
