//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! visible inside it, and discarded on abort or drop.

use std::future::Future;

use super::{make_data, make_participant, seed, TestResult};
use crate::{ExperimentStorage, ParticipantChanges, ParticipantStatus, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_insert_invisible_to_get",
            uncommitted_insert_invisible_to_get(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_insert_invisible_to_list",
            uncommitted_insert_invisible_to_list(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_insert_visible_inside_snapshot",
            uncommitted_insert_visible_inside_snapshot(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_update_invisible",
            uncommitted_update_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "committed_update_visible",
            committed_update_visible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_insert",
            abort_discards_insert(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "drop_discards_update",
            drop_discards_update(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_data_invisible",
            uncommitted_data_invisible(factory).await,
        ),
    ]
}

async fn uncommitted_insert_invisible_to_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;
    let result = match s.get_participant("w1").await {
        Err(StorageError::ParticipantNotFound { .. }) => Ok(()),
        other => Err(format!("expected ParticipantNotFound before commit, got {other:?}")),
    };
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    result
}

async fn uncommitted_insert_invisible_to_list<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;
    let listed = s.list_participants().await.map_err(|e| e.to_string())?;
    if !listed.is_empty() {
        return Err(format!("expected empty list, got {} rows", listed.len()));
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    let listed = s.list_participants().await.map_err(|e| e.to_string())?;
    if listed.len() != 1 {
        return Err(format!("expected 1 row after commit, got {}", listed.len()));
    }
    Ok(())
}

async fn uncommitted_insert_visible_inside_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let rec = s
        .insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;
    let found = s
        .find_participant(&mut snap, "w1")
        .await
        .map_err(|e| e.to_string())?;
    if found.as_ref() != Some(&rec) {
        return Err(format!("snapshot read {found:?}, expected {rec:?}"));
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_participant(&mut snap, "w1", ParticipantChanges::status(ParticipantStatus::Working))
        .await
        .map_err(|e| e.to_string())?;

    let outside = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if outside.status != Some(ParticipantStatus::Started) {
        return Err(format!("update leaked before commit: {:?}", outside.status));
    }
    let inside = s
        .get_participant_for_update(&mut snap, "w1")
        .await
        .map_err(|e| e.to_string())?;
    if inside.status != Some(ParticipantStatus::Working) {
        return Err(format!("snapshot did not see its own update: {:?}", inside.status));
    }
    Ok(())
}

async fn committed_update_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let rec = s
        .update_participant(
            &mut snap,
            "w1",
            ParticipantChanges::status(ParticipantStatus::WorkingFinishedConsent),
        )
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let read = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if read != rec {
        return Err(format!("read {read:?}, committed {rec:?}"));
    }
    Ok(())
}

async fn abort_discards_insert<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match s.get_participant("w1").await {
        Err(StorageError::ParticipantNotFound { .. }) => {}
        other => return Err(format!("expected ParticipantNotFound after abort, got {other:?}")),
    }
    // The worker id is free again.
    seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;
    Ok(())
}

async fn drop_discards_update<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.update_participant(&mut snap, "w1", ParticipantChanges::status(ParticipantStatus::Failed))
            .await
            .map_err(|e| e.to_string())?;
    }
    let read = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if read.status != Some(ParticipantStatus::Started) {
        return Err(format!("dropped snapshot leaked: {:?}", read.status));
    }
    Ok(())
}

async fn uncommitted_data_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let data = s
        .insert_data(&mut snap, make_data("trustworthy", 1))
        .await
        .map_err(|e| e.to_string())?;
    match s.get_data(data.id).await {
        Err(StorageError::DataNotFound { id }) if id == data.id => {}
        other => return Err(format!("expected DataNotFound before commit, got {other:?}")),
    }
    let inside = s
        .get_data_for_update(&mut snap, data.id)
        .await
        .map_err(|e| e.to_string())?;
    if inside != data {
        return Err(format!("snapshot read {inside:?}, expected {data:?}"));
    }
    Ok(())
}
