//! Atomic commit conformance tests.
//!
//! A snapshot's writes land together or not at all.

use std::future::Future;

use super::{make_data, make_participant, seed, TestResult};
use crate::{ExperimentStorage, ParticipantChanges, ParticipantStatus, StorageError};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "multi_record_commit_all_visible",
            multi_record_commit_all_visible(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "failed_commit_applies_nothing",
            failed_commit_applies_nothing(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "data_back_reference_update_visible",
            data_back_reference_update_visible(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "empty_commit_succeeds",
            empty_commit_succeeds(factory).await,
        ),
    ]
}

/// Insert data and link it to a participant in the same snapshot.
async fn multi_record_commit_all_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut data_in = make_data("trustworthy", 2);
    data_in.worker_id = Some("w1".to_string());
    let data = s
        .insert_data(&mut snap, data_in)
        .await
        .map_err(|e| e.to_string())?;
    s.update_participant(
        &mut snap,
        "w1",
        ParticipantChanges {
            status: Some(ParticipantStatus::Complete),
            data_id: Some(data.id),
            ..ParticipantChanges::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let p = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if p.data_id != Some(data.id) || p.status != Some(ParticipantStatus::Complete) {
        return Err(format!("participant not linked: {p:?}"));
    }
    let d = s.get_data(data.id).await.map_err(|e| e.to_string())?;
    if d.worker_id.as_deref() != Some("w1") {
        return Err(format!("data worker_id: {:?}", d.worker_id));
    }
    Ok(())
}

/// A snapshot whose registration loses to a concurrent commit fails as a
/// whole, so the data it staged never appears.
async fn failed_commit_applies_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;

    let mut loser = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let data = s
        .insert_data(&mut loser, make_data("trustworthy", 1))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_participant(&mut loser, make_participant("w1", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;

    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;

    match s.commit_snapshot(loser).await {
        Err(StorageError::AlreadyRegistered { .. }) => {}
        other => return Err(format!("expected AlreadyRegistered on commit, got {other:?}")),
    }
    match s.get_data(data.id).await {
        Err(StorageError::DataNotFound { .. }) => {}
        other => return Err(format!("data from failed commit is visible: {other:?}")),
    }
    let p = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if p.status != Some(ParticipantStatus::Working) {
        return Err(format!("winner overwritten: {:?}", p.status));
    }
    Ok(())
}

async fn data_back_reference_update_visible<S, F, Fut>(factory: &F) -> Result<(), String>
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
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut d = s
        .get_data_for_update(&mut snap, data.id)
        .await
        .map_err(|e| e.to_string())?;
    d.worker_id = Some("w9".to_string());
    s.update_data(&mut snap, d)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let d = s.get_data(data.id).await.map_err(|e| e.to_string())?;
    if d.worker_id.as_deref() != Some("w9") || d.json_data != data.json_data {
        return Err(format!("unexpected data after update: {d:?}"));
    }
    Ok(())
}

async fn empty_commit_succeeds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}
