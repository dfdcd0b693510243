//! Error variant conformance tests.

use std::future::Future;

use super::{make_participant, seed, TestResult};
use crate::{DataRecord, ExperimentStorage, ParticipantChanges, ParticipantStatus, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "error",
            "get_unknown_participant_not_found",
            get_unknown_participant_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "get_for_update_unknown_participant_not_found",
            get_for_update_unknown_participant_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "update_unknown_participant_not_found",
            update_unknown_participant_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "update_with_unknown_data_id",
            update_with_unknown_data_id(factory).await,
        ),
        TestResult::from_result(
            "error",
            "unknown_data_not_found",
            unknown_data_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "find_unknown_participant_is_none",
            find_unknown_participant_is_none(factory).await,
        ),
    ]
}

async fn get_unknown_participant_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_participant("ghost").await {
        Err(StorageError::ParticipantNotFound { worker_id }) if worker_id == "ghost" => Ok(()),
        other => Err(format!("expected ParticipantNotFound(ghost), got {other:?}")),
    }
}

async fn get_for_update_unknown_participant_not_found<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    match s.get_participant_for_update(&mut snap, "ghost").await {
        Err(StorageError::ParticipantNotFound { .. }) => Ok(()),
        other => Err(format!("expected ParticipantNotFound, got {other:?}")),
    }
}

async fn update_unknown_participant_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let changes = ParticipantChanges::status(ParticipantStatus::Working);
    match s.update_participant(&mut snap, "ghost", changes).await {
        Err(StorageError::ParticipantNotFound { worker_id }) if worker_id == "ghost" => Ok(()),
        other => Err(format!("expected ParticipantNotFound(ghost), got {other:?}")),
    }
}

/// Linking a participant to a data record that does not exist is refused
/// when staged, and the stored participant is left as it was.
async fn update_with_unknown_data_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let changes = ParticipantChanges {
        status: Some(ParticipantStatus::Complete),
        data_id: Some(999),
        ..ParticipantChanges::default()
    };
    match s.update_participant(&mut snap, "w1", changes).await {
        Err(StorageError::DataNotFound { id: 999 }) => {}
        other => return Err(format!("expected DataNotFound(999), got {other:?}")),
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rec = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if rec.data_id.is_some() || rec.status != Some(ParticipantStatus::Working) {
        return Err(format!("refused update leaked: {rec:?}"));
    }
    Ok(())
}

async fn unknown_data_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_data(42).await {
        Err(StorageError::DataNotFound { id: 42 }) => {}
        other => return Err(format!("expected DataNotFound(42), got {other:?}")),
    }
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let phantom = DataRecord {
        id: 42,
        worker_id: None,
        condition: None,
        json_data: Vec::new(),
    };
    match s.update_data(&mut snap, phantom).await {
        Err(StorageError::DataNotFound { id: 42 }) => Ok(()),
        other => Err(format!("expected DataNotFound(42) on update, got {other:?}")),
    }
}

async fn find_unknown_participant_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    match s.find_participant(&mut snap, "ghost").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {other:?}")),
    }
}
