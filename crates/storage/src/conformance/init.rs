use std::future::Future;

use super::{make_data, make_participant, seed, TestResult, T0};
use crate::{ExperimentStorage, ParticipantStatus, StorageError};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "init",
            "insert_returns_record_with_given_fields",
            insert_returns_record_with_given_fields(factory).await,
        ),
        TestResult::from_result(
            "init",
            "insert_assigns_increasing_ids",
            insert_assigns_increasing_ids(factory).await,
        ),
        TestResult::from_result(
            "init",
            "inserted_participant_readable_after_commit",
            inserted_participant_readable_after_commit(factory).await,
        ),
        TestResult::from_result(
            "init",
            "double_insert_returns_already_registered",
            double_insert_returns_already_registered(factory).await,
        ),
        TestResult::from_result(
            "init",
            "double_insert_across_snapshots",
            double_insert_across_snapshots(factory).await,
        ),
        TestResult::from_result(
            "init",
            "insert_data_round_trips_trials_in_order",
            insert_data_round_trips_trials_in_order(factory).await,
        ),
        TestResult::from_result(
            "init",
            "missing_status_is_preserved",
            missing_status_is_preserved(factory).await,
        ),
    ]
}

// ── Test implementations ──────────────────────────────────────────────────────

async fn insert_returns_record_with_given_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;
    if rec.worker_id != "w1" || rec.platform.as_deref() != Some("prolific") {
        return Err(format!("unexpected record: {rec:?}"));
    }
    if rec.start_time != T0 {
        return Err(format!("start_time changed to {}", rec.start_time));
    }
    if rec.end_time.is_some() || rec.data_id.is_some() {
        return Err("new participant must have no end_time and no data_id".to_string());
    }
    if rec.status != Some(ParticipantStatus::Started) {
        return Err(format!("expected started, got {:?}", rec.status));
    }
    Ok(())
}

async fn insert_assigns_increasing_ids<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;
    let b = seed(&s, make_participant("w2", ParticipantStatus::Started)).await?;
    if b.id <= a.id {
        return Err(format!("ids not increasing: {} then {}", a.id, b.id));
    }
    Ok(())
}

async fn inserted_participant_readable_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let rec = seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;
    let read = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if read != rec {
        return Err(format!("read {read:?}, inserted {rec:?}"));
    }
    Ok(())
}

async fn double_insert_returns_already_registered<S, F, Fut>(factory: &F) -> Result<(), String>
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
    match s
        .insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
    {
        Err(StorageError::AlreadyRegistered { worker_id }) if worker_id == "w1" => Ok(()),
        other => Err(format!("expected AlreadyRegistered(w1), got {other:?}")),
    }
}

async fn double_insert_across_snapshots<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Started)).await?;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    match s
        .insert_participant(&mut snap, make_participant("w1", ParticipantStatus::Started))
        .await
    {
        Err(StorageError::AlreadyRegistered { .. }) => Ok(()),
        other => Err(format!("expected AlreadyRegistered, got {other:?}")),
    }
}

async fn insert_data_round_trips_trials_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let data = s
        .insert_data(&mut snap, make_data("trustworthy", 3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let read = s.get_data(data.id).await.map_err(|e| e.to_string())?;
    let order: Vec<i64> = read
        .json_data
        .iter()
        .filter_map(|t| t.get("trial_index").and_then(|v| v.as_i64()))
        .collect();
    if order != vec![0, 1, 2] {
        return Err(format!("trial order not preserved: {order:?}"));
    }
    if read.worker_id.is_some() {
        return Err("worker_id must stay unset until back-filled".to_string());
    }
    Ok(())
}

async fn missing_status_is_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut p = make_participant("w1", ParticipantStatus::Started);
    p.status = None;
    seed(&s, p).await?;
    let read = s.get_participant("w1").await.map_err(|e| e.to_string())?;
    if read.status.is_some() {
        return Err(format!("expected no status, got {:?}", read.status));
    }
    Ok(())
}
