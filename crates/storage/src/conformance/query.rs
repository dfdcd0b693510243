//! Open-participant query conformance tests.
//!
//! `list_open_participants` is the reclamation predicate: no `end_time` and a
//! status in the requested set.

use std::future::Future;

use time::Duration;

use super::{make_participant, seed, TestResult, T0};
use crate::{ExperimentStorage, ParticipantChanges, ParticipantStatus, StatusGroup};

pub(super) async fn run_query_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "query",
            "open_participants_filters_by_status",
            open_participants_filters_by_status(factory).await,
        ),
        TestResult::from_result(
            "query",
            "open_participants_excludes_ended",
            open_participants_excludes_ended(factory).await,
        ),
        TestResult::from_result(
            "query",
            "open_participants_excludes_missing_status",
            open_participants_excludes_missing_status(factory).await,
        ),
        TestResult::from_result(
            "query",
            "open_participants_sees_snapshot_writes",
            open_participants_sees_snapshot_writes(factory).await,
        ),
        TestResult::from_result(
            "query",
            "list_participants_ordered_by_id",
            list_participants_ordered_by_id(factory).await,
        ),
    ]
}

async fn open_ids<S: ExperimentStorage>(s: &S) -> Result<Vec<String>, String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let rows = s
        .list_open_participants(&mut snap, &StatusGroup::Working.members())
        .await
        .map_err(|e| e.to_string())?;
    Ok(rows.into_iter().map(|p| p.worker_id).collect())
}

async fn open_participants_filters_by_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (worker, status) in [
        ("started", ParticipantStatus::Started),
        ("survey", ParticipantStatus::WorkingFinishedSurvey),
        ("complete", ParticipantStatus::Complete),
        ("timeout", ParticipantStatus::Timeout),
        ("failed", ParticipantStatus::Failed),
    ] {
        seed(&s, make_participant(worker, status)).await?;
    }
    let ids = open_ids(&s).await?;
    if ids != vec!["started".to_string(), "survey".to_string()] {
        return Err(format!("unexpected open participants: {ids:?}"));
    }
    Ok(())
}

async fn open_participants_excludes_ended<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;
    seed(&s, make_participant("w2", ParticipantStatus::Working)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_participant(
        &mut snap,
        "w1",
        ParticipantChanges {
            end_time: Some(T0 + Duration::minutes(5)),
            ..ParticipantChanges::default()
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let ids = open_ids(&s).await?;
    if ids != vec!["w2".to_string()] {
        return Err(format!("ended participant still open: {ids:?}"));
    }
    Ok(())
}

async fn open_participants_excludes_missing_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut p = make_participant("w1", ParticipantStatus::Started);
    p.status = None;
    seed(&s, p).await?;
    let ids = open_ids(&s).await?;
    if !ids.is_empty() {
        return Err(format!("participant without status listed as open: {ids:?}"));
    }
    Ok(())
}

async fn open_participants_sees_snapshot_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, make_participant("w1", ParticipantStatus::Working)).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_participant(&mut snap, "w1", ParticipantChanges::status(ParticipantStatus::Timeout))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_participant(&mut snap, make_participant("w2", ParticipantStatus::Started))
        .await
        .map_err(|e| e.to_string())?;

    let rows = s
        .list_open_participants(&mut snap, &StatusGroup::Working.members())
        .await
        .map_err(|e| e.to_string())?;
    let ids: Vec<&str> = rows.iter().map(|p| p.worker_id.as_str()).collect();
    if ids != vec!["w2"] {
        return Err(format!("snapshot view wrong: {ids:?}"));
    }
    Ok(())
}

async fn list_participants_ordered_by_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for worker in ["zeta", "alpha", "mid"] {
        seed(&s, make_participant(worker, ParticipantStatus::Started)).await?;
    }
    let rows = s.list_participants().await.map_err(|e| e.to_string())?;
    let workers: Vec<&str> = rows.iter().map(|p| p.worker_id.as_str()).collect();
    if workers != vec!["zeta", "alpha", "mid"] {
        return Err(format!("expected insertion (id) order, got {workers:?}"));
    }
    Ok(())
}
