//! End-to-end lifecycle scenarios against both storage backends.

use std::sync::Arc;

use cohort_core::{
    sweep, ExperimentStorage, LifecycleEngine, NewParticipant, ParticipantDataIn, ParticipantIn,
    ParticipantStatus, ParticipantUpdate, Settings, StatusGroup, TrialRecord,
};
use cohort_storage::{MemoryStorage, ParticipantChanges, SqliteStorage, StorageError};
use time::{Duration, OffsetDateTime};

fn memory_engine() -> LifecycleEngine<MemoryStorage> {
    LifecycleEngine::new(Arc::new(MemoryStorage::new()), Arc::new(Settings::default()))
}

async fn sqlite_engine(dir: &tempfile::TempDir) -> LifecycleEngine<SqliteStorage> {
    let storage = SqliteStorage::open(dir.path().join("cohort.db")).unwrap();
    storage.create_tables().await.unwrap();
    LifecycleEngine::new(Arc::new(storage), Arc::new(Settings::default()))
}

fn arrival(worker: &str) -> ParticipantIn {
    ParticipantIn {
        worker_id: worker.to_string(),
        hit_id: "H1".to_string(),
        assignment_id: "A1".to_string(),
        platform: "prolific".to_string(),
    }
}

fn trial(key: &str, value: &str) -> TrialRecord {
    let mut t = TrialRecord::new();
    t.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    t
}

async fn seed_aged<S: ExperimentStorage>(
    engine: &LifecycleEngine<S>,
    worker: &str,
    status: ParticipantStatus,
    started: OffsetDateTime,
) {
    let mut p = NewParticipant::started(worker);
    p.status = Some(status);
    p.start_time = started;
    engine.register(p).await.unwrap();
}

async fn w1_scenario<S: ExperimentStorage>(engine: LifecycleEngine<S>) {
    let config = engine.initiate(arrival("W1")).await.unwrap();
    assert_eq!(config.status, Some(ParticipantStatus::Started));

    let rec = engine
        .update_status(ParticipantUpdate::status(
            "W1",
            ParticipantStatus::WorkingFinishedConsent,
        ))
        .await
        .unwrap();
    assert_eq!(rec.status, Some(ParticipantStatus::WorkingFinishedConsent));
    assert_eq!(rec.end_time, None);

    engine
        .submit_data(ParticipantDataIn {
            worker_id: "W1".to_string(),
            condition: Some("trustworthy".to_string()),
            json_data: vec![trial("entry_1", "x")],
        })
        .await
        .unwrap();

    let done = engine.storage().get_participant("W1").await.unwrap();
    assert_eq!(done.status, Some(ParticipantStatus::Complete));
    assert!(done.end_time.is_some());
    let data_id = done.data_id.expect("data linked");

    let data = engine.data_for("W1").await.unwrap().expect("data stored");
    assert_eq!(data.id, data_id);
    assert_eq!(data.worker_id.as_deref(), Some("W1"));
    assert_eq!(data.condition.as_deref(), Some("trustworthy"));
    assert_eq!(data.json_data, vec![trial("entry_1", "x")]);
}

#[tokio::test]
async fn w1_end_to_end_memory() {
    w1_scenario(memory_engine()).await;
}

#[tokio::test]
async fn w1_end_to_end_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    w1_scenario(sqlite_engine(&dir).await).await;
}

#[tokio::test]
async fn initiate_is_idempotent() {
    let engine = memory_engine();
    let first = engine.initiate(arrival("w1")).await.unwrap();

    let mut again = arrival("w1");
    again.platform = "mturk".to_string();
    let second = engine.initiate(again).await.unwrap();

    assert_eq!(first.condition, second.condition);
    assert_eq!(first.status, second.status);
    assert_eq!(first, second);
    let rows = engine.list_participants().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].platform.as_deref(), Some("prolific"));
}

#[tokio::test]
async fn initiate_returns_progress_of_returning_worker() {
    let engine = memory_engine();
    engine.initiate(arrival("w1")).await.unwrap();
    engine
        .update_status(ParticipantUpdate::status("w1", ParticipantStatus::Working))
        .await
        .unwrap();
    let config = engine.initiate(arrival("w1")).await.unwrap();
    assert_eq!(config.status, Some(ParticipantStatus::Working));
}

#[tokio::test]
async fn concurrent_initiates_create_one_participant() {
    let engine = Arc::new(memory_engine());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(
            async move { engine.initiate(arrival("w1")).await },
        ));
    }
    for handle in handles {
        let config = handle.await.unwrap().unwrap();
        assert_eq!(config.worker_id, "w1");
    }
    assert_eq!(engine.list_participants().await.unwrap().len(), 1);
}

#[tokio::test]
async fn complete_participant_is_immutable() {
    let engine = memory_engine();
    engine.initiate(arrival("w1")).await.unwrap();
    engine
        .submit_data(ParticipantDataIn {
            worker_id: "w1".to_string(),
            condition: None,
            json_data: vec![],
        })
        .await
        .unwrap();
    let before = engine.storage().get_participant("w1").await.unwrap();

    let mut update = ParticipantUpdate::status("w1", ParticipantStatus::Failed);
    update.end_time = Some(OffsetDateTime::now_utc());
    update.data_id = Some(999);
    let returned = engine.update_status(update).await.unwrap();

    assert_eq!(returned, before);
    assert_eq!(engine.storage().get_participant("w1").await.unwrap(), before);
}

#[tokio::test]
async fn update_sets_only_provided_fields() {
    let engine = memory_engine();
    engine.initiate(arrival("w1")).await.unwrap();
    let before = engine.storage().get_participant("w1").await.unwrap();

    let end = OffsetDateTime::now_utc();
    let mut update = ParticipantUpdate::status("w1", ParticipantStatus::Failed);
    update.end_time = Some(end);
    let after = engine.update_status(update).await.unwrap();

    assert_eq!(after.status, Some(ParticipantStatus::Failed));
    assert_eq!(after.start_time, before.start_time);
    assert_eq!(after.end_time, Some(end));
    assert_eq!(after.condition, before.condition);
    assert_eq!(after.data_id, None);
}

#[tokio::test]
async fn expiry_scenario() {
    let engine = memory_engine();
    let now = OffsetDateTime::now_utc();
    seed_aged(&engine, "old", ParticipantStatus::Working, now - Duration::seconds(4000)).await;
    seed_aged(&engine, "fresh", ParticipantStatus::Working, now - Duration::seconds(100)).await;

    let expired = sweep(engine.storage().as_ref(), Duration::seconds(3600), now)
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].worker_id, "old");

    let old = engine.storage().get_participant("old").await.unwrap();
    assert_eq!(old.status, Some(ParticipantStatus::Timeout));
    let fresh = engine.storage().get_participant("fresh").await.unwrap();
    assert_eq!(fresh.status, Some(ParticipantStatus::Working));
}

#[tokio::test]
async fn timeout_applies_to_every_working_status() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir).await;
    let now = OffsetDateTime::now_utc();
    let working = StatusGroup::Working.members();
    for (i, status) in working.iter().enumerate() {
        seed_aged(&engine, &format!("old{i}"), *status, now - Duration::hours(2)).await;
        seed_aged(&engine, &format!("new{i}"), *status, now - Duration::minutes(5)).await;
    }

    let expired = engine.reclaim().await.unwrap();
    assert_eq!(expired.len(), working.len());

    for (i, status) in working.iter().enumerate() {
        let old = engine.storage().get_participant(&format!("old{i}")).await.unwrap();
        assert_eq!(old.status, Some(ParticipantStatus::Timeout));
        let new = engine.storage().get_participant(&format!("new{i}")).await.unwrap();
        assert_eq!(new.status, Some(*status));
    }
}

#[tokio::test]
async fn summary_counts_sum_to_total() {
    let engine = memory_engine();
    let now = OffsetDateTime::now_utc();
    for (i, status) in ParticipantStatus::ALL.iter().enumerate() {
        for j in 0..=i {
            seed_aged(&engine, &format!("w{i}-{j}"), *status, now).await;
        }
    }
    let mut unset = NewParticipant::started("legacy");
    unset.status = None;
    engine.register(unset).await.unwrap();

    let summary = engine.status_summary().await.unwrap();
    let total = engine.list_participants().await.unwrap().len();
    assert_eq!(summary.total(), total);
    assert_eq!(summary.entries()[0], (None, 1));
    assert_eq!(summary.count(Some(ParticipantStatus::Started)), 1);

    let names: Vec<&str> = summary
        .entries()
        .iter()
        .filter_map(|(s, _)| s.map(|s| s.as_str()))
        .collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
}

#[test]
fn every_status_is_in_exactly_one_group() {
    let groups = [StatusGroup::Working, StatusGroup::Complete, StatusGroup::Incomplete];
    for status in ParticipantStatus::ALL {
        let owners: Vec<_> = groups
            .iter()
            .filter(|g| g.members().contains(&status))
            .collect();
        assert_eq!(owners.len(), 1, "{status} belongs to {owners:?}");
        assert_eq!(*owners[0], status.group());
    }
}

#[tokio::test]
async fn submit_data_completes_any_status() {
    let engine = memory_engine();
    seed_aged(&engine, "w1", ParticipantStatus::Timeout, OffsetDateTime::now_utc()).await;
    engine
        .submit_data(ParticipantDataIn {
            worker_id: "w1".to_string(),
            condition: Some("trustworthy".to_string()),
            json_data: vec![trial("rating", "4"), trial("rating", "2")],
        })
        .await
        .unwrap();
    let rec = engine.storage().get_participant("w1").await.unwrap();
    assert_eq!(rec.status, Some(ParticipantStatus::Complete));
    let data = engine.storage().get_data(rec.data_id.unwrap()).await.unwrap();
    assert_eq!(data.worker_id.as_deref(), Some("w1"));
    assert_eq!(data.json_data.len(), 2);
}

#[tokio::test]
async fn submit_data_for_unknown_worker_leaves_unlinked_data() {
    let engine = memory_engine();
    let err = engine
        .submit_data(ParticipantDataIn {
            worker_id: "ghost".to_string(),
            condition: None,
            json_data: vec![trial("entry_1", "x")],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        cohort_core::LifecycleError::ParticipantNotFound { .. }
    ));
    let data = engine.storage().list_data().await.unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].worker_id, None);
}

/// A sweep reads a working participant, then a submission completes them
/// before the sweep commits. The late timeout must not unlink the data.
async fn sweep_racing_submission<S: ExperimentStorage>(engine: LifecycleEngine<S>) {
    let started = OffsetDateTime::now_utc() - Duration::hours(2);
    seed_aged(&engine, "w1", ParticipantStatus::Working, started).await;

    let storage = engine.storage();
    let mut sweep_snap = storage.begin_snapshot().await.unwrap();
    let open = storage
        .list_open_participants(&mut sweep_snap, &StatusGroup::Working.members())
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    storage
        .update_participant(
            &mut sweep_snap,
            "w1",
            ParticipantChanges::status(ParticipantStatus::Timeout),
        )
        .await
        .unwrap();

    engine
        .submit_data(ParticipantDataIn {
            worker_id: "w1".to_string(),
            condition: Some("trustworthy".to_string()),
            json_data: vec![trial("entry_1", "x")],
        })
        .await
        .unwrap();
    let completed = storage.get_participant("w1").await.unwrap();
    let data_id = completed.data_id.expect("submission links data");

    storage.commit_snapshot(sweep_snap).await.unwrap();

    let rec = storage.get_participant("w1").await.unwrap();
    assert_eq!(rec.data_id, Some(data_id), "data link lost");
    assert_eq!(rec.end_time, completed.end_time);
    assert_eq!(rec.status, Some(ParticipantStatus::Timeout));
    let data = engine.data_for("w1").await.unwrap().unwrap();
    assert_eq!(data.worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn sweep_racing_submission_memory() {
    sweep_racing_submission(memory_engine()).await;
}

#[tokio::test]
async fn sweep_racing_submission_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    sweep_racing_submission(sqlite_engine(&dir).await).await;
}

/// Both backends refuse a status update that links a data record which does
/// not exist, and leave the participant untouched.
async fn unknown_data_id_is_rejected<S: ExperimentStorage>(engine: LifecycleEngine<S>) {
    engine.initiate(arrival("w1")).await.unwrap();
    let mut update = ParticipantUpdate::status("w1", ParticipantStatus::WorkingFinishedTask);
    update.data_id = Some(999);
    let err = engine.update_status(update).await.unwrap_err();
    assert!(
        matches!(
            err,
            cohort_core::LifecycleError::Storage(StorageError::DataNotFound { id: 999 })
        ),
        "{err:?}"
    );
    let rec = engine.storage().get_participant("w1").await.unwrap();
    assert_eq!(rec.status, Some(ParticipantStatus::Started));
    assert_eq!(rec.data_id, None);
}

#[tokio::test]
async fn unknown_data_id_is_rejected_memory() {
    unknown_data_id_is_rejected(memory_engine()).await;
}

#[tokio::test]
async fn unknown_data_id_is_rejected_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    unknown_data_id_is_rejected(sqlite_engine(&dir).await).await;
}
