//! Conformance test suite for `ExperimentStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `ExperimentStorage` implementation can run to verify correctness. The
//! suite covers:
//!
//! - **Registration**: participant creation, id assignment, duplicate detection
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Atomic commit**: all-or-nothing semantics for multi-record snapshots
//! - **Open-participant queries**: the reclamation predicate
//! - **Error handling**: correct error variants for invalid operations
//! - **Concurrency**: racing registrations, last-writer-wins status updates,
//!   and interleaved updates that must not revert each other's columns
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use cohort_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         SqliteStorage::open_in_memory().unwrap()
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod error;
mod init;
mod query;
mod snapshot;

use std::fmt;
use std::future::Future;

use time::macros::datetime;
use time::OffsetDateTime;

use crate::record::{NewData, NewParticipant, ParticipantRecord, TrialRecord};
use crate::status::ParticipantStatus;
use crate::ExperimentStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "snapshot", "commit").
    pub category: String,
    /// Test name (e.g. "insert_assigns_increasing_ids").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ExperimentStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(query::run_query_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors and shortcuts ───────────────────────────────

const T0: OffsetDateTime = datetime!(2024-01-03 12:00 UTC);

fn make_participant(worker_id: &str, status: ParticipantStatus) -> NewParticipant {
    NewParticipant {
        worker_id: worker_id.to_string(),
        hit_id: Some("study-1".to_string()),
        assignment_id: Some(format!("session-{worker_id}")),
        platform: Some("prolific".to_string()),
        condition: Some("trustworthy".to_string()),
        start_time: T0,
        status: Some(status),
    }
}

fn make_data(condition: &str, trials: usize) -> NewData {
    let json_data = (0..trials)
        .map(|i| {
            let mut trial = TrialRecord::new();
            trial.insert("trial_index".to_string(), serde_json::json!(i));
            trial.insert("response".to_string(), serde_json::json!(format!("r{i}")));
            trial
        })
        .collect();
    NewData {
        worker_id: None,
        condition: Some(condition.to_string()),
        json_data,
    }
}

/// Insert and commit a participant in its own snapshot.
async fn seed<S: ExperimentStorage>(
    s: &S,
    participant: NewParticipant,
) -> Result<ParticipantRecord, String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let rec = s
        .insert_participant(&mut snap, participant)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    Ok(rec)
}
