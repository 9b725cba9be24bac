use std::sync::Arc;

use ax_core::store::{ExecutionStore, SqliteExecutionStore};
use ax_core::types::*;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn obj(value: serde_json::Value) -> JsonMap {
    value.as_object().cloned().unwrap()
}

async fn seeded(state: ExecutionState) -> (SqliteExecutionStore, ExecutionRecord) {
    let store = SqliteExecutionStore::new_in_memory().await.unwrap();
    let mut record = ExecutionRecord::new(Uuid::new_v4(), "task-1")
        .with_parameters(obj(json!({"prompt": "hi"})))
        .with_context(obj(json!({"user": "alice"})));
    record.state = state;
    store.insert(&record).await.unwrap();
    (store, record)
}

#[tokio::test]
async fn insert_and_get() {
    let (store, record) = seeded(ExecutionState::Queued).await;

    let fetched = store.get(record.id).await.unwrap().expect("record should exist");
    assert_eq!(fetched.agent_id, record.agent_id);
    assert_eq!(fetched.task_id, "task-1");
    assert_eq!(fetched.state, ExecutionState::Queued);
    assert_eq!(fetched.input_parameters["prompt"], "hi");
    assert_eq!(fetched.context["user"], "alice");
    assert!(fetched.result.is_none());
    assert!(fetched.started_at.is_none());

    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_and_counts() {
    let store = SqliteExecutionStore::new_in_memory().await.unwrap();
    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();

    for i in 0..3 {
        let record = ExecutionRecord::new(agent_a, format!("a-{i}"));
        store.insert(&record).await.unwrap();
    }
    let mut failed = ExecutionRecord::new(agent_b, "b-0");
    failed.state = ExecutionState::Failed;
    store.insert(&failed).await.unwrap();

    let (all, total) = store
        .list(&ExecutionFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(total, 4);
    // newest first
    assert_eq!(all[0].task_id, "b-0");

    let (page, total) = store
        .list(&ExecutionFilter::default().with_agent(agent_a), Pagination::new(1, 1))
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].task_id, "a-1");

    let (only_failed, total) = store
        .list(
            &ExecutionFilter::default().with_states([ExecutionState::Failed]),
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(only_failed[0].id, failed.id);

    let (by_task, _) = store
        .list(&ExecutionFilter::default().with_task("a-2"), Pagination::default())
        .await
        .unwrap();
    assert_eq!(by_task.len(), 1);
}

#[tokio::test]
async fn update_state_compare_and_swap() {
    let (store, record) = seeded(ExecutionState::Queued).await;

    let committed = store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Queued, ExecutionState::Preparing, "start"),
        )
        .await
        .unwrap()
        .expect("swap should match");
    assert_eq!(committed.record.state, ExecutionState::Preparing);
    assert_eq!(committed.transition.previous_state, Some(ExecutionState::Queued));
    assert_eq!(committed.transition.new_state, ExecutionState::Preparing);

    // Stale expectation loses.
    let missed = store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Queued, ExecutionState::Cancelled, "stale"),
        )
        .await
        .unwrap();
    assert!(missed.is_none());
    let fetched = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(fetched.state, ExecutionState::Preparing);
}

#[tokio::test]
async fn update_state_writes_history_in_the_same_commit() {
    let (store, record) = seeded(ExecutionState::Running).await;

    let committed = store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Running, ExecutionState::Paused, "operator hold"),
        )
        .await
        .unwrap()
        .unwrap();

    let rows = store.history(record.id, 10).await.unwrap();
    assert_eq!(rows, vec![committed.transition]);
    assert_eq!(rows[0].reason, "operator hold");

    // A missed swap leaves no history behind.
    store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Running, ExecutionState::Failed, "late"),
        )
        .await
        .unwrap();
    assert_eq!(store.history(record.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_swaps_have_one_winner() {
    let (store, record) = seeded(ExecutionState::Running).await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for target in [
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
        ExecutionState::Paused,
    ] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .update_state(
                    record.id,
                    StateChange::new(ExecutionState::Running, target, "race"),
                )
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.history(record.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn timestamps_are_set_once() {
    let (store, record) = seeded(ExecutionState::Preparing).await;
    let first = Utc::now();

    let running = store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Preparing, ExecutionState::Running, "run")
                .with_timestamps(TimestampPatch {
                    started_at: Some(first),
                    completed_at: None,
                }),
        )
        .await
        .unwrap()
        .unwrap();
    let started = running.record.started_at.expect("started_at set");

    let later = first + chrono::Duration::seconds(30);
    store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Running, ExecutionState::Paused, "hold"),
        )
        .await
        .unwrap()
        .unwrap();
    let resumed = store
        .update_state(
            record.id,
            StateChange::new(ExecutionState::Paused, ExecutionState::Running, "go")
                .with_timestamps(TimestampPatch {
                    started_at: Some(later),
                    completed_at: None,
                }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.record.started_at, Some(started));
}

#[tokio::test]
async fn progress_respects_allowed_states() {
    let (store, record) = seeded(ExecutionState::Running).await;

    let patch = ProgressPatch {
        percentage: 40.0,
        message: Some("halfway-ish".into()),
        context_patch: Some(obj(json!({"progress_steps": {"current": "fetch"}}))),
    };
    let updated = store
        .update_progress(record.id, patch, &[ExecutionState::Running])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.progress_percentage, 40.0);
    assert_eq!(updated.status_message.as_deref(), Some("halfway-ish"));
    assert_eq!(updated.context["user"], "alice");
    assert_eq!(updated.step_progress().current.as_deref(), Some("fetch"));

    // Message is kept when not supplied.
    let kept = store
        .update_progress(
            record.id,
            ProgressPatch {
                percentage: 45.0,
                message: None,
                context_patch: None,
            },
            &[ExecutionState::Running],
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.status_message.as_deref(), Some("halfway-ish"));

    let rejected = store
        .update_progress(
            record.id,
            ProgressPatch {
                percentage: 90.0,
                message: None,
                context_patch: None,
            },
            &[ExecutionState::Preparing],
        )
        .await
        .unwrap();
    assert!(rejected.is_none());
    let fetched = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(fetched.progress_percentage, 45.0);
}

#[tokio::test]
async fn result_and_context_updates() {
    let (store, record) = seeded(ExecutionState::Running).await;

    let with_result = store
        .update_result(record.id, Some(obj(json!({"answer": 42}))), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(with_result.result.unwrap()["answer"], 42);

    // Error-only update keeps the stored result.
    let with_error = store
        .update_result(record.id, None, Some("boom".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(with_error.error_message.as_deref(), Some("boom"));
    assert!(with_error.result.is_some());

    let merged = store
        .merge_context(record.id, obj(json!({"submitted_by": "worker"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.context["user"], "alice");
    assert_eq!(merged.context["submitted_by"], "worker");

    assert!(store
        .merge_context(Uuid::new_v4(), JsonMap::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn requeue_failed_bumps_count_and_records_history() {
    let (store, record) = seeded(ExecutionState::Failed).await;
    store
        .update_result(record.id, None, Some("remote timeout".into()))
        .await
        .unwrap();

    let committed = store
        .requeue_failed(record.id, 0, "retry 1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(committed.record.state, ExecutionState::Queued);
    assert_eq!(committed.record.retry_count, 1);
    assert!(committed.record.error_message.is_none());

    let rows = store.history(record.id, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].previous_state, Some(ExecutionState::Failed));
    assert_eq!(rows[0].new_state, ExecutionState::Queued);
    assert_eq!(rows[0].reason, "retry 1");

    // Already requeued: a second attempt matches nothing.
    assert!(store
        .requeue_failed(record.id, 0, "retry 1")
        .await
        .unwrap()
        .is_none());

    let (other, running) = seeded(ExecutionState::Running).await;
    assert!(other
        .requeue_failed(running.id, 0, "retry 1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn requeue_failed_requires_the_seen_retry_count() {
    let (store, mut record) = {
        let store = SqliteExecutionStore::new_in_memory().await.unwrap();
        let mut record = ExecutionRecord::new(Uuid::new_v4(), "task-1");
        record.state = ExecutionState::Failed;
        record.retry_count = 2;
        store.insert(&record).await.unwrap();
        (store, record)
    };

    assert!(store
        .requeue_failed(record.id, 1, "retry 2")
        .await
        .unwrap()
        .is_none());
    record = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(record.state, ExecutionState::Failed);
    assert_eq!(record.retry_count, 2);

    let committed = store
        .requeue_failed(record.id, 2, "retry 3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(committed.record.retry_count, 3);
}

#[tokio::test]
async fn history_is_newest_first_and_limited() {
    let (store, record) = seeded(ExecutionState::Queued).await;

    store
        .append_history(record.id, Some(ExecutionState::Queued), ExecutionState::Preparing, "start")
        .await
        .unwrap();
    store
        .append_history(record.id, Some(ExecutionState::Preparing), ExecutionState::Running, "go")
        .await
        .unwrap();
    store
        .append_history(record.id, Some(ExecutionState::Running), ExecutionState::Completed, "done")
        .await
        .unwrap();

    let rows = store.history(record.id, 10).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].new_state, ExecutionState::Completed);
    assert_eq!(rows[2].previous_state, Some(ExecutionState::Queued));

    let limited = store.history(record.id, 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[1].reason, "go");
}

#[tokio::test]
async fn delete_cascades_history() {
    let (store, record) = seeded(ExecutionState::Queued).await;
    store
        .append_history(record.id, None, ExecutionState::Queued, "created")
        .await
        .unwrap();

    assert!(store.delete(record.id).await.unwrap());
    assert!(store.get(record.id).await.unwrap().is_none());
    assert!(store.history(record.id, 10).await.unwrap().is_empty());
    assert!(!store.delete(record.id).await.unwrap());
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");
    let record = ExecutionRecord::new(Uuid::new_v4(), "persisted");
    {
        let store = SqliteExecutionStore::new(&path).await.unwrap();
        store.insert(&record).await.unwrap();
    }
    let store = SqliteExecutionStore::new(&path).await.unwrap();
    let fetched = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(fetched.task_id, "persisted");
}
