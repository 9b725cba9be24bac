use std::sync::Arc;
use std::time::Duration;

use ax_core::config::Config;
use ax_core::store::{ExecutionStore, SqliteExecutionStore};
use ax_core::types::{ExecutionRecord, ExecutionState};
use ax_daemon::daemon::Daemon;
use ax_engine::orchestrator::RESTART_REASON;
use uuid::Uuid;

fn running_record() -> ExecutionRecord {
    let mut record = ExecutionRecord::new(Uuid::new_v4(), "nightly-report");
    record.state = ExecutionState::Running;
    record
}

#[tokio::test]
async fn run_recovers_in_flight_executions_then_stops_on_shutdown() {
    let store = Arc::new(SqliteExecutionStore::new_in_memory().await.unwrap());
    let stale = running_record();
    let queued = ExecutionRecord::new(Uuid::new_v4(), "fresh");
    store.insert(&stale).await.unwrap();
    store.insert(&queued).await.unwrap();

    let daemon = Arc::new(Daemon::with_store(Config::default(), store.clone()));
    let handle = daemon.shutdown_handle();
    let runner = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run().await })
    };

    let mut recovered = None;
    for _ in 0..200 {
        let record = store.get(stale.id).await.unwrap().unwrap();
        if record.state == ExecutionState::Failed {
            recovered = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let recovered = recovered.expect("stale execution was not recovered");
    assert_eq!(recovered.error_message.as_deref(), Some(RESTART_REASON));

    let untouched = store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(untouched.state, ExecutionState::Queued);

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn new_creates_store_directory() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("executions.db");
    let mut config = Config::default();
    config.store.path = db.to_string_lossy().into_owned();

    let daemon = Daemon::new(config).await.unwrap();
    assert!(db.exists());
    assert_eq!(daemon.orchestrator().supervisor().active_count().await, 0);

    daemon.shutdown();
    daemon.run().await.unwrap();
}
