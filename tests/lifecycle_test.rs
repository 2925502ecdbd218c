mod helpers;

use hindsight::db::manager::DatabaseManager;
use hindsight::db::{self, Database};
use hindsight::lifecycle::process::ProcessRegistry;
use hindsight::lifecycle::shutdown::{GracefulShutdown, StepStatus};
use hindsight::lifecycle::DaemonState;
use hindsight::memory::queue;
use hindsight::memory::types::ObservationPayload;
use hindsight::server;
use hindsight::vector::noop::NoopVectorIndex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use helpers::{observation_xml, session_manager, wait_until, worker_config, FakeProvider};

fn file_store(dir: &TempDir) -> DatabaseManager {
    let db = Database::open(dir.path().join("hindsight.db")).unwrap();
    DatabaseManager::from_parts(db, Arc::new(NoopVectorIndex))
}

fn edit() -> ObservationPayload {
    ObservationPayload {
        tool_name: "Edit".into(),
        tool_input: serde_json::json!({ "file_path": "src/main.rs" }),
        tool_response: serde_json::json!("ok"),
        cwd: None,
        prompt_number: 0,
    }
}

#[tokio::test]
async fn shutdown_runs_every_step_in_order_with_work_in_flight() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(worker_config(dir.path()));
    let store = file_store(&dir);
    let stuck = Arc::new(FakeProvider::new(observation_xml("discovery", "never")).gated());
    let sessions = session_manager(store.clone(), Arc::clone(&stuck), None);
    let worker = server::start_with(
        Arc::clone(&config),
        store.clone(),
        sessions.clone(),
        Arc::new(ProcessRegistry::new(1)),
    )
    .await
    .unwrap();
    worker.state.daemon.wait_for(DaemonState::Ready).await;

    sessions.queue_observation("c-1", Some("demo"), edit()).await.unwrap();
    wait_until(|| stuck.calls() == 1).await;

    let graceful = GracefulShutdown::new(
        worker.state.daemon.clone(),
        Arc::clone(&worker.processes),
        worker.listener.clone(),
        sessions.clone(),
        store.clone(),
        config.lifecycle.clone(),
    );
    let reports = graceful.run().await;

    let names: Vec<_> = reports.iter().map(|r| r.name).collect();
    assert_eq!(
        names,
        vec![
            "remove_pid_file",
            "enumerate_children",
            "close_listener",
            "stop_sessions",
            "close_vector_client",
            "close_store",
            "kill_children",
        ]
    );
    assert!(reports.iter().all(|r| r.status == StepStatus::Completed), "{reports:?}");
    assert_eq!(worker.state.daemon.get(), DaemonState::Stopped);
    assert!(store.db().is_closed());
    assert!(!dir.path().join("worker.pid").exists());

    // Running it again is a no-op.
    assert!(graceful.run().await.is_empty());

    // The interrupted item is back to pending on disk.
    let conn = db::open_database(dir.path().join("hindsight.db")).unwrap();
    let counts = queue::queue_counts(&conn).unwrap();
    assert_eq!((counts.pending, counts.processing), (1, 0));
}

#[tokio::test]
async fn restarted_worker_recovers_pending_work() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(worker_config(dir.path()));

    {
        let store = file_store(&dir);
        let stuck = Arc::new(FakeProvider::new(observation_xml("discovery", "never")).gated());
        let sessions = session_manager(store.clone(), Arc::clone(&stuck), None);
        let worker = server::start_with(
            Arc::clone(&config),
            store,
            sessions.clone(),
            Arc::new(ProcessRegistry::new(1)),
        )
        .await
        .unwrap();
        worker.state.daemon.wait_for(DaemonState::Ready).await;
        sessions.queue_observation("c-1", Some("demo"), edit()).await.unwrap();
        wait_until(|| stuck.calls() == 1).await;
        worker.shutdown().await;
    }

    let store = file_store(&dir);
    let provider = Arc::new(FakeProvider::new(observation_xml(
        "discovery",
        "recovered after restart",
    )));
    let sessions = session_manager(store.clone(), Arc::clone(&provider), None);
    let worker = server::start_with(
        Arc::clone(&config),
        store.clone(),
        sessions.clone(),
        Arc::new(ProcessRegistry::new(1)),
    )
    .await
    .unwrap();
    worker.state.daemon.wait_for(DaemonState::Ready).await;

    wait_until(|| provider.calls() == 1 && !sessions.is_any_session_processing()).await;
    let titles: Vec<String> = store
        .db()
        .call(|conn| {
            let mut stmt = conn.prepare("SELECT title FROM observations")?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })
        .await
        .unwrap();
    assert_eq!(titles, vec!["recovered after restart"]);

    tokio::time::timeout(Duration::from_secs(10), worker.shutdown()).await.unwrap();
}
