//! File-backed session storage and resumption

mod common;

use common::*;
use deepr_core::{CallPurpose, DeeprConfig};
use deepr_research::research::TerminationReason;
use deepr_research::{
    EffortMode, FileSessionStore, LoopRecord, ResearchController, ResearchError, Session,
    SessionManager, SessionStatus, SessionStore, StartRequest, UploadedDocument,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn store() -> (TempDir, Arc<FileSessionStore>) {
    let dir = TempDir::new().unwrap();
    let store = FileSessionStore::new(dir.path().join("sessions")).await.unwrap();
    (dir, Arc::new(store))
}

/// Loop records produced by a real run
async fn sample_loops(loops: usize) -> Vec<LoopRecord> {
    let harness = Harness::new();
    harness
        .model
        .set_default(CallPurpose::Reflect, Reply::Text(verdict_json(false)));
    harness.run("sample", EffortMode::Standard, loops).await.loops
}

fn persistent_manager(harness: &Harness, store: Arc<FileSessionStore>) -> SessionManager {
    SessionManager::new(harness.controller().with_store(store))
}

#[tokio::test]
async fn test_loop_records_are_append_only() {
    let (_dir, store) = store().await;
    let session = Session::new("q", EffortMode::Standard, 5);
    store.create_session(&session, &[]).await.unwrap();

    let loops = sample_loops(2).await;
    store.append_loop(&session.id, &loops[1]).await.unwrap();
    store.append_loop(&session.id, &loops[0]).await.unwrap();

    let duplicate = store.append_loop(&session.id, &loops[0]).await;
    assert!(matches!(duplicate, Err(ResearchError::Storage { .. })));

    let loaded = store.load_loops(&session.id).await.unwrap();
    assert_eq!(loaded, loops);
}

#[tokio::test]
async fn test_session_round_trip_and_listing() {
    let (_dir, store) = store().await;
    let mut session = Session::new("q", EffortMode::Extra, 7);
    let uploads = vec![UploadedDocument {
        name: "notes.txt".to_string(),
        content: "notes".to_string(),
    }];
    store.create_session(&session, &uploads).await.unwrap();

    session.status = SessionStatus::Cancelled;
    session.loop_index = 3;
    store.update_session(&session).await.unwrap();

    let loaded = store.load_session(&session.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SessionStatus::Cancelled);
    assert_eq!(loaded.loop_index, 3);
    assert_eq!(loaded.effort_mode, EffortMode::Extra);
    assert_eq!(store.load_uploads(&session.id).await.unwrap(), uploads);

    assert!(store.load_session("absent").await.unwrap().is_none());
    assert!(store.load_report(&session.id).await.unwrap().is_none());
    assert_eq!(store.list_sessions().await.unwrap().len(), 1);

    let stranger = Session::new("other", EffortMode::Quick, 1);
    assert!(matches!(
        store.update_session(&stranger).await,
        Err(ResearchError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_path_like_session_ids_are_rejected() {
    let (_dir, store) = store().await;
    assert!(matches!(
        store.load_session("../escape").await,
        Err(ResearchError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_finished_session_is_readable_from_disk() {
    let (_dir, store) = store().await;
    let harness = Harness::new();

    let id = {
        let manager = persistent_manager(&harness, store.clone());
        let id = manager
            .start(StartRequest::new("persisted").with_effort(EffortMode::Quick))
            .await
            .unwrap();
        manager.wait_for_report(&id).await.unwrap();
        id
    };

    assert_eq!(store.load_loops(&id).await.unwrap().len(), 1);

    // A fresh manager only knows what is on disk
    let manager = persistent_manager(&harness, store.clone());
    let report = manager.get_report(&id).await.unwrap();
    assert_eq!(report.status, SessionStatus::Converged);

    let status = manager.get_status(&id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Converged);
    assert_eq!(status.loop_index, 1);
    assert_eq!(status.current_findings, report.findings);

    let sessions = manager.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(matches!(
        manager.resume(&id).await,
        Err(ResearchError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_interrupted_session_resumes_after_last_record() {
    let (_dir, store) = store().await;
    let earlier = sample_loops(1).await;

    let session = Session::new("sample", EffortMode::Standard, 2);
    store.create_session(&session, &[]).await.unwrap();
    store.append_loop(&session.id, &earlier[0]).await.unwrap();

    let harness = Harness::new();
    harness
        .model
        .push_plan(&["second look"])
        .set_default(CallPurpose::Reflect, Reply::Text(verdict_json(false)));
    let manager = persistent_manager(&harness, store.clone());

    let progress = manager.get_status(&session.id).await.unwrap();
    assert_eq!(progress.loop_index, 1);
    assert!(matches!(
        manager.get_report(&session.id).await,
        Err(ResearchError::NotReady { .. })
    ));

    manager.resume(&session.id).await.unwrap();
    let report = manager.wait_for_report(&session.id).await.unwrap();

    assert_eq!(report.termination, TerminationReason::MaxLoops);
    assert_eq!(report.loops.len(), 2);
    assert_eq!(report.loops[0], earlier[0]);
    assert_eq!(report.loops[1].loop_index, 2);
    for source in &earlier[0].sources_added {
        assert!(report.sources.contains(source));
    }

    // Only the new loop was planned, with loop 1's queries marked as executed
    let plans = harness.model.prompts(CallPurpose::Plan);
    assert_eq!(plans.len(), 1);
    assert!(plans[0].contains("Loop 2 of at most 2"));
    assert!(plans[0].contains("follow-up query 1"));

    assert_eq!(store.load_loops(&session.id).await.unwrap().len(), 2);
    let stored = store.load_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Converged);
    assert!(store.load_report(&session.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_finished_session_is_released_from_memory() {
    let (_dir, store) = store().await;
    let harness = Harness::new();
    let manager = persistent_manager(&harness, store.clone());

    let id = manager
        .start(StartRequest::new("released").with_effort(EffortMode::Quick))
        .await
        .unwrap();
    let report = manager.wait_for_report(&id).await.unwrap();

    for _ in 0..200 {
        if manager.live_session_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(manager.live_session_count().await, 0);

    // Reads fall back to the store
    assert_eq!(manager.get_report(&id).await.unwrap().markdown, report.markdown);
    assert_eq!(manager.wait_for_report(&id).await.unwrap().session_id, id);
    let status = manager.get_status(&id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Converged);
    assert_eq!(status.current_findings, report.findings);
    assert_eq!(manager.list_sessions().await.unwrap().len(), 1);
    assert!(matches!(
        manager.submit_steering(&id, "too late").await,
        Err(ResearchError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_resumes_launch_one_run() {
    let (_dir, store) = store().await;
    let session = Session::new("sample", EffortMode::Standard, 2);
    store.create_session(&session, &[]).await.unwrap();

    let harness = Harness::new();
    harness.model.push_plan(&["slow resume"]);
    harness
        .search
        .set_delay("slow resume", Duration::from_millis(200));
    let manager = persistent_manager(&harness, store.clone());

    let (a, b) = tokio::join!(manager.resume(&session.id), manager.resume(&session.id));
    assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);
    let rejected = if a.is_err() { a } else { b };
    assert!(matches!(rejected, Err(ResearchError::Session { .. })));

    let report = manager.wait_for_report(&session.id).await.unwrap();
    assert_eq!(report.loops.len(), 2);
    assert_eq!(store.load_loops(&session.id).await.unwrap().len(), 2);
    assert_eq!(harness.search.queries().len(), 2);
}

#[tokio::test]
async fn test_manager_from_config_persists_sessions() {
    let dir = TempDir::new().unwrap();
    let mut config = DeeprConfig::default();
    config.storage.data_dir = dir.path().join("data");
    config.storage.persist_sessions = true;

    let harness = Harness::new();
    let manager = SessionManager::from_config(&config, harness.llm(), harness.tools())
        .await
        .unwrap();
    let id = manager
        .start(StartRequest::new("configured").with_effort(EffortMode::Quick))
        .await
        .unwrap();
    manager.wait_for_report(&id).await.unwrap();

    let store = FileSessionStore::new(&config.storage.data_dir).await.unwrap();
    assert!(store.load_report(&id).await.unwrap().is_some());

    let detached = SessionManager::new(ResearchController::new(
        harness.llm(),
        harness.tools(),
        config.research.clone(),
    ));
    assert!(matches!(
        detached.resume(&id).await,
        Err(ResearchError::Session { .. })
    ));
}
