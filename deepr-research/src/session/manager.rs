//! Session Manager - the control surface used by API and UI layers
//!
//! Every session runs its controller loop on its own task. The manager keeps
//! the cancellation token, steering handle and progress/report channels of
//! each running session. With a store configured, a finished session is
//! released from memory and served from disk; without one it stays until
//! `forget_session` archives it.

use super::storage::{FileSessionStore, SessionStore};
use super::types::StartRequest;
use crate::research::steering::{steering_channel, SteeringHandle};
use crate::research::types::*;
use crate::research::{KnowledgeState, ResearchController, ResearchRun};
use crate::{ResearchError, ResearchResult};
use chrono::Utc;
use deepr_core::DeeprConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Live handles of a session started by this manager
struct SessionEntry {
    /// Metadata at start; live values come from `progress`
    session: Session,
    cancel: CancellationToken,
    steering: SteeringHandle,
    progress: watch::Receiver<ResearchProgress>,
    report: watch::Receiver<Option<Arc<ResearchReport>>>,
}

impl SessionEntry {
    fn current_session(&self) -> Session {
        let progress = self.progress.borrow();
        let mut session = self.session.clone();
        session.loop_index = progress.loop_index;
        session.status = progress.status;
        if let Some(report) = self.report.borrow().as_ref() {
            session.status = report.status;
            session.failure = report.failure.clone();
            session.finalized_at = Some(report.generated_at);
        }
        session
    }

    fn is_finished(&self) -> bool {
        self.report.borrow().is_some()
    }
}

/// Starts, steers, cancels and reports on research sessions
pub struct SessionManager {
    controller: Arc<ResearchController>,
    /// Sessions started or resumed by this manager and not yet released
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    pub fn new(controller: ResearchController) -> Self {
        Self {
            controller: Arc::new(controller),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a manager whose controller persists sessions when the
    /// configuration asks for it
    pub async fn from_config(
        config: &DeeprConfig,
        llm: crate::LlmGateway,
        tools: crate::ToolGateway,
    ) -> ResearchResult<Self> {
        config.validate()?;
        let mut controller = ResearchController::new(llm, tools, config.research.clone());
        if config.storage.persist_sessions {
            let store = FileSessionStore::new(&config.storage.data_dir).await?;
            controller = controller.with_store(Arc::new(store));
        }
        Ok(Self::new(controller))
    }

    fn store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.controller.store()
    }

    /// Start a new session and return its id
    pub async fn start(&self, request: StartRequest) -> ResearchResult<String> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ResearchError::validation("query must not be empty"));
        }

        let settings = self.controller.settings();
        let max_loops = request.max_loops.unwrap_or(settings.default_max_loops);
        if max_loops == 0 || max_loops > settings.max_loops_limit {
            return Err(ResearchError::validation(format!(
                "max_loops must be between 1 and {}",
                settings.max_loops_limit
            )));
        }

        let session = Session::new(query, request.effort_mode, max_loops);
        if let Some(store) = self.store() {
            store
                .create_session(&session, &request.uploaded_documents)
                .await?;
        }

        info!(
            session_id = %session.id,
            effort = %session.effort_mode,
            max_loops = max_loops,
            uploads = request.uploaded_documents.len(),
            "Starting research session"
        );

        let (steering, inbox) = steering_channel();
        let cancel = CancellationToken::new();
        let run = ResearchRun::new(
            session.clone(),
            request.uploaded_documents,
            inbox,
            cancel.clone(),
        );
        let mut sessions = self.sessions.write().await;
        Ok(self.launch(&mut sessions, session, run, steering, cancel))
    }

    /// Continue a persisted session that stopped while still running
    pub async fn resume(&self, session_id: &str) -> ResearchResult<String> {
        let store = self
            .store()
            .ok_or_else(|| ResearchError::session("session persistence is not enabled"))?;

        // Held until the resumed run is registered
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(session_id) {
            if !entry.is_finished() {
                return Err(ResearchError::session(format!(
                    "session {} is already running",
                    session_id
                )));
            }
        }

        let session = store
            .load_session(session_id)
            .await?
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;
        if session.status.is_terminal() {
            return Err(ResearchError::validation(format!(
                "session {} already finished with status {}",
                session_id, session.status
            )));
        }

        let records = store.load_loops(session_id).await?;
        let uploads = store.load_uploads(session_id).await?;
        info!(
            session_id = session_id,
            completed_loops = records.len(),
            "Resuming research session"
        );

        let (steering, inbox) = steering_channel();
        let cancel = CancellationToken::new();
        let run = ResearchRun::resume(session, records, uploads, inbox, cancel.clone())?;
        Ok(self.launch(&mut sessions, run.session.clone(), run, steering, cancel))
    }

    fn launch(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        session: Session,
        run: ResearchRun,
        steering: SteeringHandle,
        cancel: CancellationToken,
    ) -> String {
        let session_id = session.id.clone();
        let mut initial = ResearchProgress::starting(&session);
        initial.current_findings = run.knowledge().findings().to_vec();
        initial.source_count = run.knowledge().source_count();
        initial.open_questions = run.knowledge().open_questions().to_vec();

        let (progress_tx, progress_rx) = watch::channel(initial);
        let (report_tx, report_rx) = watch::channel(None);

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                session,
                cancel,
                steering,
                progress: progress_rx,
                report: report_rx,
            },
        );

        let controller = Arc::clone(&self.controller);
        let registry = Arc::clone(&self.sessions);
        let id = session_id.clone();
        let run = run.with_progress(progress_tx);
        tokio::spawn(async move {
            let report = controller.run(run).await;
            report_tx.send_replace(Some(Arc::new(report)));

            // The report is on disk; later reads go through the store
            if controller.store().is_some() {
                registry.write().await.remove(&id);
                debug!(session_id = %id, "Released finished session");
            }
        });

        session_id
    }

    /// Drop a finished session from memory. Persisted records are kept.
    pub async fn forget_session(&self, session_id: &str) -> ResearchResult<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;
        if !entry.is_finished() {
            return Err(ResearchError::session(format!(
                "session {} is still running",
                session_id
            )));
        }
        sessions.remove(session_id);
        info!(session_id = session_id, "Session archived");
        Ok(())
    }

    /// Number of sessions currently held in memory
    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Request cancellation; observed at the next loop boundary
    pub async fn cancel(&self, session_id: &str) -> ResearchResult<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;

        if !entry.is_finished() {
            info!(session_id = session_id, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Submit operator guidance for the next loop boundary
    pub async fn submit_steering(
        &self,
        session_id: &str,
        text: &str,
    ) -> ResearchResult<SteeringMessage> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;

        if entry.is_finished() || entry.cancel.is_cancelled() {
            return Err(ResearchError::session(format!(
                "session {} is not running",
                session_id
            )));
        }
        entry.steering.submit(text)
    }

    /// Current status, loop index and findings of a session
    pub async fn get_status(&self, session_id: &str) -> ResearchResult<ResearchProgress> {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            return Ok(entry.progress.borrow().clone());
        }

        // Not started here; rebuild from persisted records
        let store = self
            .store()
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;
        let session = store
            .load_session(session_id)
            .await?
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;
        let records = store.load_loops(session_id).await?;
        let knowledge = KnowledgeState::replay(session.query.clone(), &records)?;

        debug!(session_id = session_id, "Status rebuilt from storage");
        Ok(ResearchProgress {
            session_id: session.id.clone(),
            status: session.status,
            loop_index: records.len(),
            max_loops: session.max_loops,
            analyzer_state: match session.status {
                SessionStatus::Running => AnalyzerState::Active,
                SessionStatus::Converged => AnalyzerState::Done,
                SessionStatus::Cancelled => AnalyzerState::Cancelled,
                SessionStatus::Failed => AnalyzerState::Failed,
            },
            current_findings: knowledge.findings().to_vec(),
            source_count: knowledge.source_count(),
            open_questions: knowledge.open_questions().to_vec(),
            last_activity: records.last().and_then(|r| r.activity.clone()),
            updated_at: Utc::now(),
        })
    }

    /// The finalized report, or `NotReady` while the session is running
    pub async fn get_report(&self, session_id: &str) -> ResearchResult<ResearchReport> {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            return match entry.report.borrow().as_ref() {
                Some(report) => Ok(report.as_ref().clone()),
                None => Err(ResearchError::NotReady {
                    session_id: session_id.to_string(),
                }),
            };
        }

        let store = self
            .store()
            .ok_or_else(|| ResearchError::not_found(format!("session {}", session_id)))?;
        if let Some(report) = store.load_report(session_id).await? {
            return Ok(report);
        }
        match store.load_session(session_id).await? {
            Some(_) => Err(ResearchError::NotReady {
                session_id: session_id.to_string(),
            }),
            None => Err(ResearchError::not_found(format!("session {}", session_id))),
        }
    }

    /// Wait until a session reaches a terminal status
    pub async fn wait_for_report(&self, session_id: &str) -> ResearchResult<ResearchReport> {
        let live = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.report.clone());
        let Some(mut report) = live else {
            // Released or never started here
            return self.get_report(session_id).await;
        };

        let finished = report
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| ResearchError::session(format!("session {} task ended", session_id)))?;
        match finished.as_ref() {
            Some(report) => Ok(report.as_ref().clone()),
            None => Err(ResearchError::NotReady {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// All known sessions, newest first
    pub async fn list_sessions(&self) -> ResearchResult<Vec<Session>> {
        let mut by_id: HashMap<String, Session> = HashMap::new();

        if let Some(store) = self.store() {
            for session in store.list_sessions().await? {
                by_id.insert(session.id.clone(), session);
            }
        }
        for (id, entry) in self.sessions.read().await.iter() {
            by_id.insert(id.clone(), entry.current_session());
        }

        let mut sessions: Vec<Session> = by_id.into_values().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}
