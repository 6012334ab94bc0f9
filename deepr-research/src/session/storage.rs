//! Session Storage - persistence of session records and loop records
//!
//! Layout under the data directory:
//!
//! ```text
//! <session_id>/session.json      metadata and status, rewritten on change
//! <session_id>/uploads.json      documents supplied at start, written once
//! <session_id>/loops/<n>.json    one file per completed loop, never rewritten
//! <session_id>/report.json       final report
//! ```

use crate::research::types::{LoopRecord, ResearchReport, Session, UploadedDocument};
use crate::{ResearchError, ResearchResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Persistence backend for research sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session and the documents supplied with it
    async fn create_session(
        &self,
        session: &Session,
        uploads: &[UploadedDocument],
    ) -> ResearchResult<()>;

    /// Overwrite the metadata record of an existing session
    async fn update_session(&self, session: &Session) -> ResearchResult<()>;

    /// Append a loop record; fails if a record with the same index exists
    async fn append_loop(&self, session_id: &str, record: &LoopRecord) -> ResearchResult<()>;

    async fn save_report(&self, report: &ResearchReport) -> ResearchResult<()>;

    async fn load_session(&self, session_id: &str) -> ResearchResult<Option<Session>>;

    async fn load_uploads(&self, session_id: &str) -> ResearchResult<Vec<UploadedDocument>>;

    /// Loop records ordered by loop index
    async fn load_loops(&self, session_id: &str) -> ResearchResult<Vec<LoopRecord>>;

    async fn load_report(&self, session_id: &str) -> ResearchResult<Option<ResearchReport>>;

    async fn list_sessions(&self) -> ResearchResult<Vec<Session>>;
}

/// JSON files on the local filesystem
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    /// Base directory for session storage
    root: PathBuf,
}

impl FileSessionStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> ResearchResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!("Session storage initialized at: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> ResearchResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ResearchError::validation(format!(
                "invalid session id '{}'",
                session_id
            )));
        }
        Ok(self.root.join(session_id))
    }

    fn loops_dir(&self, session_id: &str) -> ResearchResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join("loops"))
    }

    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> ResearchResult<()> {
        let content = serde_json::to_vec_pretty(value)?;
        // Readers never observe a partially written record
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> ResearchResult<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(
        &self,
        session: &Session,
        uploads: &[UploadedDocument],
    ) -> ResearchResult<()> {
        let dir = self.session_dir(&session.id)?;
        fs::create_dir_all(dir.join("loops")).await?;
        Self::write_json(&dir.join("uploads.json"), &uploads).await?;
        Self::write_json(&dir.join("session.json"), session).await?;
        debug!(session_id = %session.id, "Created session record");
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> ResearchResult<()> {
        let dir = self.session_dir(&session.id)?;
        if !fs::try_exists(&dir).await? {
            return Err(ResearchError::not_found(format!("session {}", session.id)));
        }
        Self::write_json(&dir.join("session.json"), session).await
    }

    async fn append_loop(&self, session_id: &str, record: &LoopRecord) -> ResearchResult<()> {
        let dir = self.loops_dir(session_id)?;
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", record.loop_index));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ResearchError::storage(format!(
                        "loop record {} of session {} already exists",
                        record.loop_index, session_id
                    ))
                } else {
                    ResearchError::Io(e)
                }
            })?;

        file.write_all(&serde_json::to_vec_pretty(record)?).await?;
        file.flush().await?;
        debug!(
            session_id = session_id,
            loop_index = record.loop_index,
            "Appended loop record"
        );
        Ok(())
    }

    async fn save_report(&self, report: &ResearchReport) -> ResearchResult<()> {
        let dir = self.session_dir(&report.session_id)?;
        fs::create_dir_all(&dir).await?;
        Self::write_json(&dir.join("report.json"), report).await
    }

    async fn load_session(&self, session_id: &str) -> ResearchResult<Option<Session>> {
        Self::read_json(&self.session_dir(session_id)?.join("session.json")).await
    }

    async fn load_uploads(&self, session_id: &str) -> ResearchResult<Vec<UploadedDocument>> {
        Ok(Self::read_json(&self.session_dir(session_id)?.join("uploads.json"))
            .await?
            .unwrap_or_default())
    }

    async fn load_loops(&self, session_id: &str) -> ResearchResult<Vec<LoopRecord>> {
        let dir = self.loops_dir(session_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<LoopRecord>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!("Skipping unreadable loop record {}: {}", path.display(), e);
                }
            }
        }

        records.sort_by_key(|r| r.loop_index);
        Ok(records)
    }

    async fn load_report(&self, session_id: &str) -> ResearchResult<Option<ResearchReport>> {
        Self::read_json(&self.session_dir(session_id)?.join("report.json")).await
    }

    async fn list_sessions(&self) -> ResearchResult<Vec<Session>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut sessions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join("session.json");
            match Self::read_json::<Session>(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable session {}: {}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}
