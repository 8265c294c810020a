use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loanflow_core::context::{ContextStore, StoreError, StoredSessionSummary};
use loanflow_core::domain::conversation::{ConversationContext, SessionId};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use super::{corrupt, decode, encode};

const EXTENSION: &str = "json";

/// One JSON document per session under `root`.
#[derive(Clone, Debug)]
pub struct FileContextStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    digest: String,
    payload: String,
}

impl FileContextStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root).await.map_err(|error| io_error(&store.root, error))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: &SessionId) -> Result<PathBuf, StoreError> {
        let id = session_id.as_str();
        let safe = !id.is_empty()
            && id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !safe {
            return Err(StoreError::Backend(format!(
                "session id `{id}` cannot be used as a file name"
            )));
        }
        Ok(self.root.join(format!("{id}.{EXTENSION}")))
    }

    async fn read_path(
        &self,
        session_id: &SessionId,
        path: &Path,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(path, error)),
        };
        if raw.trim().is_empty() {
            return Err(corrupt(session_id, "context file is empty"));
        }

        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|error| corrupt(session_id, &format!("envelope does not decode: {error}")))?;
        decode(session_id, &envelope.payload, &envelope.digest).map(Some)
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let path = self.path_for(session_id)?;
        self.read_path(session_id, &path).await
    }

    async fn put(&self, context: &ConversationContext) -> Result<(), StoreError> {
        let path = self.path_for(&context.session_id)?;
        let encoded = encode(context)?;
        let document = serde_json::to_vec_pretty(&Envelope {
            digest: encoded.digest,
            payload: encoded.payload,
        })
        .map_err(|error| StoreError::Codec(error.to_string()))?;

        fs::create_dir_all(&self.root).await.map_err(|error| io_error(&self.root, error))?;
        let staging = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&staging, document).await.map_err(|error| io_error(&staging, error))?;
        fs::rename(&staging, &path).await.map_err(|error| io_error(&path, error))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredSessionSummary>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(&self.root, error)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&self.root, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let session_id = SessionId::from(stem);
            match self.read_path(&session_id, &path).await {
                Ok(Some(context)) => summaries.push(StoredSessionSummary::from(&context)),
                Ok(None) => {}
                Err(error) => warn!(
                    event_name = "storage.context.list_skipped",
                    correlation_id = %session_id,
                    error = %error,
                    "skipping unreadable context file"
                ),
            }
        }

        summaries.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(io_error(&path, error)),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let metadata =
            fs::metadata(&self.root).await.map_err(|error| io_error(&self.root, error))?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(StoreError::Io(format!("`{}` is not a directory", self.root.display())))
        }
    }
}

fn io_error(path: &Path, error: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {error}", path.display()))
}
