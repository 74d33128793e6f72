use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CouncilResult;
use crate::types::{Message, Role};

const LOG_WRITE_ATTEMPTS: usize = 3;
const LOG_RETRY_DELAY: Duration = Duration::from_millis(25);

/// One correlated line of the shared conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// Agent that produced or received this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Calling convention that created the entry (`call_agent`, `call_flow`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Response text, filled in once the correlated call returns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            agent: None,
            function: None,
            flow: None,
            response: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = Some(flow.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Render as a chat message; tool-role entries are folded into assistant text
    pub fn to_message(&self) -> Message {
        match self.role {
            Role::User => Message::user(&self.text),
            Role::System => Message::system(&self.text),
            Role::Assistant | Role::Tool => Message::assistant(&self.text),
        }
    }
}

/// Records written to the history log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LogRecord {
    Entry(HistoryEntry),
    Resolved { id: String, response: String },
}

/// Append-only JSONL mirror of the shared history
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Append one record, retrying transient failures. Logging never fails the caller.
    async fn append(&self, record: &LogRecord) {
        let line = match serde_json::to_string(record) {
            Ok(json) => json + "\n",
            Err(e) => {
                tracing::warn!(error = %e, "history record not serializable");
                return;
            }
        };

        for attempt in 1..=LOG_WRITE_ATTEMPTS {
            match self.write_line(&line).await {
                Ok(()) => return,
                Err(e) if attempt < LOG_WRITE_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "history log write failed, retrying");
                    tokio::time::sleep(LOG_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "history log write gave up");
                }
            }
        }
    }

    /// Rebuild history entries from the log file
    pub async fn load(&self) -> CouncilResult<Vec<HistoryEntry>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut entries: Vec<HistoryEntry> = Vec::new();
        for record in content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<LogRecord>(line).ok())
        {
            match record {
                LogRecord::Entry(entry) => entries.push(entry),
                LogRecord::Resolved { id, response } => {
                    if let Some(entry) = entries.iter_mut().rev().find(|e| e.id == id) {
                        entry.response = Some(response);
                    }
                }
            }
        }
        Ok(entries)
    }
}

/// Shared, ordered conversation history for one orchestrator
#[derive(Clone, Default)]
pub struct History {
    entries: Arc<RwLock<Vec<HistoryEntry>>>,
    log: Option<Arc<HistoryLog>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: HistoryLog) -> Self {
        Self {
            entries: Arc::default(),
            log: Some(Arc::new(log)),
        }
    }

    /// Open a logged history, replaying whatever the log already holds
    pub async fn restore(log: HistoryLog) -> CouncilResult<Self> {
        let entries = log.load().await?;
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            log: Some(Arc::new(log)),
        })
    }

    /// Append an entry and return its id
    pub async fn append(&self, entry: HistoryEntry) -> String {
        let id = entry.id.clone();
        if let Some(log) = &self.log {
            log.append(&LogRecord::Entry(entry.clone())).await;
        }
        self.entries.write().await.push(entry);
        id
    }

    /// Record the response for a correlated entry. Returns false when the id is unknown.
    pub async fn resolve(&self, id: &str, response: impl Into<String>) -> bool {
        let response = response.into();
        let found = {
            let mut entries = self.entries.write().await;
            match entries.iter_mut().rev().find(|e| e.id == id) {
                Some(entry) => {
                    entry.response = Some(response.clone());
                    true
                }
                None => false,
            }
        };
        if found {
            if let Some(log) = &self.log {
                log.append(&LogRecord::Resolved {
                    id: id.to_string(),
                    response,
                })
                .await;
            }
        }
        found
    }

    pub async fn get(&self, id: &str) -> Option<HistoryEntry> {
        self.entries.read().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
