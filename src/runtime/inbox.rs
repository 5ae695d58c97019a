//! File drops through which other processes reach a running agent.
//!
//! `ciris submit` and `ciris wa sign-command --deliver` write one JSON file
//! per request under `<data_dir>/inbox/`. The agent polls the inbox, applies
//! each file in name order and moves it to `applied/` or `rejected/`, so
//! only the agent process ever appends to the audit chain.

use super::CirisRuntime;
use crate::authority::PrivilegedCommand;
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const INBOX_POLL_MILLIS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    Commands,
    Tasks,
}

impl InboxKind {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Tasks => "tasks",
        }
    }
}

pub fn inbox_dir(config: &Config, kind: InboxKind) -> PathBuf {
    config.data_dir.join("inbox").join(kind.dir_name())
}

/// A task handed to the agent from outside its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub requester_id: Option<String>,
}

/// Write `request` into the inbox. The file appears under its final name
/// only once complete.
pub fn deliver(config: &Config, kind: InboxKind, request: &impl Serialize) -> Result<PathBuf> {
    let dir = inbox_dir(config, kind);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create inbox {}", dir.display()))?;
    let name = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.6f"), Uuid::new_v4());
    let partial = dir.join(format!("{name}.part"));
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&partial, serde_json::to_vec_pretty(request)?)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    std::fs::rename(&partial, &path)
        .with_context(|| format!("failed to publish {}", path.display()))?;
    Ok(path)
}

/// Outcome of one pass over the inbox.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InboxPass {
    pub applied: usize,
    pub rejected: usize,
}

impl InboxPass {
    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.rejected == 0
    }
}

async fn pending_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

async fn file_away(path: &Path, bucket: &str) {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    let target = parent.join(bucket);
    if let Err(error) = tokio::fs::create_dir_all(&target).await {
        tracing::warn!(%error, "failed to create inbox bucket");
        return;
    }
    if let Err(error) = tokio::fs::rename(path, target.join(name)).await {
        tracing::warn!(%error, path = %path.display(), "failed to move processed request");
    }
}

impl CirisRuntime {
    async fn apply_request(&self, kind: InboxKind, path: &Path) -> Result<()> {
        match kind {
            InboxKind::Commands => {
                let command: PrivilegedCommand = read_request(path).await?;
                self.handle_privileged_command(&command).await?;
            }
            InboxKind::Tasks => {
                let request: TaskRequest = read_request(path).await?;
                self.submit_task(
                    &request.description,
                    request.priority,
                    request.channel_id,
                    request.requester_id,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Apply everything waiting in the inbox: commands first, then tasks.
    pub async fn drain_inbox(&self) -> InboxPass {
        let config = self.ctx.config.load_full();
        let mut pass = InboxPass::default();
        for kind in [InboxKind::Commands, InboxKind::Tasks] {
            let dir = inbox_dir(&config, kind);
            let files = match pending_files(&dir).await {
                Ok(files) => files,
                Err(error) => {
                    tracing::warn!(%error, dir = %dir.display(), "inbox unreadable");
                    continue;
                }
            };
            for path in files {
                match self.apply_request(kind, &path).await {
                    Ok(()) => {
                        pass.applied += 1;
                        file_away(&path, "applied").await;
                    }
                    Err(error) => {
                        tracing::warn!(error = %format!("{error:#}"), path = %path.display(), "inbox request refused");
                        pass.rejected += 1;
                        file_away(&path, "rejected").await;
                    }
                }
            }
        }
        pass
    }
}

pub(super) fn spawn_inbox_poller(
    runtime: Arc<CirisRuntime>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(INBOX_POLL_MILLIS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let pass = runtime.drain_inbox().await;
                    if !pass.is_empty() {
                        tracing::info!(applied = pass.applied, rejected = pass.rejected, "inbox drained");
                    }
                }
            }
        }
    })
}
