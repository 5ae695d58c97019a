use super::CirisRuntime;
use crate::config::Config;
use crate::observability::MetricsSnapshot;
use crate::processors::AgentState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const STATUS_FLUSH_SECONDS: u64 = 5;

/// What `ciris status` shows about a running (or stopped) agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub agent_id: String,
    pub state: AgentState,
    pub rounds: u64,
    pub audit_halted: bool,
    pub metrics: BTreeMap<AgentState, MetricsSnapshot>,
    pub written_at: String,
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config.data_dir.join("runtime_state.json")
}

pub fn read_status(path: &Path) -> anyhow::Result<RuntimeStatus> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("no status at {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

impl CirisRuntime {
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            agent_id: self.ctx.config.load().agent.agent_id.clone(),
            state: self.agent.state(),
            rounds: self.agent.rounds(),
            audit_halted: self.audit.is_halted(),
            metrics: self.agent.metrics(),
            written_at: Utc::now().to_rfc3339(),
        }
    }

    pub(super) async fn write_status(&self) {
        let path = state_file_path(&self.ctx.config.load());
        let data = match serde_json::to_vec_pretty(&self.status()) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(%error, "failed to serialise runtime status");
                return;
            }
        };
        if let Err(error) = tokio::fs::write(&path, data).await {
            tracing::warn!(%error, path = %path.display(), "failed to write runtime state file");
        }
    }
}

pub(super) fn spawn_state_writer(
    runtime: Arc<CirisRuntime>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => runtime.write_status().await,
            }
        }
        runtime.write_status().await;
    })
}
