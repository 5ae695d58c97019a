use crate::schemas::ActionKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Identity and action policy of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Target id that privileged commands must name.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_allowed_actions")]
    pub allowed_actions: Vec<ActionKind>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Channel used when a task carries none.
    #[serde(default = "default_channel")]
    pub default_channel: String,
}

fn default_agent_name() -> String {
    "ciris".into()
}

fn default_agent_id() -> String {
    "ciris-agent".into()
}

fn default_allowed_actions() -> Vec<ActionKind> {
    ActionKind::iter().collect()
}

fn default_system_prompt() -> String {
    "You are CIRIS, an agent that acts with integrity, defers when uncertain, \
and never causes harm."
        .into()
}

fn default_channel() -> String {
    "local".into()
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            agent_id: default_agent_id(),
            allowed_actions: default_allowed_actions(),
            system_prompt: default_system_prompt(),
            default_channel: default_channel(),
        }
    }
}

impl AgentProfile {
    pub fn allows(&self, action: ActionKind) -> bool {
        self.allowed_actions.contains(&action)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.name.trim().is_empty(), "agent.name must be non-empty");
        anyhow::ensure!(
            !self.agent_id.trim().is_empty(),
            "agent.agent_id must be non-empty"
        );
        anyhow::ensure!(
            self.allows(ActionKind::Defer),
            "agent.allowed_actions must include DEFER"
        );
        Ok(())
    }
}

/// Round-loop limits and DMA retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    #[serde(default = "default_max_active_thoughts")]
    pub max_active_thoughts: usize,
    #[serde(default = "default_round_delay_seconds")]
    pub round_delay_seconds: f64,
    #[serde(default = "default_dma_retry_limit")]
    pub dma_retry_limit: u32,
    #[serde(default = "default_guardrail_retry_limit")]
    pub guardrail_retry_limit: u32,
    #[serde(default = "default_dma_timeout_seconds")]
    pub dma_timeout_seconds: u64,
    #[serde(default = "default_max_thought_depth")]
    pub max_thought_depth: u32,
    /// CSDMA scores below this turn the selection into PONDER.
    #[serde(default = "default_csdma_min_score")]
    pub csdma_min_score: u8,
}

fn default_max_active_tasks() -> usize {
    10
}

fn default_max_active_thoughts() -> usize {
    50
}

fn default_round_delay_seconds() -> f64 {
    1.0
}

fn default_dma_retry_limit() -> u32 {
    3
}

fn default_guardrail_retry_limit() -> u32 {
    2
}

fn default_dma_timeout_seconds() -> u64 {
    30
}

fn default_max_thought_depth() -> u32 {
    7
}

fn default_csdma_min_score() -> u8 {
    6
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: default_max_active_tasks(),
            max_active_thoughts: default_max_active_thoughts(),
            round_delay_seconds: default_round_delay_seconds(),
            dma_retry_limit: default_dma_retry_limit(),
            guardrail_retry_limit: default_guardrail_retry_limit(),
            dma_timeout_seconds: default_dma_timeout_seconds(),
            max_thought_depth: default_max_thought_depth(),
            csdma_min_score: default_csdma_min_score(),
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_active_tasks > 0,
            "workflow.max_active_tasks must be positive"
        );
        anyhow::ensure!(
            self.max_active_thoughts > 0,
            "workflow.max_active_thoughts must be positive"
        );
        anyhow::ensure!(
            self.round_delay_seconds.is_finite() && self.round_delay_seconds >= 0.0,
            "workflow.round_delay_seconds must be a non-negative number"
        );
        anyhow::ensure!(
            self.dma_timeout_seconds > 0,
            "workflow.dma_timeout_seconds must be positive"
        );
        anyhow::ensure!(
            self.max_thought_depth > 0,
            "workflow.max_thought_depth must be positive"
        );
        anyhow::ensure!(
            self.csdma_min_score <= 10,
            "workflow.csdma_min_score must be within 0..=10"
        );
        Ok(())
    }
}

/// Secondary-state behaviour and shutdown negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatesConfig {
    #[serde(default = "default_true")]
    pub wakeup_enabled: bool,
    /// Consecutive idle WORK rounds before entering DREAM. Zero disables.
    #[serde(default)]
    pub idle_rounds_before_dream: u32,
    #[serde(default = "default_dream_rounds")]
    pub dream_rounds: u32,
    #[serde(default = "default_play_rounds")]
    pub play_rounds: u32,
    /// Tasks at or below this priority are processed during SOLITUDE.
    #[serde(default)]
    pub solitude_priority_threshold: i32,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_dream_rounds() -> u32 {
    3
}

fn default_play_rounds() -> u32 {
    5
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

impl Default for StatesConfig {
    fn default() -> Self {
        Self {
            wakeup_enabled: true,
            idle_rounds_before_dream: 0,
            dream_rounds: default_dream_rounds(),
            play_rounds: default_play_rounds(),
            solitude_priority_threshold: 0,
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_allows_every_action() {
        let profile = AgentProfile::default();
        assert!(ActionKind::iter().all(|kind| profile.allows(kind)));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn profile_without_defer_is_invalid() {
        let profile = AgentProfile {
            allowed_actions: vec![ActionKind::Speak],
            ..AgentProfile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn workflow_rejects_zero_batch() {
        let workflow = WorkflowConfig {
            max_active_thoughts: 0,
            ..WorkflowConfig::default()
        };
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn workflow_defaults_match_documented_limits() {
        let workflow = WorkflowConfig::default();
        assert_eq!(workflow.max_thought_depth, 7);
        assert_eq!(workflow.dma_retry_limit, 3);
        assert!(workflow.validate().is_ok());
    }
}
