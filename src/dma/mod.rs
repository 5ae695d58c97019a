//! Decision-making algorithms: CSDMA, PDMA and action selection.
//!
//! CSDMA runs locally. PDMA and action selection consult the configured
//! [`ReasoningBackend`], each call bounded by the workflow timeout and retry
//! limit. A stage that keeps failing ends in DEFER, never in an error.

pub mod action_selection;
pub mod backend;
pub mod csdma;
pub mod pdma;

pub use action_selection::{ActionSelectionDma, fallbacks};
pub use backend::{HeuristicBackend, ReasoningBackend, ReasoningRequest, SPOKE_PREFIX};
pub use csdma::{
    CommonSenseContext, CommonSenseDma, CsdmaFlag, CsdmaResult, LinearDeduction, ScoringStrategy,
};
pub use pdma::{
    Candidate, PdmaResult, PriorityOrderRanker, PrincipleScores, PrincipledDma, RankingStrategy,
};

use crate::config::{AgentProfile, WorkflowConfig};
use crate::error::DmaError;
use crate::schemas::{ActionSelectionResult, Thought};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DmaStage {
    Csdma,
    Pdma,
    ActionSelection,
}

/// Everything the pipeline concluded about one thought.
#[derive(Debug, Clone, PartialEq)]
pub struct DmaOutcome {
    pub selection: ActionSelectionResult,
    pub csdma: CsdmaResult,
    pub pdma: Option<PdmaResult>,
    /// Set when a backend stage failed and the selection is a forced DEFER.
    pub error: Option<String>,
}

pub struct DmaPipeline {
    backend: Arc<dyn ReasoningBackend>,
    csdma: CommonSenseDma,
    pdma: PrincipledDma,
    selector: ActionSelectionDma,
    timeout: Duration,
    retry_limit: u32,
}

impl DmaPipeline {
    pub fn new(backend: Arc<dyn ReasoningBackend>, workflow: &WorkflowConfig) -> Self {
        Self {
            backend,
            csdma: CommonSenseDma::new(),
            pdma: PrincipledDma::new(),
            selector: ActionSelectionDma::new(workflow.csdma_min_score),
            timeout: Duration::from_secs(workflow.dma_timeout_seconds),
            retry_limit: workflow.dma_retry_limit,
        }
    }

    pub fn with_scoring(mut self, strategy: Box<dyn ScoringStrategy>) -> Self {
        self.csdma = CommonSenseDma::with_strategy(strategy);
        self
    }

    pub fn with_ranker(mut self, ranker: Box<dyn RankingStrategy>) -> Self {
        self.pdma = PrincipledDma::with_ranker(ranker);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Run every stage for `thought`.
    pub async fn evaluate(&self, thought: &Thought, profile: &AgentProfile) -> DmaOutcome {
        let csdma = self.csdma.evaluate(&thought.content);
        let request = self.request(DmaStage::Pdma, thought, profile, &csdma);

        let pdma = match self
            .invoke(&request, |raw| self.pdma.assess(raw))
            .await
        {
            Ok(pdma) => pdma,
            Err(e) => return forced_defer(csdma, None, &e),
        };

        if let Some(reason) = &pdma.defer_reason {
            tracing::info!(thought_id = %thought.thought_id, reason = %reason, "pdma deferred");
            return DmaOutcome {
                selection: ActionSelectionResult::defer(reason.clone()),
                csdma,
                pdma: Some(pdma),
                error: None,
            };
        }

        self.select(thought, profile, csdma, Some(pdma), None).await
    }

    /// Re-run only action selection, carrying guardrail feedback.
    pub async fn reselect(
        &self,
        thought: &Thought,
        profile: &AgentProfile,
        previous: &DmaOutcome,
        feedback: &str,
    ) -> DmaOutcome {
        self.select(
            thought,
            profile,
            previous.csdma.clone(),
            previous.pdma.clone(),
            Some(feedback),
        )
        .await
    }

    async fn select(
        &self,
        thought: &Thought,
        profile: &AgentProfile,
        csdma: CsdmaResult,
        pdma: Option<PdmaResult>,
        feedback: Option<&str>,
    ) -> DmaOutcome {
        let mut request = self.request(DmaStage::ActionSelection, thought, profile, &csdma);
        request.candidates = pdma
            .as_ref()
            .map(PdmaResult::ranked_actions)
            .unwrap_or_default();
        request.feedback = feedback.map(str::to_string);

        match self.invoke(&request, ActionSelectionDma::parse).await {
            Ok(selection) => DmaOutcome {
                selection: self.selector.finalize(
                    selection,
                    &csdma,
                    &request.candidates,
                    &profile.allowed_actions,
                ),
                csdma,
                pdma,
                error: None,
            },
            Err(e) => forced_defer(csdma, pdma, &e),
        }
    }

    fn request(
        &self,
        stage: DmaStage,
        thought: &Thought,
        profile: &AgentProfile,
        csdma: &CsdmaResult,
    ) -> ReasoningRequest {
        ReasoningRequest {
            stage,
            thought_id: thought.thought_id.clone(),
            thought_type: thought.thought_type,
            content: thought.content.clone(),
            depth: thought.depth,
            ponder_notes: thought.ponder_notes.clone(),
            system_prompt: profile.system_prompt.clone(),
            candidates: Vec::new(),
            csdma_flags: csdma.flag_names(),
            feedback: None,
        }
    }

    /// Call the backend and parse its answer, retrying both failures and
    /// malformed output.
    async fn invoke<T>(
        &self,
        request: &ReasoningRequest,
        parse: impl Fn(Value) -> Result<T, DmaError>,
    ) -> Result<T, DmaError> {
        let attempts = self.retry_limit.max(1);
        let stage = request.stage.to_string();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(self.timeout, self.backend.evaluate(request)).await
            {
                Ok(Ok(raw)) => parse(raw),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DmaError::Timeout {
                    stage: stage.clone(),
                    timeout_secs: self.timeout.as_secs(),
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        stage = %stage,
                        backend = self.backend.name(),
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "dma stage failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(DmaError::RetriesExhausted {
            stage,
            attempts,
            last_error,
        })
    }
}

fn forced_defer(csdma: CsdmaResult, pdma: Option<PdmaResult>, error: &DmaError) -> DmaOutcome {
    DmaOutcome {
        selection: ActionSelectionResult::defer(format!("decision pipeline failed: {error}")),
        csdma,
        pdma,
        error: Some(error.to_string()),
    }
}
