//! Guardrails applied to every selection before it reaches a handler.
//!
//! Each [`Guardrail`] sees the pending selection and answers with a
//! [`Verdict`]. The chain itself enforces bypass prevention: once the
//! selection is DEFER or REJECT it can only move to another conservative
//! action, and retry requests are ignored.

pub mod guardrails;

pub use guardrails::{DepthGuardrail, PlausibilityGuardrail, SecretsGuardrail};

use crate::config::{GuardrailConfig, SecretsConfig};
use crate::dma::CsdmaResult;
use crate::error::GuardrailError;
use crate::schemas::{ActionSelectionResult, Thought};
use crate::secrets::SecretsVault;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    /// Re-run action selection with this feedback.
    Retry { feedback: String },
    /// Replace the selection.
    Override {
        selection: ActionSelectionResult,
        reason: String,
    },
}

/// What a guardrail may look at besides the selection itself.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailContext<'a> {
    pub thought: &'a Thought,
    pub csdma: &'a CsdmaResult,
    pub max_depth: u32,
}

pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn check<'a>(
        &'a self,
        selection: &'a ActionSelectionResult,
        ctx: GuardrailContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, GuardrailError>> + Send + 'a>>;
}

/// One guardrail intervention, kept for the audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailHit {
    pub guardrail: String,
    pub detail: String,
}

impl fmt::Display for GuardrailHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.guardrail, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub selection: ActionSelectionResult,
    pub hits: Vec<GuardrailHit>,
    /// Feedback of the guardrail that asked for a new selection.
    pub retry: Option<String>,
}

impl ChainOutcome {
    pub fn hit_strings(&self) -> Vec<String> {
        self.hits.iter().map(ToString::to_string).collect()
    }
}

#[derive(Default)]
pub struct ConscienceChain {
    guardrails: Vec<Box<dyn Guardrail>>,
}

impl ConscienceChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain: depth, then plausibility, then secrets. With
    /// guardrails disabled only the depth cap remains.
    pub fn from_config(
        guardrails: &GuardrailConfig,
        secrets: &SecretsConfig,
        vault: Arc<SecretsVault>,
    ) -> Self {
        let mut chain = Self::new().push(DepthGuardrail);
        if !guardrails.enabled {
            tracing::warn!("optional guardrails disabled by configuration");
            return chain;
        }
        if guardrails.plausibility_check {
            chain = chain.push(PlausibilityGuardrail::new(guardrails.plausibility_min_score));
        }
        chain.push(SecretsGuardrail::new(vault, secrets.sensitivity))
    }

    #[must_use]
    pub fn push(mut self, guardrail: impl Guardrail + 'static) -> Self {
        self.guardrails.push(Box::new(guardrail));
        self
    }

    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    /// Run every guardrail in order. Stops early only on an accepted retry.
    /// Once the selection is DEFER or REJECT it is never changed again.
    pub async fn run(
        &self,
        selection: ActionSelectionResult,
        ctx: GuardrailContext<'_>,
    ) -> ChainOutcome {
        let mut current = selection;
        let mut hits = Vec::new();

        for guardrail in &self.guardrails {
            let name = guardrail.name().to_string();
            let verdict = match guardrail.check(&current, ctx).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    tracing::warn!(
                        guardrail = %name,
                        thought_id = %ctx.thought.thought_id,
                        error = %e,
                        "guardrail failed"
                    );
                    if !current.kind().is_conservative() {
                        current =
                            ActionSelectionResult::defer(format!("guardrail {name} failed: {e}"));
                    }
                    hits.push(GuardrailHit {
                        guardrail: name,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };

            match verdict {
                Verdict::Pass => {}
                Verdict::Retry { feedback } => {
                    if current.kind().is_conservative() {
                        tracing::debug!(guardrail = %name, "retry ignored for conservative action");
                        continue;
                    }
                    hits.push(GuardrailHit {
                        guardrail: name,
                        detail: feedback.clone(),
                    });
                    return ChainOutcome {
                        selection: current,
                        hits,
                        retry: Some(feedback),
                    };
                }
                Verdict::Override { selection, reason } => {
                    let from = current.kind();
                    let to = selection.kind();
                    if from.is_conservative() && from != to {
                        let err = GuardrailError::BypassAttempt {
                            guardrail: name.clone(),
                            from: from.to_string(),
                            to: to.to_string(),
                        };
                        tracing::warn!(thought_id = %ctx.thought.thought_id, error = %err, "override refused");
                        hits.push(GuardrailHit {
                            guardrail: name,
                            detail: err.to_string(),
                        });
                        continue;
                    }
                    tracing::info!(
                        guardrail = %name,
                        thought_id = %ctx.thought.thought_id,
                        from = %from,
                        to = %to,
                        reason = %reason,
                        "guardrail override"
                    );
                    hits.push(GuardrailHit {
                        guardrail: name,
                        detail: reason,
                    });
                    current = selection;
                }
            }
        }

        ChainOutcome {
            selection: current,
            hits,
            retry: None,
        }
    }
}
