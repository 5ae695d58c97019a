//! Final step of the DMA pipeline: one concrete action per thought.

use super::csdma::CsdmaResult;
use crate::error::DmaError;
use crate::schemas::{
    ActionKind, ActionParams, ActionSelectionResult, DeferParams, ObserveParams, PonderParams,
};
use serde_json::Value;

/// Nearest permitted substitutes for an action, closest first. DEFER is the
/// implicit last resort.
pub fn fallbacks(kind: ActionKind) -> &'static [ActionKind] {
    match kind {
        ActionKind::Recall => &[ActionKind::Observe, ActionKind::Ponder],
        ActionKind::Speak
        | ActionKind::Memorize
        | ActionKind::Forget
        | ActionKind::Observe
        | ActionKind::Tool
        | ActionKind::TaskComplete => &[ActionKind::Ponder],
        ActionKind::Ponder | ActionKind::Reject => &[ActionKind::Defer],
        ActionKind::Defer => &[],
    }
}

pub struct ActionSelectionDma {
    csdma_min_score: u8,
}

impl ActionSelectionDma {
    pub fn new(csdma_min_score: u8) -> Self {
        Self { csdma_min_score }
    }

    pub fn parse(raw: Value) -> Result<ActionSelectionResult, DmaError> {
        serde_json::from_value(raw).map_err(|e| DmaError::MalformedOutput {
            stage: "ACTION_SELECTION".into(),
            message: e.to_string(),
        })
    }

    /// Apply PDMA viability, plausibility and policy to the backend's
    /// choice. An empty `candidates` means PDMA did not run.
    pub fn finalize(
        &self,
        selection: ActionSelectionResult,
        csdma: &CsdmaResult,
        candidates: &[ActionKind],
        allowed: &[ActionKind],
    ) -> ActionSelectionResult {
        let selection = viable(selection, candidates);
        let selection = if csdma.score < self.csdma_min_score && !selection.kind().is_conservative()
        {
            let questions = csdma
                .flags
                .iter()
                .map(|flag| format!("Is this plausible despite {flag}?"))
                .collect::<Vec<_>>();
            let questions = if questions.is_empty() {
                vec![format!("Plausibility score {} is too low; what is missing?", csdma.score)]
            } else {
                questions
            };
            tracing::debug!(score = csdma.score, "low plausibility, pondering instead");
            ActionSelectionResult::ponder(
                questions,
                format!(
                    "common-sense score {} is below {}",
                    csdma.score, self.csdma_min_score
                ),
            )
        } else {
            selection
        };

        if allowed.contains(&selection.kind()) {
            return selection;
        }
        substitute(selection, allowed)
    }
}

/// The backend may only pick what PDMA left standing; anything else gives
/// way to the best-ranked candidate that needs no parameters, or DEFER.
fn viable(selection: ActionSelectionResult, candidates: &[ActionKind]) -> ActionSelectionResult {
    let chosen = selection.kind();
    if candidates.is_empty() || chosen.is_conservative() || candidates.contains(&chosen) {
        return selection;
    }
    let rationale = format!("{chosen} was not among the ethically viable candidates");
    tracing::info!(action = %chosen, ?candidates, "selection outside pdma candidates");
    match candidates.first() {
        Some(ActionKind::Reject) => ActionSelectionResult::reject(rationale),
        Some(ActionKind::Ponder) => ActionSelectionResult::ponder(
            vec![format!("{chosen} is not viable; how else can this be handled?")],
            rationale,
        ),
        _ => ActionSelectionResult::defer(rationale),
    }
}

fn substitute(selection: ActionSelectionResult, allowed: &[ActionKind]) -> ActionSelectionResult {
    let original = selection.kind();
    let rationale = format!("{original} is not permitted for this agent");
    for kind in fallbacks(original) {
        if !allowed.contains(kind) {
            continue;
        }
        let action = match kind {
            ActionKind::Observe => ActionParams::Observe(ObserveParams {
                channel_id: None,
                limit: 20,
                before: None,
            }),
            ActionKind::Ponder => ActionParams::Ponder(PonderParams {
                questions: vec![format!("{original} is not permitted; how else can this be handled?")],
            }),
            _ => break,
        };
        tracing::debug!(from = %original, to = %kind, "substituted disallowed action");
        return ActionSelectionResult::new(action, rationale);
    }
    ActionSelectionResult::new(
        ActionParams::Defer(DeferParams {
            reason: rationale.clone(),
            defer_until: None,
        }),
        rationale,
    )
}
