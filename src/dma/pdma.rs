//! Principled evaluation of candidate actions.

use crate::error::DmaError;
use crate::schemas::ActionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Per-principle scores in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrincipleScores {
    pub beneficence: f64,
    pub non_maleficence: f64,
    pub autonomy: f64,
    pub justice: f64,
    pub transparency: f64,
    pub integrity: f64,
    /// Meta-goal: fit with the agent's identity and prior actions.
    pub coherence: f64,
}

impl PrincipleScores {
    pub fn mean(&self) -> f64 {
        (self.beneficence
            + self.non_maleficence
            + self.autonomy
            + self.justice
            + self.transparency
            + self.integrity
            + self.coherence)
            / 7.0
    }

    fn clamped(self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            beneficence: c(self.beneficence),
            non_maleficence: c(self.non_maleficence),
            autonomy: c(self.autonomy),
            justice: c(self.justice),
            transparency: c(self.transparency),
            integrity: c(self.integrity),
            coherence: c(self.coherence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub action: ActionKind,
    pub scores: PrincipleScores,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdmaResult {
    /// Viable candidates, best first.
    pub ranked: Vec<Candidate>,
    /// Set when no candidate survived ranking.
    pub defer_reason: Option<String>,
}

impl PdmaResult {
    pub fn ranked_actions(&self) -> Vec<ActionKind> {
        self.ranked.iter().map(|c| c.action).collect()
    }
}

/// Orders candidates and drops the ones that are not ethically viable.
pub trait RankingStrategy: Send + Sync {
    fn rank(&self, candidates: Vec<Candidate>) -> Vec<Candidate>;
}

/// Non-maleficence first, then autonomy, then justice balance.
#[derive(Debug, Clone, Copy)]
pub struct PriorityOrderRanker {
    pub non_harm_threshold: f64,
    pub autonomy_threshold: f64,
}

impl Default for PriorityOrderRanker {
    fn default() -> Self {
        Self {
            non_harm_threshold: 0.5,
            autonomy_threshold: 0.3,
        }
    }
}

impl RankingStrategy for PriorityOrderRanker {
    fn rank(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut viable: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.scores.non_maleficence >= self.non_harm_threshold)
            .filter(|c| c.scores.autonomy >= self.autonomy_threshold)
            .collect();
        viable.sort_by(|a, b| {
            descending(a.scores.justice, b.scores.justice)
                .then_with(|| descending(a.scores.coherence, b.scores.coherence))
                .then_with(|| descending(a.scores.mean(), b.scores.mean()))
        });
        viable
    }
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

#[derive(Deserialize)]
struct CandidateList {
    candidates: Vec<Candidate>,
}

pub struct PrincipledDma {
    ranker: Box<dyn RankingStrategy>,
}

impl PrincipledDma {
    pub fn new() -> Self {
        Self::with_ranker(Box::new(PriorityOrderRanker::default()))
    }

    pub fn with_ranker(ranker: Box<dyn RankingStrategy>) -> Self {
        Self { ranker }
    }

    /// Parse backend output of the form `{"candidates": [...]}` and rank it.
    pub fn assess(&self, raw: Value) -> Result<PdmaResult, DmaError> {
        let list: CandidateList =
            serde_json::from_value(raw).map_err(|e| DmaError::MalformedOutput {
                stage: "PDMA".into(),
                message: e.to_string(),
            })?;

        let candidates = list
            .candidates
            .into_iter()
            .map(|c| Candidate {
                scores: c.scores.clamped(),
                ..c
            })
            .collect();
        let ranked = self.ranker.rank(candidates);
        let defer_reason = ranked
            .is_empty()
            .then(|| "no ethically viable candidate action".to_string());
        Ok(PdmaResult {
            ranked,
            defer_reason,
        })
    }
}

impl Default for PrincipledDma {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scores(non_maleficence: f64, autonomy: f64, justice: f64, coherence: f64) -> Value {
        json!({
            "beneficence": 0.5, "non_maleficence": non_maleficence, "autonomy": autonomy,
            "justice": justice, "transparency": 0.5, "integrity": 0.5, "coherence": coherence
        })
    }

    #[test]
    fn harmful_candidates_are_dropped_before_ranking() {
        let raw = json!({"candidates": [
            {"action": "SPEAK", "scores": scores(0.1, 0.9, 1.0, 1.0)},
            {"action": "PONDER", "scores": scores(0.9, 0.9, 0.4, 0.5)}
        ]});
        let result = PrincipledDma::new().assess(raw).unwrap();
        assert_eq!(result.ranked_actions(), vec![ActionKind::Ponder]);
        assert!(result.defer_reason.is_none());
    }

    #[test]
    fn justice_then_coherence_orders_survivors() {
        let raw = json!({"candidates": [
            {"action": "DEFER", "scores": scores(1.0, 0.5, 0.5, 0.9)},
            {"action": "SPEAK", "scores": scores(0.9, 0.8, 0.8, 0.4)},
            {"action": "PONDER", "scores": scores(1.0, 0.7, 0.5, 0.95)}
        ]});
        let result = PrincipledDma::new().assess(raw).unwrap();
        assert_eq!(
            result.ranked_actions(),
            vec![ActionKind::Speak, ActionKind::Ponder, ActionKind::Defer]
        );
    }

    #[test]
    fn low_autonomy_is_not_viable() {
        let raw = json!({"candidates": [
            {"action": "TOOL", "scores": scores(0.9, 0.1, 0.9, 0.9)}
        ]});
        let result = PrincipledDma::new().assess(raw).unwrap();
        assert!(result.ranked.is_empty());
        assert!(result.defer_reason.is_some());
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let raw = json!({"candidates": [
            {"action": "SPEAK", "scores": scores(7.0, -2.0, 0.5, 0.5)}
        ]});
        let ranker = PriorityOrderRanker {
            non_harm_threshold: 0.5,
            autonomy_threshold: 0.0,
        };
        let result = PrincipledDma::with_ranker(Box::new(ranker)).assess(raw).unwrap();
        assert!((result.ranked[0].scores.non_maleficence - 1.0).abs() < f64::EPSILON);
        assert!(result.ranked[0].scores.autonomy.abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_output_is_reported() {
        let err = PrincipledDma::new()
            .assess(json!({"options": []}))
            .unwrap_err();
        assert!(matches!(err, DmaError::MalformedOutput { .. }));
    }
}
