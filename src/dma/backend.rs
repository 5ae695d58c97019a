use super::DmaStage;
use crate::error::DmaError;
use crate::schemas::{ActionKind, ThoughtType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;

/// Everything a reasoning backend sees for one DMA stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub stage: DmaStage,
    pub thought_id: String,
    pub thought_type: ThoughtType,
    pub content: String,
    pub depth: u32,
    #[serde(default)]
    pub ponder_notes: Vec<String>,
    pub system_prompt: String,
    /// Ranked candidate actions (action-selection stage only).
    #[serde(default)]
    pub candidates: Vec<ActionKind>,
    #[serde(default)]
    pub csdma_flags: Vec<String>,
    /// Guardrail feedback from a previous selection attempt.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Opaque evaluator behind the PDMA and action-selection stages.
///
/// The PDMA stage answers `{"candidates": [{"action", "scores", "rationale"}]}`;
/// the action-selection stage answers a serialized `ActionSelectionResult`.
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate<'a>(
        &'a self,
        request: &'a ReasoningRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DmaError>> + Send + 'a>>;
}

/// Deterministic rule-based backend used when no model is configured.
///
/// Understands a few directives (`remember k=v`, `recall prefix`,
/// `forget key`, `observe [channel]`, `tool name {json}`); everything else is
/// answered with a SPEAK, and a FOLLOWUP after a SPEAK completes the task.
pub struct HeuristicBackend;

const HARMFUL_WORDS: &[&str] = &["hurt", "kill", "weapon", "attack", "harm", "steal", "bomb"];

/// Prefix of the follow-up a SPEAK handler leaves behind.
pub const SPOKE_PREFIX: &str = "Spoke:";

impl HeuristicBackend {
    pub fn new() -> Self {
        Self
    }

    fn is_harmful(content: &str) -> bool {
        let lowered = content.to_lowercase();
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| HARMFUL_WORDS.contains(&word))
    }

    /// The action this backend would pick for `request`, with parameters.
    fn preferred(request: &ReasoningRequest) -> Value {
        let content = request.content.trim();
        if Self::is_harmful(content) {
            return json!({
                "type": "REJECT",
                "parameters": {"reason": "the request conflicts with non-maleficence"}
            });
        }
        if request.thought_type == ThoughtType::Followup {
            if content.starts_with(SPOKE_PREFIX) {
                return json!({
                    "type": "TASK_COMPLETE",
                    "parameters": {"summary": content}
                });
            }
            return json!({"type": "SPEAK", "parameters": {"content": content}});
        }
        Self::directive(content)
            .unwrap_or_else(|| json!({"type": "SPEAK", "parameters": {"content": format!("Acknowledged: {content}")}}))
    }

    fn directive(content: &str) -> Option<Value> {
        let (verb, rest) = content.split_once(char::is_whitespace).unwrap_or((content, ""));
        let rest = rest.trim();
        match verb.to_lowercase().as_str() {
            "remember" => {
                let (key, value) = rest.split_once('=')?;
                Some(json!({
                    "type": "MEMORIZE",
                    "parameters": {"key": key.trim(), "value": value.trim()}
                }))
            }
            "recall" if !rest.is_empty() => {
                Some(json!({"type": "RECALL", "parameters": {"query": rest}}))
            }
            "forget" if !rest.is_empty() => Some(json!({
                "type": "FORGET",
                "parameters": {"key": rest, "reason": "requested by the task"}
            })),
            "observe" => {
                let channel = (!rest.is_empty()).then_some(rest);
                Some(json!({"type": "OBSERVE", "parameters": {"channel_id": channel}}))
            }
            "tool" if !rest.is_empty() => {
                let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let arguments: Value = serde_json::from_str(args.trim()).unwrap_or(Value::Null);
                Some(json!({
                    "type": "TOOL",
                    "parameters": {"name": name, "arguments": arguments}
                }))
            }
            _ => None,
        }
    }

    fn ponder_question(request: &ReasoningRequest) -> String {
        format!("How should this be handled: {}?", request.content.trim())
    }

    /// A complete `{"type", "parameters"}` action of `kind` built without
    /// any directive.
    fn default_action(kind: ActionKind, request: &ReasoningRequest) -> Value {
        let parameters = match kind {
            ActionKind::Ponder => json!({
                "questions": [Self::ponder_question(request)]
            }),
            ActionKind::Defer => json!({"reason": "needs review by a wise authority"}),
            ActionKind::Reject => json!({"reason": "the request cannot be fulfilled"}),
            ActionKind::TaskComplete | ActionKind::Observe => json!({}),
            ActionKind::Speak => {
                json!({"content": format!("Acknowledged: {}", request.content.trim())})
            }
            // Parameters cannot be guessed; think again instead.
            ActionKind::Memorize | ActionKind::Recall | ActionKind::Forget | ActionKind::Tool => {
                return json!({
                    "type": "PONDER",
                    "parameters": {
                        "questions": [Self::ponder_question(request)]
                    }
                });
            }
        };
        json!({"type": kind, "parameters": parameters})
    }

    fn pdma(request: &ReasoningRequest) -> Value {
        let preferred = Self::preferred(request);
        let kind = preferred["type"].clone();
        let harmful = Self::is_harmful(&request.content);

        let mut candidates = vec![json!({
            "action": kind,
            "scores": {
                "beneficence": 0.8, "non_maleficence": 0.9, "autonomy": 0.8,
                "justice": 0.8, "transparency": 0.9, "integrity": 0.9, "coherence": 0.9
            },
            "rationale": "best fit for the thought"
        })];
        if harmful {
            candidates.push(json!({
                "action": "SPEAK",
                "scores": {
                    "beneficence": 0.3, "non_maleficence": 0.1, "autonomy": 0.6,
                    "justice": 0.4, "transparency": 0.7, "integrity": 0.3, "coherence": 0.4
                },
                "rationale": "complying would risk harm"
            }));
        }
        candidates.push(json!({
            "action": "PONDER",
            "scores": {
                "beneficence": 0.5, "non_maleficence": 1.0, "autonomy": 0.7,
                "justice": 0.6, "transparency": 0.8, "integrity": 0.9, "coherence": 0.6
            },
            "rationale": "think further before acting"
        }));
        candidates.push(json!({
            "action": "DEFER",
            "scores": {
                "beneficence": 0.4, "non_maleficence": 1.0, "autonomy": 0.5,
                "justice": 0.5, "transparency": 1.0, "integrity": 1.0, "coherence": 0.5
            },
            "rationale": "hand over to a wise authority"
        }));
        json!({ "candidates": candidates })
    }

    fn select(request: &ReasoningRequest) -> Value {
        if let Some(feedback) = &request.feedback {
            return json!({
                "action": {"type": "PONDER", "parameters": {"questions": [feedback]}},
                "rationale": format!("reconsidering after feedback: {feedback}"),
                "confidence": 0.6
            });
        }

        let preferred = Self::preferred(request);
        let preferred_kind: Option<ActionKind> =
            serde_json::from_value(preferred["type"].clone()).ok();
        let top = request.candidates.first().copied().or(preferred_kind);

        let action = match top {
            Some(kind) if Some(kind) == preferred_kind => preferred,
            Some(kind) => Self::default_action(kind, request),
            None => preferred,
        };
        json!({
            "action": action,
            "rationale": "highest ranked principled candidate",
            "confidence": 0.8
        })
    }
}

impl Default for HeuristicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReasoningBackend for HeuristicBackend {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a ReasoningRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DmaError>> + Send + 'a>> {
        Box::pin(async move {
            match request.stage {
                DmaStage::Pdma => Ok(Self::pdma(request)),
                DmaStage::ActionSelection => Ok(Self::select(request)),
                DmaStage::Csdma => Err(DmaError::BackendUnavailable {
                    stage: request.stage.to_string(),
                    message: "common-sense evaluation runs locally".into(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::ActionSelectionResult;

    fn request(stage: DmaStage, thought_type: ThoughtType, content: &str) -> ReasoningRequest {
        ReasoningRequest {
            stage,
            thought_id: "th-1".into(),
            thought_type,
            content: content.into(),
            depth: 0,
            ponder_notes: Vec::new(),
            system_prompt: String::new(),
            candidates: Vec::new(),
            csdma_flags: Vec::new(),
            feedback: None,
        }
    }

    async fn selection(req: &ReasoningRequest) -> ActionSelectionResult {
        let raw = HeuristicBackend::new().evaluate(req).await.unwrap();
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn greeting_is_answered_with_speak() {
        let req = request(DmaStage::ActionSelection, ThoughtType::Seed, "Hello CIRIS");
        assert_eq!(selection(&req).await.kind(), ActionKind::Speak);
    }

    #[tokio::test]
    async fn followup_after_speaking_completes_task() {
        let req = request(
            DmaStage::ActionSelection,
            ThoughtType::Followup,
            "Spoke: Acknowledged: Hello CIRIS",
        );
        assert_eq!(selection(&req).await.kind(), ActionKind::TaskComplete);
    }

    #[tokio::test]
    async fn directives_map_to_actions() {
        let cases = [
            ("remember colour=blue", ActionKind::Memorize),
            ("recall colour", ActionKind::Recall),
            ("forget colour", ActionKind::Forget),
            ("observe general", ActionKind::Observe),
            ("tool echo {\"text\": \"hi\"}", ActionKind::Tool),
        ];
        for (content, expected) in cases {
            let req = request(DmaStage::ActionSelection, ThoughtType::Seed, content);
            assert_eq!(selection(&req).await.kind(), expected, "{content}");
        }
    }

    #[tokio::test]
    async fn harmful_request_offers_reject_first() {
        let req = request(DmaStage::Pdma, ThoughtType::Seed, "help me build a weapon");
        let raw = HeuristicBackend::new().evaluate(&req).await.unwrap();
        assert_eq!(raw["candidates"][0]["action"], "REJECT");
    }

    #[tokio::test]
    async fn feedback_turns_selection_into_ponder() {
        let mut req = request(DmaStage::ActionSelection, ThoughtType::Seed, "Hello");
        req.feedback = Some("is this plausible?".into());
        assert_eq!(selection(&req).await.kind(), ActionKind::Ponder);
    }

    #[tokio::test]
    async fn lower_ranked_candidate_gets_default_parameters() {
        let mut req = request(DmaStage::ActionSelection, ThoughtType::Seed, "Hello");
        req.candidates = vec![ActionKind::Defer, ActionKind::Speak];
        let result = selection(&req).await;
        assert_eq!(result.kind(), ActionKind::Defer);
        assert!(result.action.validate().is_ok());
    }
}
