use super::{Guardrail, GuardrailContext, Verdict};
use crate::config::Sensitivity;
use crate::error::GuardrailError;
use crate::schemas::{ActionKind, ActionParams, ActionSelectionResult};
use crate::secrets::SecretsVault;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type CheckFuture<'a> = Pin<Box<dyn Future<Output = Result<Verdict, GuardrailError>> + Send + 'a>>;

// ─── Depth ───────────────────────────────────────────────────────────────────

/// At the depth limit only actions that close the task may proceed; anything
/// that would spawn a deeper thought becomes DEFER.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthGuardrail;

impl Guardrail for DepthGuardrail {
    fn name(&self) -> &str {
        "depth"
    }

    fn check<'a>(
        &'a self,
        selection: &'a ActionSelectionResult,
        ctx: GuardrailContext<'a>,
    ) -> CheckFuture<'a> {
        Box::pin(async move {
            if !ctx.thought.at_depth_limit(ctx.max_depth) || selection.kind().closes_task() {
                return Ok(Verdict::Pass);
            }
            let reason = format!(
                "thought depth {} reached the maximum of {}",
                ctx.thought.depth, ctx.max_depth
            );
            Ok(Verdict::Override {
                selection: ActionSelectionResult::defer(reason.clone()),
                reason,
            })
        })
    }
}

// ─── Plausibility ───────────────────────────────────────────────────────────

/// Sends SPEAK back for reconsideration when the thought scored low on
/// common sense.
#[derive(Debug, Clone, Copy)]
pub struct PlausibilityGuardrail {
    min_score: u8,
}

impl PlausibilityGuardrail {
    pub fn new(min_score: u8) -> Self {
        Self { min_score }
    }
}

impl Guardrail for PlausibilityGuardrail {
    fn name(&self) -> &str {
        "plausibility"
    }

    fn check<'a>(
        &'a self,
        selection: &'a ActionSelectionResult,
        ctx: GuardrailContext<'a>,
    ) -> CheckFuture<'a> {
        Box::pin(async move {
            if selection.kind() != ActionKind::Speak || ctx.csdma.score >= self.min_score {
                return Ok(Verdict::Pass);
            }
            let flags = ctx.csdma.flag_names();
            let feedback = if flags.is_empty() {
                format!(
                    "common-sense score {} is below {}; verify before speaking",
                    ctx.csdma.score, self.min_score
                )
            } else {
                format!(
                    "common-sense score {} is below {} ({}); verify before speaking",
                    ctx.csdma.score,
                    self.min_score,
                    flags.join(", ")
                )
            };
            Ok(Verdict::Retry { feedback })
        })
    }
}

// ─── Secrets ────────────────────────────────────────────────────────────────

/// Moves secrets found in action parameters or rationale into the vault,
/// leaving references behind. The action kind never changes.
pub struct SecretsGuardrail {
    vault: Arc<SecretsVault>,
    sensitivity: Sensitivity,
}

impl SecretsGuardrail {
    pub fn new(vault: Arc<SecretsVault>, sensitivity: Sensitivity) -> Self {
        Self { vault, sensitivity }
    }

    fn failure(message: impl ToString) -> GuardrailError {
        GuardrailError::Violation {
            guardrail: "secrets".into(),
            reason: message.to_string(),
        }
    }
}

impl Guardrail for SecretsGuardrail {
    fn name(&self) -> &str {
        "secrets"
    }

    fn check<'a>(
        &'a self,
        selection: &'a ActionSelectionResult,
        _ctx: GuardrailContext<'a>,
    ) -> CheckFuture<'a> {
        Box::pin(async move {
            let mut action = serde_json::to_value(&selection.action).map_err(Self::failure)?;
            let mut labels = self
                .vault
                .protect_json(&mut action, self.sensitivity)
                .await
                .map_err(Self::failure)?;
            let rationale = self
                .vault
                .protect(&selection.rationale, self.sensitivity)
                .await
                .map_err(Self::failure)?;
            labels.extend(rationale.labels);

            if labels.is_empty() {
                return Ok(Verdict::Pass);
            }

            let action: ActionParams = serde_json::from_value(action).map_err(Self::failure)?;
            labels.sort();
            labels.dedup();
            Ok(Verdict::Override {
                selection: ActionSelectionResult {
                    action,
                    rationale: rationale.text,
                    confidence: selection.confidence,
                },
                reason: format!("secrets moved to vault: {}", labels.join(", ")),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conscience::ConscienceChain;
    use crate::dma::{CommonSenseDma, CsdmaResult};
    use crate::persistence::sqlite::connect;
    use crate::schemas::{Task, TaskContext, Thought, ThoughtType, ToolParams};
    use tempfile::TempDir;

    fn thought_at_depth(depth: u32) -> Thought {
        let mut thought = Thought::seed(&Task::new("Hello", 0, TaskContext::default()));
        for _ in 0..depth {
            thought = thought.child(ThoughtType::Followup, "Hello");
        }
        thought
    }

    fn clean() -> CsdmaResult {
        CommonSenseDma::new().evaluate("Hello")
    }

    async fn vault(dir: &TempDir) -> Arc<SecretsVault> {
        let pool = connect("sqlite::memory:").await.unwrap();
        Arc::new(SecretsVault::new(pool, dir.path(), true).await.unwrap())
    }

    #[tokio::test]
    async fn depth_limit_turns_speak_into_defer() {
        let thought = thought_at_depth(3);
        let csdma = clean();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 3,
        };
        let verdict = DepthGuardrail
            .check(&ActionSelectionResult::speak("more", "continue"), ctx)
            .await
            .unwrap();
        match verdict {
            Verdict::Override { selection, .. } => assert_eq!(selection.kind(), ActionKind::Defer),
            other => panic!("expected override, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn depth_limit_lets_task_complete_through() {
        let thought = thought_at_depth(3);
        let csdma = clean();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 3,
        };
        let verdict = DepthGuardrail
            .check(&ActionSelectionResult::task_complete(None, "done"), ctx)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn below_depth_limit_passes() {
        let thought = thought_at_depth(2);
        let csdma = clean();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 3,
        };
        let verdict = DepthGuardrail
            .check(&ActionSelectionResult::speak("more", "continue"), ctx)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn implausible_speech_asks_for_retry() {
        let thought = thought_at_depth(0);
        let csdma = CommonSenseDma::new().evaluate("teleport to the moon and live forever");
        assert_eq!(csdma.score, 8);
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 7,
        };
        let verdict = PlausibilityGuardrail::new(9)
            .check(&ActionSelectionResult::speak("sure", "ok"), ctx)
            .await
            .unwrap();
        match verdict {
            Verdict::Retry { feedback } => {
                assert!(feedback.contains("Physical_Implausibility"), "{feedback}");
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plausibility_ignores_other_actions() {
        let thought = thought_at_depth(0);
        let csdma = CommonSenseDma::new().evaluate("perpetual motion");
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 7,
        };
        let verdict = PlausibilityGuardrail::new(10)
            .check(&ActionSelectionResult::ponder(vec!["really?".into()], "unsure"), ctx)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn secrets_are_lifted_from_parameters_and_rationale() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let thought = thought_at_depth(0);
        let csdma = clean();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 7,
        };
        let selection = ActionSelectionResult::new(
            ActionParams::Tool(ToolParams {
                name: "deploy".into(),
                arguments: serde_json::json!({"token": "ghp_abcdefghijklmnop1234"}),
                timeout_seconds: None,
            }),
            "use key sk-abcdefghijklmnop",
        );

        let verdict = SecretsGuardrail::new(vault.clone(), Sensitivity::Low)
            .check(&selection, ctx)
            .await
            .unwrap();
        let Verdict::Override { selection, reason } = verdict else {
            panic!("expected override");
        };
        assert_eq!(selection.kind(), ActionKind::Tool);
        assert!(!serde_json::to_string(&selection).unwrap().contains("ghp_"));
        assert!(!selection.rationale.contains("sk-"));
        assert!(reason.contains("api_key") && reason.contains("github_token"));
        assert_eq!(vault.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn secrets_scrub_still_applies_after_deferral() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let thought = thought_at_depth(0);
        let csdma = clean();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth: 7,
        };
        let chain = ConscienceChain::new().push(SecretsGuardrail::new(vault, Sensitivity::Low));
        let outcome = chain
            .run(
                ActionSelectionResult::defer("blocked on key sk-abcdefghijklmnop"),
                ctx,
            )
            .await;
        assert_eq!(outcome.selection.kind(), ActionKind::Defer);
        assert!(!outcome.selection.rationale.contains("sk-abcdefghijklmnop"));
    }
}
