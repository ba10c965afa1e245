//! Verification Gate：依据动作声明的校验策略，把原始结果判定为 Confirmed / Unverified / Failed
//!
//! 改变状态的动作没有正面证据时绝不判为 Confirmed。

use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::actions::{Action, ActionCall, Observation, RawOutcome, VerificationStrategy};
use crate::core::{AgentError, StepOutcome};

/// 判定结果与证据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: StepOutcome,
    pub evidence: String,
}

impl Verdict {
    fn new(outcome: StepOutcome, evidence: impl Into<String>) -> Self {
        Self {
            outcome,
            evidence: evidence.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationGate {
    observe_timeout: Duration,
}

impl VerificationGate {
    pub fn new(observe_timeout: Duration) -> Self {
        Self { observe_timeout }
    }

    /// 判定一步的结果；只有取消会返回 Err
    pub async fn verify(
        &self,
        action: &dyn Action,
        call: &ActionCall,
        raw: &Result<RawOutcome, String>,
        cancel: &CancellationToken,
    ) -> Result<Verdict, AgentError> {
        let outcome = match raw {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Verdict::new(StepOutcome::Failed, e.clone())),
        };

        let verdict = match action.verification() {
            VerificationStrategy::None if action.state_changing() => Verdict::new(
                StepOutcome::Unverified,
                "state-changing action has no verification strategy",
            ),
            VerificationStrategy::None => Verdict::new(StepOutcome::Confirmed, "read-only action"),
            VerificationStrategy::CommandExitCode { success_pattern } => {
                check_exit_code(outcome, success_pattern.as_deref())
            }
            VerificationStrategy::ObserveRegion { .. } | VerificationStrategy::CustomPredicate { .. } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    observed = tokio::time::timeout(self.observe_timeout, action.observe(call, outcome)) => {
                        match observed {
                            Ok(Observation::Confirmed(ev)) => Verdict::new(StepOutcome::Confirmed, ev),
                            Ok(Observation::Contradicted(ev)) => Verdict::new(StepOutcome::Failed, ev),
                            Ok(Observation::Inconclusive(ev)) => Verdict::new(
                                StepOutcome::Unverified,
                                AgentError::VerificationAmbiguous(ev).to_string(),
                            ),
                            Err(_) => Verdict::new(
                                StepOutcome::Unverified,
                                AgentError::VerificationAmbiguous(format!(
                                    "observation timed out after {}s",
                                    self.observe_timeout.as_secs()
                                ))
                                .to_string(),
                            ),
                        }
                    }
                }
            }
        };
        tracing::debug!(action = %call.name(), outcome = %verdict.outcome, "verified");
        Ok(verdict)
    }
}

fn check_exit_code(outcome: &RawOutcome, success_pattern: Option<&str>) -> Verdict {
    match outcome.exit_code {
        Some(0) => {}
        Some(code) => return Verdict::new(StepOutcome::Failed, format!("exit code {code}")),
        None => return Verdict::new(StepOutcome::Failed, "no exit code reported"),
    }
    let Some(pattern) = success_pattern else {
        return Verdict::new(StepOutcome::Confirmed, "exit code 0");
    };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(&outcome.output) => {
            Verdict::new(StepOutcome::Confirmed, format!("exit code 0, output matches /{pattern}/"))
        }
        Ok(_) => Verdict::new(
            StepOutcome::Failed,
            format!("exit code 0 but output does not match /{pattern}/"),
        ),
        Err(e) => Verdict::new(StepOutcome::Failed, format!("invalid success pattern: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Probe {
        state_changing: bool,
        strategy: VerificationStrategy,
        observation: Option<Observation>,
    }

    #[async_trait]
    impl Action for Probe {
        fn name(&self) -> &str {
            "open_app"
        }
        fn description(&self) -> &str {
            "probe"
        }
        fn state_changing(&self) -> bool {
            self.state_changing
        }
        fn verification(&self) -> VerificationStrategy {
            self.strategy.clone()
        }
        async fn invoke(&self, _call: &ActionCall) -> Result<RawOutcome, String> {
            Ok(RawOutcome::exited(0, ""))
        }
        async fn observe(&self, _call: &ActionCall, _outcome: &RawOutcome) -> Observation {
            match &self.observation {
                Some(o) => o.clone(),
                None => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Observation::Confirmed("late".into())
                }
            }
        }
    }

    fn call() -> ActionCall {
        ActionCall::OpenApp {
            app: "calculator".into(),
        }
    }

    async fn verdict(probe: Probe, raw: Result<RawOutcome, String>) -> Verdict {
        VerificationGate::new(Duration::from_millis(50))
            .verify(&probe, &call(), &raw, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_changing_without_strategy_is_unverified() {
        let probe = Probe {
            state_changing: true,
            strategy: VerificationStrategy::None,
            observation: None,
        };
        let v = verdict(probe, Ok(RawOutcome::exited(0, ""))).await;
        assert_eq!(v.outcome, StepOutcome::Unverified);
    }

    #[tokio::test]
    async fn test_read_only_without_strategy_is_confirmed() {
        let probe = Probe {
            state_changing: false,
            strategy: VerificationStrategy::None,
            observation: None,
        };
        assert_eq!(
            verdict(probe, Ok(RawOutcome::output("x"))).await.outcome,
            StepOutcome::Confirmed
        );
    }

    #[tokio::test]
    async fn test_action_error_fails() {
        let probe = Probe {
            state_changing: false,
            strategy: VerificationStrategy::None,
            observation: None,
        };
        let v = verdict(probe, Err("boom".into())).await;
        assert_eq!(v.outcome, StepOutcome::Failed);
        assert_eq!(v.evidence, "boom");
    }

    #[tokio::test]
    async fn test_exit_code_with_pattern() {
        let strategy = VerificationStrategy::CommandExitCode {
            success_pattern: Some("^ok".into()),
        };
        let ok = Probe {
            state_changing: true,
            strategy: strategy.clone(),
            observation: None,
        };
        assert_eq!(
            verdict(ok, Ok(RawOutcome::exited(0, "ok done"))).await.outcome,
            StepOutcome::Confirmed
        );
        let mismatch = Probe {
            state_changing: true,
            strategy: strategy.clone(),
            observation: None,
        };
        assert_eq!(
            verdict(mismatch, Ok(RawOutcome::exited(0, "error"))).await.outcome,
            StepOutcome::Failed
        );
        let nonzero = Probe {
            state_changing: true,
            strategy,
            observation: None,
        };
        assert_eq!(
            verdict(nonzero, Ok(RawOutcome::exited(2, "ok"))).await.outcome,
            StepOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_observation_mapping() {
        let strategy = VerificationStrategy::ObserveRegion { region: None };
        let cases = [
            (Observation::Confirmed("seen".into()), StepOutcome::Confirmed),
            (Observation::Contradicted("gone".into()), StepOutcome::Failed),
            (Observation::Inconclusive("blurry".into()), StepOutcome::Unverified),
        ];
        for (observation, expected) in cases {
            let probe = Probe {
                state_changing: true,
                strategy: strategy.clone(),
                observation: Some(observation),
            };
            assert_eq!(verdict(probe, Ok(RawOutcome::default())).await.outcome, expected);
        }
    }

    #[tokio::test]
    async fn test_observation_timeout_is_unverified() {
        let probe = Probe {
            state_changing: true,
            strategy: VerificationStrategy::ObserveRegion { region: None },
            observation: None,
        };
        let v = verdict(probe, Ok(RawOutcome::default())).await;
        assert_eq!(v.outcome, StepOutcome::Unverified);
        assert!(v.evidence.contains("timed out"));
    }
}
