//! Validation and regeneration loop.
//!
//! Each attempt is generated (or corrected), then validated exactly once.
//! The loop accepts the first attempt at or above the threshold; otherwise
//! it retries until `max_attempts` validations have run and returns the
//! best-scored attempt, marked invalid.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EngineConfig, RegenerationStrategy};
use crate::context::{Directives, UsageEstimate};
use crate::engine::types::Artifact;
use crate::error::{EntityError, ValidatorError};
use crate::validator::{ValidationReport, Validator};

/// State of one entity's attempt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Building the attempt's text.
    Generating,
    /// Waiting on the validator.
    Validating,
    /// Below threshold with attempts left.
    Retrying,
    /// Reached the threshold.
    Accepted,
    /// Out of attempts (or nothing left to try).
    Exhausted,
}

impl AttemptState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AttemptState) -> bool {
        use AttemptState::*;

        matches!(
            (self, target),
            (Generating, Validating)
                | (Validating, Accepted)
                | (Validating, Retrying)
                | (Validating, Exhausted)
                | (Retrying, Generating)
                | (Retrying, Exhausted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Exhausted)
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Retrying => "retrying",
            Self::Accepted => "accepted",
            Self::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AttemptState,
    pub to: AttemptState,
    /// Attempt number at the time of the transition.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Current state plus transition history.
#[derive(Debug, Clone)]
struct AttemptTracker {
    state: AttemptState,
    attempt: u32,
    transitions: Vec<StateTransition>,
}

impl AttemptTracker {
    fn new() -> Self {
        Self {
            state: AttemptState::Generating,
            attempt: 1,
            transitions: Vec::new(),
        }
    }

    fn transition_to(&mut self, target: AttemptState) -> Result<(), EntityError> {
        if !self.state.can_transition_to(target) {
            return Err(EntityError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            attempt: self.attempt,
            timestamp: Utc::now(),
        });
        self.state = target;
        Ok(())
    }
}

/// Produces attempts for one entity.
#[async_trait]
pub trait AttemptSource: Send + Sync {
    /// Build attempt `attempt` from scratch. `directives` carries the
    /// accumulated validator feedback on retries.
    async fn generate(&self, attempt: u32, directives: &Directives)
    -> Result<Artifact, EntityError>;

    /// Turn a validator correction into a new, rescored attempt.
    fn adopt_correction(&self, previous: &Artifact, corrected: &str, attempt: u32) -> Artifact;
}

/// What the loop ended with.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Accepted attempt, or the best-scored one when exhausted.
    pub artifact: Artifact,
    /// Validations performed.
    pub attempts: u32,
    pub final_state: AttemptState,
    pub transitions: Vec<StateTransition>,
    /// Validator usage across every attempt, not just the retained one.
    pub validation_usage: UsageEstimate,
}

impl LoopOutcome {
    pub fn accepted(&self) -> bool {
        self.final_state == AttemptState::Accepted
    }
}

/// Loop settings.
#[derive(Debug, Clone)]
pub struct RegenerationLoop {
    pub threshold: u8,
    pub max_attempts: u32,
    pub strategy: RegenerationStrategy,
    pub validator_timeout: Duration,
}

impl RegenerationLoop {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            threshold: config.quality_threshold,
            max_attempts: config.max_attempts.max(1),
            strategy: config.strategy,
            validator_timeout: config.validator_timeout,
        }
    }

    /// Drive attempts until one is accepted or the budget is spent.
    pub async fn run(
        &self,
        source: &dyn AttemptSource,
        validator: &dyn Validator,
        directives: &Directives,
        source_text: Option<&str>,
    ) -> Result<LoopOutcome, EntityError> {
        let mut tracker = AttemptTracker::new();
        let mut directives = directives.clone();
        let mut best: Option<Artifact> = None;
        let mut validation_usage = UsageEstimate::default();
        let mut artifact = source.generate(1, &directives).await?;

        loop {
            tracker.transition_to(AttemptState::Validating)?;
            let report = self.validate(validator, &artifact, source_text).await?;
            artifact.validation_score = Some(report.quality_score);
            artifact.issues = report.issues.clone();
            artifact.usage += report.usage;
            validation_usage += report.usage;

            debug!(
                entity = %artifact.entity.label(),
                attempt = tracker.attempt,
                score = report.quality_score,
                threshold = self.threshold,
                "Attempt validated"
            );

            if report.quality_score >= self.threshold {
                artifact.is_valid = true;
                tracker.transition_to(AttemptState::Accepted)?;
                return Ok(LoopOutcome {
                    artifact,
                    attempts: tracker.attempt,
                    final_state: tracker.state,
                    transitions: tracker.transitions,
                    validation_usage,
                });
            }

            artifact.is_valid = false;
            // Strictly greater: the earliest attempt wins ties.
            if best
                .as_ref()
                .is_none_or(|b| report.quality_score > b.validation_score.unwrap_or(0))
            {
                best = Some(artifact.clone());
            }

            if tracker.attempt >= self.max_attempts {
                tracker.transition_to(AttemptState::Exhausted)?;
                return Ok(self.exhausted(best, artifact, tracker, validation_usage));
            }

            tracker.transition_to(AttemptState::Retrying)?;
            let next = tracker.attempt + 1;
            let correction = report.usable_correction(&artifact.text).map(str::to_string);

            artifact = match (self.strategy, correction) {
                (RegenerationStrategy::AdoptCorrection | RegenerationStrategy::Auto, Some(text)) => {
                    tracker.transition_to(AttemptState::Generating)?;
                    debug!(entity = %artifact.entity.label(), attempt = next, "Adopting correction");
                    source.adopt_correction(&artifact, &text, next)
                }
                (RegenerationStrategy::AdoptCorrection, None) => {
                    debug!(
                        entity = %artifact.entity.label(),
                        "No usable correction, stopping"
                    );
                    tracker.transition_to(AttemptState::Exhausted)?;
                    return Ok(self.exhausted(best, artifact, tracker, validation_usage));
                }
                (RegenerationStrategy::Regenerate | RegenerationStrategy::Auto, _) => {
                    tracker.transition_to(AttemptState::Generating)?;
                    directives = directives.with_feedback(&report.issues);
                    debug!(entity = %artifact.entity.label(), attempt = next, "Regenerating with feedback");
                    source.generate(next, &directives).await?
                }
            };
            tracker.attempt = next;
        }
    }

    async fn validate(
        &self,
        validator: &dyn Validator,
        artifact: &Artifact,
        source_text: Option<&str>,
    ) -> Result<ValidationReport, EntityError> {
        let call = validator.validate(&artifact.text, &artifact.entity, source_text);
        let report = tokio::time::timeout(self.validator_timeout, call)
            .await
            .map_err(|_| ValidatorError::Timeout(self.validator_timeout))??;
        Ok(report)
    }

    fn exhausted(
        &self,
        best: Option<Artifact>,
        last: Artifact,
        tracker: AttemptTracker,
        validation_usage: UsageEstimate,
    ) -> LoopOutcome {
        let mut artifact = best.unwrap_or(last);
        artifact.is_valid = false;
        info!(
            entity = %artifact.entity.label(),
            attempts = tracker.attempt,
            best_attempt = artifact.attempt,
            best_score = artifact.validation_score.unwrap_or(0),
            "Attempts exhausted below threshold"
        );
        LoopOutcome {
            artifact,
            attempts: tracker.attempt,
            final_state: tracker.state,
            transitions: tracker.transitions,
            validation_usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FEEDBACK_DIRECTIVE;
    use crate::engine::types::Entity;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedSource {
        generated: AtomicU32,
        adopted: AtomicU32,
        feedback: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl AttemptSource for ScriptedSource {
        async fn generate(
            &self,
            attempt: u32,
            directives: &Directives,
        ) -> Result<Artifact, EntityError> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            self.feedback
                .lock()
                .unwrap()
                .push(directives.get(FEEDBACK_DIRECTIVE).map(str::to_string));
            Ok(Artifact::new(
                Entity::new("Acme", "acme.io"),
                attempt,
                format!("attempt {attempt}"),
            ))
        }

        fn adopt_correction(&self, previous: &Artifact, corrected: &str, attempt: u32) -> Artifact {
            self.adopted.fetch_add(1, Ordering::SeqCst);
            Artifact::new(previous.entity.clone(), attempt, corrected)
        }
    }

    struct ScriptedValidator {
        scores: Vec<u8>,
        correction: Option<&'static str>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedValidator {
        fn new(scores: &[u8]) -> Self {
            Self {
                scores: scores.to_vec(),
                correction: None,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Validator for ScriptedValidator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn validate(
            &self,
            _text: &str,
            _entity: &Entity,
            _source_text: Option<&str>,
        ) -> Result<ValidationReport, ValidatorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            tokio::time::sleep(self.delay).await;
            let score = self.scores[call.min(self.scores.len() - 1)];
            Ok(ValidationReport {
                is_valid: false,
                quality_score: score,
                issues: vec![format!("issue {}", call + 1)],
                corrected_text: self.correction.unwrap_or_default().to_string(),
                usage: Default::default(),
            })
        }
    }

    fn looped(strategy: RegenerationStrategy) -> RegenerationLoop {
        RegenerationLoop {
            threshold: 95,
            max_attempts: 3,
            strategy,
            validator_timeout: Duration::from_millis(200),
        }
    }

    async fn run(
        strategy: RegenerationStrategy,
        source: &ScriptedSource,
        validator: &ScriptedValidator,
    ) -> Result<LoopOutcome, EntityError> {
        looped(strategy)
            .run(source, validator, &Directives::default(), None)
            .await
    }

    #[tokio::test]
    async fn accepts_on_third_attempt() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 80, 96]);
        let outcome = run(RegenerationStrategy::Regenerate, &source, &validator)
            .await
            .unwrap();

        assert!(outcome.accepted());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.artifact.attempt, 3);
        assert!(outcome.artifact.is_valid);
        assert_eq!(outcome.artifact.validation_score, Some(96));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.generated.load(Ordering::SeqCst), 3);

        // Feedback accumulates across retries.
        let feedback = source.feedback.lock().unwrap().clone();
        assert_eq!(feedback[0], None);
        assert_eq!(feedback[1].as_deref(), Some("- issue 1"));
        assert_eq!(feedback[2].as_deref(), Some("- issue 1\n- issue 2"));
    }

    #[tokio::test]
    async fn exhausts_and_returns_best() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 70, 85]);
        let outcome = run(RegenerationStrategy::Regenerate, &source, &validator)
            .await
            .unwrap();

        assert_eq!(outcome.final_state, AttemptState::Exhausted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.artifact.attempt, 3);
        assert_eq!(outcome.artifact.validation_score, Some(85));
        assert!(!outcome.artifact.is_valid);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn best_attempt_need_not_be_last() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 90, 70]);
        let outcome = run(RegenerationStrategy::Regenerate, &source, &validator)
            .await
            .unwrap();
        assert_eq!(outcome.artifact.attempt, 2);
        assert_eq!(outcome.artifact.text, "attempt 2");
        assert_eq!(outcome.artifact.issues, vec!["issue 2".to_string()]);
    }

    #[tokio::test]
    async fn ties_keep_the_earliest() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[80, 80, 50]);
        let outcome = run(RegenerationStrategy::Regenerate, &source, &validator)
            .await
            .unwrap();
        assert_eq!(outcome.artifact.attempt, 1);
    }

    #[tokio::test]
    async fn auto_adopts_usable_correction() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator {
            correction: Some("Corrected text"),
            ..ScriptedValidator::new(&[60, 97])
        };
        let outcome = run(RegenerationStrategy::Auto, &source, &validator)
            .await
            .unwrap();

        assert!(outcome.accepted());
        assert_eq!(outcome.artifact.text, "Corrected text");
        assert_eq!(source.generated.load(Ordering::SeqCst), 1);
        assert_eq!(source.adopted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_regenerates_without_correction() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 97]);
        run(RegenerationStrategy::Auto, &source, &validator)
            .await
            .unwrap();
        assert_eq!(source.generated.load(Ordering::SeqCst), 2);
        assert_eq!(source.adopted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn adopt_only_stops_without_correction() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 97]);
        let outcome = run(RegenerationStrategy::AdoptCorrection, &source, &validator)
            .await
            .unwrap();
        assert_eq!(outcome.final_state, AttemptState::Exhausted);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validator_timeout_fails_the_entity() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator {
            delay: Duration::from_secs(5),
            ..ScriptedValidator::new(&[99])
        };
        let result = run(RegenerationStrategy::Auto, &source, &validator).await;
        assert!(matches!(
            result,
            Err(EntityError::Validator(ValidatorError::Timeout(_)))
        ));
    }

    #[test]
    fn transition_table() {
        use AttemptState::*;
        assert!(Generating.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Generating));
        assert!(!Generating.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Generating));
        assert!(!Exhausted.can_transition_to(Retrying));
        assert!(Accepted.is_terminal() && Exhausted.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[tokio::test]
    async fn records_transition_history() {
        let source = ScriptedSource::default();
        let validator = ScriptedValidator::new(&[60, 96]);
        let outcome = run(RegenerationStrategy::Regenerate, &source, &validator)
            .await
            .unwrap();
        let path: Vec<_> = outcome.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                AttemptState::Validating,
                AttemptState::Retrying,
                AttemptState::Generating,
                AttemptState::Validating,
                AttemptState::Accepted,
            ]
        );
    }
}
