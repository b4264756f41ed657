//! Dependency scheduler: runs an entity's capabilities stage by stage.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::capability::{
    Capability, CapabilityInput, CapabilityKind, CapabilityOutput, CapabilityRegistry,
    MAX_CONFIDENCE, MAX_FALLBACK_LEVEL, MIN_CONFIDENCE, StagePlan,
};
use crate::context::{Directives, UsageEstimate};
use crate::engine::rate_limit::RateLimiter;
use crate::engine::types::Entity;
use crate::engine::variables::VariableMap;
use crate::error::{CapabilityError, RegistryError};

/// Outcome of one capability call, after normalization.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: CapabilityKind,
    pub fallback_level: u8,
    pub confidence_score: u8,
    /// The call errored or timed out and a generic output was synthesized.
    pub failed: bool,
    pub elapsed: Duration,
}

/// Everything one scheduler run produced for an entity.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub variables: VariableMap,
    pub invocations: Vec<Invocation>,
    pub usage: UsageEstimate,
    pub warnings: Vec<String>,
}

/// Runs registered capabilities in dependency stages.
pub struct Scheduler {
    registry: Arc<CapabilityRegistry>,
    plan: StagePlan,
    limiter: Arc<RateLimiter>,
    default_timeout: Duration,
}

impl Scheduler {
    /// Resolve the stage plan once. Fails on an empty registry or a cycle.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        limiter: Arc<RateLimiter>,
        default_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let plan = registry.plan()?;
        debug!(
            stages = plan.len(),
            capabilities = plan.capability_count(),
            "Resolved capability plan"
        );
        Ok(Self {
            registry,
            plan,
            limiter,
            default_timeout,
        })
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Run every stage for `entity`, starting from `base` (the seeded
    /// entity fields). A stage finishes, failures included, before the
    /// next one starts.
    pub async fn run(
        &self,
        entity: &Entity,
        directives: &Directives,
        base: VariableMap,
    ) -> StageReport {
        let mut report = StageReport {
            variables: base,
            ..StageReport::default()
        };

        for (index, stage) in self.plan.stages().iter().enumerate() {
            let capabilities: Vec<Arc<dyn Capability>> = stage
                .iter()
                .filter_map(|kind| self.registry.get(*kind))
                .collect();

            let calls = capabilities.iter().map(|capability| {
                let input = build_input(capability.as_ref(), entity, &report.variables, directives);
                self.invoke(Arc::clone(capability), input)
            });
            let results = join_all(calls).await;

            // Stage members are in registration order, so merging in result
            // order keeps first-write-wins deterministic.
            for (capability, (result, elapsed)) in capabilities.iter().zip(results) {
                let kind = capability.kind();
                let failed = result.is_err();
                let output = match result {
                    Ok(output) => normalize(capability.as_ref(), entity, output, &mut report.warnings),
                    Err(e) => {
                        warn!(
                            capability = %kind,
                            entity = %entity.label(),
                            error = %e,
                            "Capability failed, using generic fallback"
                        );
                        report
                            .warnings
                            .push(format!("{kind}: {e}; generic fallback used"));
                        synthesize_fallback(capability.as_ref(), entity, &e)
                    }
                };

                let rejected = report.variables.merge_output(
                    kind,
                    &output.fields,
                    output.confidence_score,
                    output.fallback_level,
                );
                for name in rejected {
                    report
                        .warnings
                        .push(format!("{kind}: variable '{name}' already set, kept the first value"));
                }

                report.usage += output.usage;
                report.invocations.push(Invocation {
                    kind,
                    fallback_level: output.fallback_level,
                    confidence_score: output.confidence_score,
                    failed,
                    elapsed,
                });
            }

            debug!(
                entity = %entity.label(),
                stage = index + 1,
                capabilities = stage.len(),
                "Stage complete"
            );
        }

        report
    }

    /// One rate-limited, time-boxed capability call. Panics inside the
    /// capability are reported as failures.
    async fn invoke(
        &self,
        capability: Arc<dyn Capability>,
        input: CapabilityInput,
    ) -> (Result<CapabilityOutput, CapabilityError>, Duration) {
        let kind = capability.kind();
        let timeout = capability
            .execution_timeout()
            .unwrap_or(self.default_timeout);

        let _permit = self.limiter.acquire(capability.provider()).await;
        let started = Instant::now();

        let call = AssertUnwindSafe(capability.run(input)).catch_unwind();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(CapabilityError::Failed {
                capability: kind,
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
            Err(_) => Err(CapabilityError::Timeout {
                capability: kind,
                timeout,
            }),
        };
        (result, started.elapsed())
    }
}

/// Collect a capability's required upstream variables. Absent upstream
/// values are passed as explicit empty strings.
fn build_input(
    capability: &dyn Capability,
    entity: &Entity,
    variables: &VariableMap,
    directives: &Directives,
) -> CapabilityInput {
    let variables = capability
        .required_inputs()
        .iter()
        .map(|name| {
            (
                name.to_string(),
                variables.get(name).unwrap_or_default().to_string(),
            )
        })
        .collect();
    CapabilityInput {
        entity: entity.clone(),
        variables,
        directives: directives.clone(),
    }
}

/// Enforce the output contract: every declared field non-empty, metadata
/// in range, nothing undeclared.
fn normalize(
    capability: &dyn Capability,
    entity: &Entity,
    output: CapabilityOutput,
    warnings: &mut Vec<String>,
) -> CapabilityOutput {
    let kind = capability.kind();
    let CapabilityOutput {
        mut fields,
        confidence_score,
        fallback_level,
        reasoning,
        usage,
    } = output;

    for name in fields.keys() {
        if !capability.outputs().contains(&name.as_str()) {
            warnings.push(format!("{kind}: dropped undeclared field '{name}'"));
        }
    }
    fields.retain(|name, _| capability.outputs().contains(&name.as_str()));

    let mut fallback_level = fallback_level.min(MAX_FALLBACK_LEVEL);
    for field in capability.outputs() {
        let blank = fields.get(*field).is_none_or(|v| v.trim().is_empty());
        if blank {
            fields.insert(
                field.to_string(),
                capability.generic_fallback(entity, field),
            );
            fallback_level = MAX_FALLBACK_LEVEL;
            warnings.push(format!("{kind}: empty '{field}', generic value used"));
        }
    }

    CapabilityOutput {
        fields,
        confidence_score: confidence_score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE),
        fallback_level,
        reasoning,
        usage,
    }
}

fn synthesize_fallback(
    capability: &dyn Capability,
    entity: &Entity,
    error: &CapabilityError,
) -> CapabilityOutput {
    let fields: BTreeMap<String, String> = capability
        .outputs()
        .iter()
        .map(|field| (field.to_string(), capability.generic_fallback(entity, field)))
        .collect();
    CapabilityOutput {
        fields,
        confidence_score: MIN_CONFIDENCE,
        fallback_level: MAX_FALLBACK_LEVEL,
        reasoning: format!("generic fallback after error: {error}"),
        usage: UsageEstimate::default(),
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
