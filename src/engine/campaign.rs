//! Campaign aggregator: runs every entity of a request through the
//! pipeline and folds the outcomes into a `CampaignResult`.
//!
//! Per entity:
//! 1. Seed the variable map from the entity's base fields.
//! 2. Reuse cached capability output, or run the scheduler.
//! 3. Substitute the template, score the text.
//! 4. Validate and regenerate until accepted or out of attempts.
//! 5. Store the retained variables in the cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capability::{CapabilityKind, CapabilityRegistry, MAX_FALLBACK_LEVEL};
use crate::config::EngineConfig;
use crate::context::{Directives, UsageEstimate};
use crate::engine::cache::ResultCache;
use crate::engine::rate_limit::RateLimiter;
use crate::engine::regeneration::{AttemptSource, LoopOutcome, RegenerationLoop};
use crate::engine::scheduler::{Scheduler, panic_message};
use crate::engine::scoring::{self, ScoreInputs};
use crate::engine::types::{Artifact, CampaignRequest, CampaignResult, Entity};
use crate::engine::variables::{self, VariableMap};
use crate::error::{CampaignError, EntityError, Error};
use crate::store::KeyValueStore;
use crate::validator::Validator;

/// Entity fields always seeded into the variable map.
const BASE_VARIABLES: [&str; 6] = [
    "company_name",
    "domain",
    "first_name",
    "last_name",
    "full_name",
    "email",
];

/// Campaign-level cancellation signal.
///
/// Once cancelled, no new entity is dispatched; in-flight entities finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct EngineInner {
    config: EngineConfig,
    scheduler: Scheduler,
    validator: Arc<dyn Validator>,
    cache: ResultCache,
    regeneration: RegenerationLoop,
    pool: Arc<Semaphore>,
}

/// Orchestrates capabilities, substitution, scoring and validation over a
/// batch of entities. Cheap to clone.
#[derive(Clone)]
pub struct CampaignEngine {
    inner: Arc<EngineInner>,
}

impl CampaignEngine {
    /// Build an engine. Resolves the capability stage plan once; fails on
    /// an empty registry or a dependency cycle.
    pub fn new(
        config: EngineConfig,
        registry: CapabilityRegistry,
        validator: Arc<dyn Validator>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, Error> {
        let limiter = Arc::new(RateLimiter::new(
            config.provider_max_concurrent,
            config.provider_requests_per_minute,
        ));
        let scheduler = Scheduler::new(Arc::new(registry), limiter, config.capability_timeout)?;

        info!(
            capabilities = scheduler.plan().capability_count(),
            stages = scheduler.plan().len(),
            validator = validator.name(),
            workers = config.max_concurrent_entities,
            "Campaign engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                regeneration: RegenerationLoop::from_config(&config),
                pool: Arc::new(Semaphore::new(config.max_concurrent_entities.max(1))),
                cache: ResultCache::new(store),
                scheduler,
                validator,
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of registered capabilities.
    pub fn capability_count(&self) -> usize {
        self.inner.scheduler.plan().capability_count()
    }

    /// Run a campaign. Only a structurally invalid request is an error;
    /// per-entity failures are recorded in the result.
    pub async fn run(
        &self,
        request: CampaignRequest,
        cancel: &CancelToken,
    ) -> Result<CampaignResult, CampaignError> {
        if request.template.trim().is_empty() {
            return Err(CampaignError::EmptyTemplate);
        }
        if request.entities.is_empty() {
            return Err(CampaignError::NoEntities);
        }

        let batch_id = if request.batch_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.batch_id.clone()
        };
        let total = request.entities.len();
        let mut tally = Tally::new(batch_id.clone(), total, self.capability_count());
        let clock = Instant::now();

        info!(batch_id = %batch_id, entities = total, "Campaign started");
        tally.log(format!("Campaign {batch_id} started with {total} entities"));
        for line in self.unproduced_placeholders(&request) {
            warn!(batch_id = %batch_id, "{line}");
            tally.log(line);
        }

        let template: Arc<str> = Arc::from(request.template.as_str());
        let directives = Arc::new(Directives::from(request.context.clone()));
        let cache_enabled = request.cache_enabled;
        let mut workers: JoinSet<(String, EntityResult)> = JoinSet::new();

        for (index, entity) in request.entities.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tally.skip(total - index);
                break;
            }
            let Ok(permit) = Arc::clone(&self.inner.pool).acquire_owned().await else {
                tally.skip(total - index);
                break;
            };
            // Cancellation may have arrived while waiting for a worker.
            if cancel.is_cancelled() {
                tally.skip(total - index);
                break;
            }

            let engine = self.clone();
            let template = Arc::clone(&template);
            let directives = Arc::clone(&directives);
            workers.spawn(async move {
                let _permit = permit;
                let label = entity.label();
                let run = engine.process_entity(entity, &template, &directives, cache_enabled);
                let result = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(EntityError::Panicked(panic_message(panic.as_ref()))),
                };
                (label, result)
            });

            while let Some(joined) = workers.try_join_next() {
                tally.record_joined(joined);
            }
        }

        while let Some(joined) = workers.join_next().await {
            tally.record_joined(joined);
        }

        let result = tally.finish(clock, cancel.is_cancelled());
        info!(
            batch_id = %result.batch_id,
            total = result.total,
            succeeded = result.success_count,
            exhausted = result.exhausted_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            cache_hit_rate = result.cache_hit_rate,
            "Campaign complete"
        );
        Ok(result)
    }

    /// Warnings for template placeholders nothing will ever fill.
    fn unproduced_placeholders(&self, request: &CampaignRequest) -> Vec<String> {
        let produced = self.inner.scheduler.registry().produced_variables();
        let attributes: BTreeSet<&str> = request
            .entities
            .iter()
            .flat_map(|e| e.attributes.keys().map(String::as_str))
            .collect();

        variables::placeholders(&request.template)
            .into_iter()
            .filter(|name| {
                !produced.contains(name)
                    && !BASE_VARIABLES.contains(&name.as_str())
                    && !attributes.contains(name.as_str())
            })
            .map(|name| {
                format!(
                    "Placeholder '{{{{{name}}}}}' is not produced by any capability or entity field"
                )
            })
            .collect()
    }

    /// Full pipeline for one entity.
    async fn process_entity(
        &self,
        entity: Entity,
        template: &str,
        directives: &Directives,
        cache_enabled: bool,
    ) -> EntityResult {
        let started = Instant::now();
        let inner = &self.inner;

        // Held for the whole pipeline: a duplicate entity waits, then hits
        // the cache instead of re-running capabilities.
        let _guard = if cache_enabled {
            Some(inner.cache.lock(&entity).await)
        } else {
            None
        };

        let pipeline = EntityPipeline {
            inner,
            entity,
            template,
            cache_enabled,
            stats: Mutex::new(PipelineStats::default()),
        };
        let outcome = inner
            .regeneration
            .run(&pipeline, inner.validator.as_ref(), directives, Some(template))
            .await?;

        let stats = pipeline.take_stats();
        if cache_enabled
            && let Some(derived) = stats.derived.get(&outcome.artifact.id)
        {
            inner.cache.put(&pipeline.entity, derived).await;
        }

        Ok(EntityOutcome::new(outcome, stats, started.elapsed().as_millis() as u64))
    }
}

// ── Per-entity pipeline ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct PipelineStats {
    /// Capability calls actually made, across all attempts.
    invocations: usize,
    /// Capability calls avoided by a cache hit.
    reused_invocations: usize,
    /// First attempt served from the cache.
    cache_hit: bool,
    /// Generation usage across all attempts.
    usage: UsageEstimate,
    /// Capability-derived variables behind each attempt.
    derived: HashMap<Uuid, VariableMap>,
}

/// Produces attempts for one entity.
struct EntityPipeline<'a> {
    inner: &'a EngineInner,
    entity: Entity,
    template: &'a str,
    cache_enabled: bool,
    stats: Mutex<PipelineStats>,
}

impl EntityPipeline<'_> {
    fn stats(&self) -> std::sync::MutexGuard<'_, PipelineStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_stats(&self) -> PipelineStats {
        std::mem::take(&mut *self.stats())
    }

    /// Engine score for `text` given the variable metadata behind it.
    fn score(
        &self,
        text: &str,
        fallback_levels: &BTreeMap<CapabilityKind, u8>,
        confidence_scores: &BTreeMap<String, u8>,
        completeness_defect: bool,
    ) -> scoring::QualityBreakdown {
        let fallback_levels = self
            .inner
            .scheduler
            .plan()
            .stages()
            .iter()
            .flatten()
            .map(|kind| {
                fallback_levels
                    .get(kind)
                    .copied()
                    .unwrap_or(MAX_FALLBACK_LEVEL)
            })
            .collect();
        let inputs = ScoreInputs {
            word_count: scoring::word_count(text),
            fallback_levels,
            confidence_scores: confidence_scores.values().copied().collect(),
            completeness_defect,
        };
        scoring::score(&inputs, &self.inner.config.scoring)
    }
}

#[async_trait]
impl AttemptSource for EntityPipeline<'_> {
    async fn generate(
        &self,
        attempt: u32,
        directives: &Directives,
    ) -> Result<Artifact, EntityError> {
        let started = Instant::now();
        let mut variables = VariableMap::seeded(&self.entity);

        // Retries always re-run the capabilities with the new feedback.
        let cached = if attempt == 1 && self.cache_enabled {
            self.inner.cache.get(&self.entity).await
        } else {
            None
        };

        let mut warnings = Vec::new();
        let mut usage = UsageEstimate::default();
        let cache_hit = cached.is_some();
        match cached {
            Some(derived) => {
                variables.absorb(&derived);
                let mut stats = self.stats();
                stats.reused_invocations += self.inner.scheduler.plan().capability_count();
                stats.cache_hit = true;
            }
            None => {
                let report = self
                    .inner
                    .scheduler
                    .run(&self.entity, directives, variables)
                    .await;
                variables = report.variables;
                warnings = report.warnings;
                usage = report.usage;
                let mut stats = self.stats();
                stats.invocations += report.invocations.len();
                stats.usage += report.usage;
            }
        }

        let substitution =
            variables::substitute(self.template, &variables, &self.inner.config.sentinel);
        let breakdown = self.score(
            &substitution.text,
            variables.fallback_levels(),
            variables.confidence_scores(),
            !substitution.is_complete(),
        );

        let mut artifact = Artifact::new(self.entity.clone(), attempt, substitution.text);
        artifact.variables = variables.values().clone();
        artifact.quality_score = breakdown.total;
        artifact.breakdown = breakdown;
        artifact.fallback_levels = variables.fallback_levels().clone();
        artifact.confidence_scores = variables.confidence_scores().clone();
        artifact.completeness_defects = substitution.defects;
        artifact.cache_hit = cache_hit;
        artifact.usage = usage;
        artifact.warnings = warnings;
        artifact.generation_time_ms = started.elapsed().as_millis() as u64;

        self.stats().derived.insert(artifact.id, variables.derived());
        Ok(artifact)
    }

    fn adopt_correction(&self, previous: &Artifact, corrected: &str, attempt: u32) -> Artifact {
        let started = Instant::now();
        let sentinel = &self.inner.config.sentinel;

        // Corrections are free text: neutralize any placeholder syntax.
        let substitution = variables::substitute(corrected, &VariableMap::new(), sentinel);
        let mut defects = substitution.defects;
        if substitution.text.contains(sentinel.as_str()) {
            defects.extend(previous.completeness_defects.iter().cloned());
        }
        let breakdown = self.score(
            &substitution.text,
            &previous.fallback_levels,
            &previous.confidence_scores,
            !defects.is_empty(),
        );

        let mut artifact = Artifact::new(previous.entity.clone(), attempt, substitution.text);
        artifact.variables = previous.variables.clone();
        artifact.quality_score = breakdown.total;
        artifact.breakdown = breakdown;
        artifact.fallback_levels = previous.fallback_levels.clone();
        artifact.confidence_scores = previous.confidence_scores.clone();
        artifact.completeness_defects = defects;
        artifact.cache_hit = previous.cache_hit;
        artifact.generation_time_ms = started.elapsed().as_millis() as u64;

        let mut stats = self.stats();
        if let Some(derived) = stats.derived.get(&previous.id).cloned() {
            stats.derived.insert(artifact.id, derived);
        }
        artifact
    }
}

// ── Aggregation ─────────────────────────────────────────────────────

type EntityResult = Result<EntityOutcome, EntityError>;

/// What one entity contributed to the campaign.
struct EntityOutcome {
    artifact: Artifact,
    accepted: bool,
    attempts: u32,
    cache_hit: bool,
    reused_invocations: usize,
    invocations: usize,
    usage: UsageEstimate,
    elapsed_ms: u64,
}

impl EntityOutcome {
    fn new(outcome: LoopOutcome, stats: PipelineStats, elapsed_ms: u64) -> Self {
        let mut usage = stats.usage;
        usage += outcome.validation_usage;
        Self {
            accepted: outcome.accepted(),
            attempts: outcome.attempts,
            artifact: outcome.artifact,
            cache_hit: stats.cache_hit,
            reused_invocations: stats.reused_invocations,
            invocations: stats.invocations,
            usage,
            elapsed_ms,
        }
    }
}

/// Serialized accumulator, owned by the aggregator task.
struct Tally {
    batch_id: String,
    total: usize,
    capability_count: usize,
    artifacts: Vec<Artifact>,
    success_count: usize,
    exhausted_count: usize,
    failed_count: usize,
    skipped_count: usize,
    quality_sum: u64,
    elapsed_sum_ms: u64,
    reused_invocations: usize,
    cache_reuse_count: usize,
    fallback_distribution: BTreeMap<u8, usize>,
    usage: UsageEstimate,
    logs: Vec<String>,
    errors: Vec<String>,
    started_at: chrono::DateTime<Utc>,
}

impl Tally {
    fn new(batch_id: String, total: usize, capability_count: usize) -> Self {
        Self {
            batch_id,
            total,
            capability_count,
            artifacts: Vec::with_capacity(total),
            success_count: 0,
            exhausted_count: 0,
            failed_count: 0,
            skipped_count: 0,
            quality_sum: 0,
            elapsed_sum_ms: 0,
            reused_invocations: 0,
            cache_reuse_count: 0,
            fallback_distribution: BTreeMap::new(),
            usage: UsageEstimate::default(),
            logs: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn log(&mut self, line: String) {
        self.logs.push(line);
    }

    fn skip(&mut self, count: usize) {
        self.skipped_count += count;
        info!(batch_id = %self.batch_id, skipped = count, "Campaign cancelled, skipping remaining entities");
        self.log(format!("Cancelled: {count} entities not dispatched"));
    }

    fn record_joined(&mut self, joined: Result<(String, EntityResult), JoinError>) {
        match joined {
            Ok((_, Ok(outcome))) => self.record(outcome),
            Ok((label, Err(e))) => self.record_failure(&label, &e.to_string()),
            Err(e) => self.record_failure("unknown entity", &format!("worker task failed: {e}")),
        }
    }

    fn record(&mut self, outcome: EntityOutcome) {
        let artifact = &outcome.artifact;
        let label = artifact.entity.label();
        let score = artifact.validation_score.unwrap_or(0);

        if outcome.accepted {
            self.success_count += 1;
            self.quality_sum += u64::from(artifact.quality_score);
            self.log(format!(
                "{label}: accepted at attempt {} (validator {score}, engine {}, {} capability calls)",
                outcome.attempts, artifact.quality_score, outcome.invocations
            ));
        } else {
            self.exhausted_count += 1;
            self.log(format!(
                "{label}: below threshold after {} attempts, kept attempt {} (validator {score})",
                outcome.attempts, artifact.attempt
            ));
        }

        if outcome.cache_hit {
            self.cache_reuse_count += 1;
        }
        self.reused_invocations += outcome.reused_invocations;
        for level in artifact.fallback_levels.values() {
            *self.fallback_distribution.entry(*level).or_default() += 1;
        }
        self.usage += outcome.usage;
        self.elapsed_sum_ms += outcome.elapsed_ms;
        self.artifacts.push(outcome.artifact);
    }

    fn record_failure(&mut self, label: &str, reason: &str) {
        error!(batch_id = %self.batch_id, entity = %label, error = %reason, "Entity failed");
        self.failed_count += 1;
        self.errors.push(format!("{label}: {reason}"));
    }

    fn finish(self, clock: Instant, cancelled: bool) -> CampaignResult {
        let completed = self.success_count + self.exhausted_count;
        let total = self.total.max(1) as f64;
        let invocation_budget = (self.total * self.capability_count).max(1) as f64;

        let mut logs = self.logs;
        logs.push(format!(
            "Campaign {} finished: {} accepted, {} below threshold, {} failed, {} skipped",
            self.batch_id,
            self.success_count,
            self.exhausted_count,
            self.failed_count,
            self.skipped_count
        ));

        CampaignResult {
            batch_id: self.batch_id,
            artifacts: self.artifacts,
            total: self.total,
            success_count: self.success_count,
            exhausted_count: self.exhausted_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            success_rate: self.success_count as f64 / total,
            average_quality_score: if self.success_count == 0 {
                0.0
            } else {
                self.quality_sum as f64 / self.success_count as f64
            },
            total_time_ms: clock.elapsed().as_millis() as u64,
            average_time_ms: if completed == 0 {
                0.0
            } else {
                self.elapsed_sum_ms as f64 / completed as f64
            },
            cache_hit_rate: self.reused_invocations as f64 / invocation_budget,
            cache_reuse_count: self.cache_reuse_count,
            fallback_distribution: self.fallback_distribution,
            total_tokens: self.usage.total_tokens(),
            total_cost: self.usage.cost,
            cancelled,
            logs,
            errors: self.errors,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
