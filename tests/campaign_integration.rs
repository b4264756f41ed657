//! End-to-end campaign runs against stub capabilities and validators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use outreach_engine::capability::{
    Capability, CapabilityInput, CapabilityKind, CapabilityOutput, CapabilityRegistry,
};
use outreach_engine::config::EngineConfig;
use outreach_engine::engine::{CampaignEngine, CampaignRequest, CancelToken, Entity};
use outreach_engine::error::{CapabilityError, ValidatorError};
use outreach_engine::store::{InMemoryStore, KeyValueStore, LibSqlStore};
use outreach_engine::validator::{RuleValidator, ValidationReport, Validator};

/// Answers with a fixed value and counts every call.
struct CountingCapability {
    kind: CapabilityKind,
    calls: Arc<AtomicUsize>,
    value: &'static str,
    fail_for: Option<&'static str>,
}

#[async_trait]
impl Capability for CountingCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn run(&self, input: CapabilityInput) -> Result<CapabilityOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for == Some(input.entity.name.as_str()) {
            return Err(CapabilityError::Failed {
                capability: self.kind,
                reason: "upstream unavailable".into(),
            });
        }
        let field = self.kind.default_outputs()[0];
        Ok(CapabilityOutput::new(5, 1, "stub").with_field(field, self.value))
    }
}

/// Accepts everything except texts mentioning `reject`, which error out.
struct StubValidator {
    reject: Option<&'static str>,
    calls: AtomicUsize,
}

impl StubValidator {
    fn accepting() -> Self {
        Self {
            reject: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Validator for StubValidator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn validate(
        &self,
        text: &str,
        _entity: &Entity,
        _source_text: Option<&str>,
    ) -> Result<ValidationReport, ValidatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.is_some_and(|name| text.contains(name)) {
            return Err(ValidatorError::InvalidResponse("validator down".into()));
        }
        Ok(ValidationReport {
            is_valid: true,
            quality_score: 100,
            ..ValidationReport::default()
        })
    }
}

fn registry(calls: &Arc<AtomicUsize>, value: &'static str) -> CapabilityRegistry {
    registry_failing(calls, value, None)
}

fn registry_failing(
    calls: &Arc<AtomicUsize>,
    value: &'static str,
    fail_for: Option<&'static str>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for kind in CapabilityKind::ALL {
        registry
            .register(Arc::new(CountingCapability {
                kind,
                calls: Arc::clone(calls),
                value,
                fail_for,
            }))
            .unwrap();
    }
    registry
}

fn engine(
    registry: CapabilityRegistry,
    validator: Arc<dyn Validator>,
    store: Arc<dyn KeyValueStore>,
) -> CampaignEngine {
    CampaignEngine::new(EngineConfig::default(), registry, validator, store).unwrap()
}

const TEMPLATE: &str = "Bonjour {{first_name}}, I saw that {{company_name}} is growing and \
    that {{signal}} keeps the {{persona}} busy. Teams fighting {{pain_point}} often move \
    away from {{tech_stack}} and {{competitor}}; {{case_study}} cut that work in half within \
    a quarter. Would a short call next week make sense to compare notes on how your team \
    handles this today and where it hurts the most?";

#[tokio::test]
async fn cache_serves_second_run_without_invocations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "value"),
        Arc::new(StubValidator::accepting()),
        Arc::new(InMemoryStore::new()),
    );
    let acme = Entity::new("Acme", "https://acme.io").with_first_name("Ada");

    let first = engine
        .run(CampaignRequest::new(TEMPLATE, vec![acme.clone()]), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(first.cache_hit_rate, 0.0);
    assert_eq!(first.cache_reuse_count, 0);

    let second = engine
        .run(CampaignRequest::new(TEMPLATE, vec![acme]), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(second.cache_reuse_count, 1);
    assert!(second.cache_hit_rate > 0.0);
    assert!(second.artifacts[0].cache_hit);
    assert_eq!(first.artifacts[0].variables, second.artifacts[0].variables);
    assert_eq!(first.artifacts[0].text, second.artifacts[0].text);
}

#[tokio::test]
async fn disabled_cache_always_invokes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "value"),
        Arc::new(StubValidator::accepting()),
        Arc::new(InMemoryStore::new()),
    );
    let entities = vec![
        Entity::new("Acme", "acme.io").with_first_name("Ada"),
        Entity::new("Acme", "acme.io").with_first_name("Grace"),
    ];
    let request = CampaignRequest::new(TEMPLATE, entities).with_cache(false);
    let result = engine.run(request, &CancelToken::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 12);
    assert_eq!(result.cache_reuse_count, 0);
}

#[tokio::test]
async fn contacts_at_one_company_share_research_not_names() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "value"),
        Arc::new(StubValidator::accepting()),
        Arc::new(InMemoryStore::new()),
    );
    let entities = vec![
        Entity::new("Acme", "acme.io").with_first_name("Ada"),
        Entity::new("Acme", "acme.io").with_first_name("Grace"),
    ];
    let result = engine
        .run(CampaignRequest::new(TEMPLATE, entities), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(result.cache_reuse_count, 1);
    for greeting in ["Bonjour Ada,", "Bonjour Grace,"] {
        assert_eq!(
            result
                .artifacts
                .iter()
                .filter(|a| a.text.starts_with(greeting))
                .count(),
            1
        );
    }
}

#[tokio::test]
async fn missing_first_name_costs_exactly_completeness() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "value"),
        Arc::new(StubValidator::accepting()),
        Arc::new(InMemoryStore::new()),
    );
    let entities = vec![
        Entity::new("Acme", "acme.io").with_first_name("Ada"),
        Entity::new("Globex", "globex.com"),
    ];
    let request = CampaignRequest::new(TEMPLATE, entities).with_cache(false);
    let result = engine.run(request, &CancelToken::new()).await.unwrap();

    let find = |name: &str| {
        result
            .artifacts
            .iter()
            .find(|a| a.entity.name == name)
            .unwrap()
    };
    let complete = find("Acme");
    let missing = find("Globex");

    assert!(missing.text.starts_with("Bonjour UNAVAILABLE, I saw that Globex"));
    assert_eq!(missing.completeness_defects, vec!["first_name".to_string()]);
    assert!(complete.completeness_defects.is_empty());
    assert_eq!(complete.quality_score - missing.quality_score, 10);
    assert_eq!(missing.breakdown.completeness, 0.0);
}

#[tokio::test]
async fn output_never_contains_placeholder_syntax() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "{{first_name}} and {{secret}}"),
        Arc::new(StubValidator::accepting()),
        Arc::new(InMemoryStore::new()),
    );
    let template = "Hi {{ first_name }}, {{persona}} {{unknown}} {{}} {{ 9bad }} {{company_name}}";
    let request = CampaignRequest::new(
        template,
        vec![Entity::new("Acme", "acme.io").with_first_name("Ada")],
    );
    let result = engine.run(request, &CancelToken::new()).await.unwrap();

    let text = &result.artifacts[0].text;
    assert!(!text.contains("{{"), "raw placeholder in {text}");
    assert!(!text.contains("}}"), "raw placeholder in {text}");
    assert!(text.starts_with("Hi Ada, "));
    assert!(text.ends_with(" Acme"));
}

#[tokio::test]
async fn counts_add_up_with_failing_entities() {
    let calls = Arc::new(AtomicUsize::new(0));
    let validator = Arc::new(StubValidator {
        reject: Some("Initech"),
        calls: AtomicUsize::new(0),
    });
    let engine = engine(
        registry_failing(&calls, "value", Some("Globex")),
        validator.clone(),
        Arc::new(InMemoryStore::new()),
    );
    let entities = ["Acme", "Globex", "Initech", "Umbrella"]
        .iter()
        .map(|name| {
            Entity::new(*name, format!("{}.com", name.to_lowercase())).with_first_name("Ada")
        })
        .collect();
    let result = engine
        .run(CampaignRequest::new(TEMPLATE, entities), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(result.total, 4);
    assert_eq!(
        result.success_count + result.failed_count + result.exhausted_count + result.skipped_count,
        result.total
    );
    // Capability failures degrade to fallbacks; a validator failure fails the entity.
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.success_count, 3);
    assert!(result.errors[0].starts_with("Initech"));

    let globex = result
        .artifacts
        .iter()
        .find(|a| a.entity.name == "Globex")
        .unwrap();
    assert!(globex.fallback_levels.values().all(|level| *level == 4));
    assert!(!globex.warnings.is_empty());
    let acme = result
        .artifacts
        .iter()
        .find(|a| a.entity.name == "Acme")
        .unwrap();
    assert!(globex.quality_score < acme.quality_score);
    assert_eq!(result.fallback_distribution.get(&4), Some(&6));
    assert_eq!(result.fallback_distribution.get(&1), Some(&12));
}

#[tokio::test]
async fn rule_validator_accepts_clean_campaign() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry(&calls, "value"),
        Arc::new(RuleValidator::default()),
        Arc::new(InMemoryStore::new()),
    );
    let request = CampaignRequest::new(
        TEMPLATE,
        vec![Entity::new("Acme", "acme.io").with_first_name("Ada")],
    );
    let result = engine.run(request, &CancelToken::new()).await.unwrap();
    assert_eq!(result.success_count, 1);
    assert_eq!(result.artifacts[0].validation_score, Some(100));
}

#[tokio::test]
async fn libsql_cache_outlives_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outreach.db");
    let calls = Arc::new(AtomicUsize::new(0));
    let acme = Entity::new("Acme", "acme.io").with_first_name("Ada");

    {
        let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
        let engine = engine(registry(&calls, "value"), Arc::new(StubValidator::accepting()), store);
        engine
            .run(CampaignRequest::new(TEMPLATE, vec![acme.clone()]), &CancelToken::new())
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
    let engine = engine(registry(&calls, "value"), Arc::new(StubValidator::accepting()), store);
    let result = engine
        .run(CampaignRequest::new(TEMPLATE, vec![acme]), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(result.cache_reuse_count, 1);
    assert_eq!(result.cache_hit_rate, 1.0);
}
