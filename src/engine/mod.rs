//! Campaign orchestration engine.
//!
//! - `scheduler`: runs capabilities in dependency stages
//! - `variables`: variable map and template substitution
//! - `scoring`: deterministic quality score
//! - `cache`: per-entity result cache
//! - `regeneration`: validate / retry state machine
//! - `campaign`: batch aggregator

pub mod cache;
pub mod campaign;
pub mod rate_limit;
pub mod regeneration;
pub mod scheduler;
pub mod scoring;
pub mod types;
pub mod variables;

pub use cache::{EntityLock, ResultCache};
pub use campaign::{CampaignEngine, CancelToken};
pub use rate_limit::RateLimiter;
pub use regeneration::{AttemptSource, AttemptState, LoopOutcome, RegenerationLoop};
pub use scheduler::{Invocation, Scheduler, StageReport};
pub use scoring::{QualityBreakdown, ScoreInputs, score};
pub use types::{Artifact, CampaignRequest, CampaignResult, Entity};
pub use variables::{Substitution, VariableMap, placeholders, substitute};
