//! Capability abstraction for extraction units.

#[allow(clippy::module_inception)]
pub mod capability;
pub mod prompt;
pub mod registry;

pub use capability::*;
pub use prompt::PromptCapability;
pub use registry::{CapabilityRegistry, StagePlan};
