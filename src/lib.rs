//! Outreach engine: personalized campaign generation over pluggable
//! capabilities, with scoring, validation and result caching.

pub mod capability;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod llm;
pub mod store;
pub mod validator;
