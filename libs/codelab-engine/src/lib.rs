//! Sandboxed execution and verification of untrusted submissions

pub mod cancel;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod limits;
pub mod repository;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod submission;

#[cfg(test)]
mod interpreter_tests;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

pub use config::{EngineConfig, LanguageConfig, LanguageConfigManager};
pub use error::EngineError;
pub use executor::ExecutionContext;
pub use repository::{ChallengeRepository, InMemoryChallengeRepository};
pub use runner::RunnerRegistry;
pub use sandbox::{build_boundary, IsolationKind, NetworkPolicy};
pub use scheduler::{Scheduler, SchedulerStats, SubmissionState, VerdictHandle};
pub use submission::{StatusSnapshot, SubmissionService};

/// Wire up boundary, runners, scheduler and service from configuration
pub fn build_service(
    config: &EngineConfig,
    languages: &LanguageConfigManager,
    challenges: Arc<dyn ChallengeRepository>,
) -> anyhow::Result<SubmissionService> {
    let boundary = build_boundary(config, languages)?;
    let runners = RunnerRegistry::from_config(languages);
    let ctx = ExecutionContext::new(boundary, runners, config);
    let scheduler = Scheduler::new(
        ctx,
        config.max_concurrent_executions,
        Duration::from_secs(config.retain_finished_secs),
    );
    Ok(SubmissionService::new(scheduler, challenges, config.max_source_bytes))
}
