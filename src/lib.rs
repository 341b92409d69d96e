//! botload -- load-testing harness for meeting-bot REST APIs.
//!
//! This crate creates bots, polls their status history until they join a
//! call, optionally makes them leave, waits for the recording artifact, and
//! writes per-bot timings to an append-only metric log.

pub mod api;
pub mod config;
pub mod driver;
pub mod log;
pub mod poller;
pub mod report;
pub mod runner;
pub mod timeline;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{BotApi, RecallClient};
use crate::config::LoadTestConfig;
use crate::driver::BotLifecycleDriver;
use crate::log::LogAccumulator;
use crate::runner::{LoadProfile, LoadProfileRunner, ProfileReport};

/// Build the runner for `config` against the real API, logging to `config.log.path`.
pub fn build_runner(config: &LoadTestConfig) -> Result<LoadProfileRunner> {
    let client = RecallClient::new(
        config.api.base_url.clone(),
        config.api.auth_token.clone(),
        config.api.request_timeout(),
    )
    .context("failed to build HTTP client")?;
    let log = Arc::new(LogAccumulator::to_file(config.log.path.clone()));
    Ok(build_runner_with(config, Arc::new(client), log))
}

/// Build the runner for `config` against any `BotApi`.
pub fn build_runner_with(
    config: &LoadTestConfig,
    api: Arc<dyn BotApi>,
    log: Arc<LogAccumulator>,
) -> LoadProfileRunner {
    let driver = BotLifecycleDriver::new(
        api,
        config.driver_config(),
        config.request_body.clone(),
        log,
    );
    LoadProfileRunner::new(Arc::new(driver), config.run.mode)
        .with_max_concurrency(config.run.max_concurrency)
}

/// Run `profiles` one after another. Every profile runs even if an earlier one failed.
pub async fn run_profiles(runner: &LoadProfileRunner, profiles: &[LoadProfile]) -> Vec<ProfileReport> {
    let mut reports = Vec::with_capacity(profiles.len());
    for profile in profiles {
        tracing::info!(profile = %profile.name, "Load Profile: {}", profile.name);
        reports.push(runner.run_profile(profile).await);
    }
    reports
}
