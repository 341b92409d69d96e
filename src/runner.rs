//! Load profiles: N bot lifecycles run serially or fanned out concurrently,
//! with one metric-log flush per profile.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::driver::{BotLifecycleDriver, BotStage, BotSummary, LifecycleError};
use crate::log::LogAccumulator;
use crate::report::{self, ProfileStats};

/// A named batch of simulated bots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProfile {
    pub name: String,
    pub num_bots: usize,
    /// Overall deadline for the profile. `None` waits for every run.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Each bot finishes before the next starts; the first failure stops the profile.
    Serial,
    /// All bots start together; failures are collected, never short-circuited.
    #[default]
    Concurrent,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Serial => write!(f, "serial"),
            RunMode::Concurrent => write!(f, "concurrent"),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(RunMode::Serial),
            "concurrent" => Ok(RunMode::Concurrent),
            other => Err(format!("unknown run mode `{other}` (expected serial or concurrent)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProfileRunError {
    #[error("load profile {profile}: {failed} of {total} bot runs failed; first: {first}")]
    BotsFailed {
        profile: String,
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("load profile {profile} timed out after {timeout_ms}ms with {completed} of {total} bot runs finished")]
    TimedOut {
        profile: String,
        timeout_ms: u128,
        completed: usize,
        total: usize,
    },

    #[error("load profile {profile}: metric log flush failed: {message}")]
    Log { profile: String, message: String },
}

/// Failure record kept in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotFailure {
    pub slot: usize,
    pub bot: String,
    pub stage: BotStage,
    pub message: String,
}

impl BotFailure {
    fn new(slot: usize, e: &LifecycleError) -> Self {
        Self {
            slot,
            bot: e.bot().to_string(),
            stage: e.stage(),
            message: e.to_string(),
        }
    }
}

/// Everything one profile run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub run_id: Uuid,
    pub profile: String,
    pub mode: RunMode,
    pub num_bots: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u128>,
    pub succeeded: Vec<BotSummary>,
    pub failed: Vec<BotFailure>,
    pub timed_out: bool,
    pub lines_flushed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_error: Option<String>,
    pub stats: ProfileStats,
}

impl ProfileReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.timed_out && self.flush_error.is_none()
    }

    /// Bot runs that finished, either way.
    pub fn completed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Profile-level failure signal, if any.
    pub fn error(&self) -> Option<ProfileRunError> {
        if self.timed_out {
            return Some(ProfileRunError::TimedOut {
                profile: self.profile.clone(),
                timeout_ms: self.timeout_ms.unwrap_or(self.elapsed_ms),
                completed: self.completed(),
                total: self.num_bots,
            });
        }
        if let Some(first) = self.failed.first() {
            return Some(ProfileRunError::BotsFailed {
                profile: self.profile.clone(),
                failed: self.failed.len(),
                total: self.num_bots,
                first: first.message.clone(),
            });
        }
        self.flush_error.as_ref().map(|message| ProfileRunError::Log {
            profile: self.profile.clone(),
            message: message.clone(),
        })
    }

    pub fn into_result(self) -> Result<Self, ProfileRunError> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

type Outcomes = Mutex<Vec<(usize, Result<BotSummary, LifecycleError>)>>;

/// Runs load profiles against one shared driver and metric log.
#[derive(Debug)]
pub struct LoadProfileRunner {
    driver: Arc<BotLifecycleDriver>,
    mode: RunMode,
    max_concurrency: Option<usize>,
}

impl LoadProfileRunner {
    pub fn new(driver: Arc<BotLifecycleDriver>, mode: RunMode) -> Self {
        Self {
            driver,
            mode,
            max_concurrency: None,
        }
    }

    /// Cap simultaneously running bots in concurrent mode. `None` is unbounded.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit.filter(|&n| n > 0);
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    fn log(&self) -> &Arc<LogAccumulator> {
        self.driver.log()
    }

    /// Run every bot of `profile` and flush the metric log once.
    ///
    /// The returned report always describes what happened; use
    /// `ProfileReport::into_result` for a pass/fail signal.
    pub async fn run_profile(&self, profile: &LoadProfile) -> ProfileReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let guard = self.log().scope();

        info!(
            %run_id,
            profile = %profile.name,
            num_bots = profile.num_bots,
            mode = %self.mode,
            max_concurrency = ?self.max_concurrency,
            "starting load profile"
        );

        let outcomes: Outcomes = Mutex::new(Vec::with_capacity(profile.num_bots));
        let work = self.execute(profile, &outcomes);
        let timed_out = match profile.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.is_err(),
            None => {
                work.await;
                false
            }
        };

        let mut collected = outcomes.into_inner().unwrap_or_else(|p| p.into_inner());
        collected.sort_by_key(|(slot, _)| *slot);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (slot, outcome) in collected {
            match outcome {
                Ok(summary) => succeeded.push(summary),
                Err(e) => failed.push(BotFailure::new(slot, &e)),
            }
        }

        let stats = ProfileStats::from_summaries(&succeeded);
        let log = self.log();
        log.append(report::format_stats_line(&profile.name, &stats));

        let elapsed = start.elapsed();
        if timed_out {
            warn!(
                profile = %profile.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "load profile timed out"
            );
            log.append(format!(
                "Error in {} load profile test: timed out after {}ms ({} of {} bot runs finished)",
                profile.name,
                elapsed.as_millis(),
                succeeded.len() + failed.len(),
                profile.num_bots
            ));
        } else if self.mode == RunMode::Serial {
            if let Some(first) = failed.first() {
                log.append(format!(
                    "Error in {} load profile test: {}",
                    profile.name, first.message
                ));
            }
        }
        log.append(format!(
            "Load profile {} finished: {} of {} bot runs succeeded in {}ms",
            profile.name,
            succeeded.len(),
            profile.num_bots,
            elapsed.as_millis()
        ));

        let (lines_flushed, flush_error) = match guard.finish() {
            Ok(n) => (n, None),
            Err(e) => {
                error!(profile = %profile.name, error = %e, "metric log flush failed");
                (0, Some(format!("{e:#}")))
            }
        };

        info!(
            %run_id,
            profile = %profile.name,
            succeeded = succeeded.len(),
            failed = failed.len(),
            timed_out,
            elapsed_ms = elapsed.as_millis() as u64,
            "load profile finished"
        );

        ProfileReport {
            run_id,
            profile: profile.name.clone(),
            mode: self.mode,
            num_bots: profile.num_bots,
            started_at,
            elapsed_ms: elapsed.as_millis(),
            timeout_ms: profile.timeout.map(|t| t.as_millis()),
            succeeded,
            failed,
            timed_out,
            lines_flushed,
            flush_error,
            stats,
        }
    }

    async fn execute(&self, profile: &LoadProfile, outcomes: &Outcomes) {
        match self.mode {
            RunMode::Serial => self.execute_serial(profile, outcomes).await,
            RunMode::Concurrent => self.execute_concurrent(profile, outcomes).await,
        }
    }

    async fn execute_serial(&self, profile: &LoadProfile, outcomes: &Outcomes) {
        let num_bots = profile.num_bots;
        for slot in 0..num_bots {
            let result = self
                .driver
                .run(slot)
                .instrument(bot_span(&profile.name, slot))
                .await;
            let failed = result.is_err();
            push(outcomes, slot, result);
            if failed {
                warn!(slot, remaining = num_bots - slot - 1, "serial profile halted after failure");
                break;
            }
        }
    }

    async fn execute_concurrent(&self, profile: &LoadProfile, outcomes: &Outcomes) {
        let limiter = self.max_concurrency.map(Semaphore::new);
        let limiter = limiter.as_ref();
        let name = profile.name.as_str();

        let runs = (0..profile.num_bots).map(move |slot| {
            async move {
                // The semaphore is never closed, so acquire only fails if it is.
                let _permit = match limiter {
                    Some(s) => s.acquire().await.ok(),
                    None => None,
                };
                let result = self.driver.run(slot).await;
                push(outcomes, slot, result);
            }
            .instrument(bot_span(name, slot))
        });

        join_all(runs).await;
    }
}

/// Context for everything one bot run logs. `bot_id` is filled in once the
/// bot is created.
fn bot_span(profile: &str, slot: usize) -> Span {
    info_span!("bot", profile = %profile, slot, bot_id = field::Empty)
}

fn push(outcomes: &Outcomes, slot: usize, result: Result<BotSummary, LifecycleError>) {
    outcomes
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push((slot, result));
}
