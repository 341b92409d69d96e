//! Per-bot lifecycle: create, wait for join, optional dwell, optional leave,
//! wait for the recording artifact.
//!
//! Each stage is strictly sequential within one bot. The first transport error
//! or exhausted poll ends the run in `BotStage::Failed`; sibling runs are not
//! affected. Success and failure both leave exactly one line in the metric
//! log.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::api::{BotApi, BotDetails, TransportError};
use crate::log::LogAccumulator;
use crate::poller::{PollConfig, PollResult, Sleeper, StatusPoller, TokioSleeper};
use crate::report;
use crate::timeline::{
    find_by_sub_code, find_first, millis_between, BOT_RECEIVED_LEAVE_CALL, CALL_ENDED, DONE,
    IN_CALL_NOT_RECORDING, IN_WAITING_ROOM,
};

/// Lifecycle position of one simulated bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStage {
    Created,
    Joining,
    InCall,
    Leaving,
    AwaitingArtifact,
    Complete,
    Failed,
}

impl BotStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, BotStage::Complete | BotStage::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_advance_to(self, next: BotStage) -> bool {
        use BotStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, Joining)
            | (Joining, InCall)
            | (Joining, Complete)
            | (InCall, Leaving)
            | (Leaving, AwaitingArtifact)
            | (AwaitingArtifact, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BotStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotStage::Created => "create",
            BotStage::Joining => "join",
            BotStage::InCall => "in-call",
            BotStage::Leaving => "leave",
            BotStage::AwaitingArtifact => "artifact",
            BotStage::Complete => "complete",
            BotStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("bot {bot} failed during {stage}: {source}")]
    Transport {
        bot: String,
        stage: BotStage,
        #[source]
        source: TransportError,
    },

    #[error("bot {bot} did not finish {stage} after {attempts} attempts")]
    RetryExhausted {
        bot: String,
        stage: BotStage,
        attempts: u32,
    },

    #[error("bot {bot} reported an artifact but no `{code}` status during {stage}")]
    MissingStatus {
        bot: String,
        stage: BotStage,
        code: &'static str,
    },
}

impl LifecycleError {
    /// Bot id, or `#<slot>` when the bot was never created.
    pub fn bot(&self) -> &str {
        match self {
            LifecycleError::Transport { bot, .. }
            | LifecycleError::RetryExhausted { bot, .. }
            | LifecycleError::MissingStatus { bot, .. } => bot,
        }
    }

    pub fn stage(&self) -> BotStage {
        match self {
            LifecycleError::Transport { stage, .. }
            | LifecycleError::RetryExhausted { stage, .. }
            | LifecycleError::MissingStatus { stage, .. } => *stage,
        }
    }

    /// The failure without the bot/stage prefix.
    pub fn detail(&self) -> String {
        match self {
            LifecycleError::Transport { source, .. } => source.to_string(),
            LifecycleError::RetryExhausted { attempts, .. } => {
                format!("status not reached after {attempts} attempts")
            }
            LifecycleError::MissingStatus { code, .. } => {
                format!("artifact present but `{code}` status missing")
            }
        }
    }
}

/// Knobs for one bot lifecycle.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Status code that counts as "joined".
    pub join_status: String,
    pub poll: PollConfig,
    /// Wait after the create call returns.
    pub post_create_delay: Duration,
    /// Wait before the first join poll.
    pub pre_join_delay: Duration,
    /// Time spent in the call before asking the bot to leave.
    pub in_call_dwell: Duration,
    /// Run the leave and artifact stages. When false the run completes on join.
    pub leave_call: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            join_status: IN_CALL_NOT_RECORDING.to_string(),
            poll: PollConfig::default(),
            post_create_delay: Duration::ZERO,
            pre_join_delay: Duration::ZERO,
            in_call_dwell: Duration::from_secs(15),
            leave_call: true,
        }
    }
}

impl DriverConfig {
    /// Create and wait for the waiting room only.
    pub fn join_only() -> Self {
        Self {
            join_status: IN_WAITING_ROOM.to_string(),
            post_create_delay: Duration::from_secs(15),
            pre_join_delay: Duration::from_secs(2),
            in_call_dwell: Duration::ZERO,
            leave_call: false,
            ..Self::default()
        }
    }
}

/// Working record for one bot, filled in stage by stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotRun {
    pub slot: usize,
    pub stage: BotStage,
    pub bot_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub api_execution_ms: Option<i64>,
    pub joined_at: Option<DateTime<Utc>>,
    pub leave_requested_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub artifact_url: Option<String>,
    pub artifact_ready_at: Option<DateTime<Utc>>,
}

impl BotRun {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            stage: BotStage::Created,
            bot_id: None,
            created_at: None,
            api_execution_ms: None,
            joined_at: None,
            leave_requested_at: None,
            left_at: None,
            artifact_url: None,
            artifact_ready_at: None,
        }
    }

    pub fn label(&self) -> String {
        match &self.bot_id {
            Some(id) => id.clone(),
            None => format!("#{}", self.slot),
        }
    }

    fn advance(&mut self, next: BotStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal lifecycle transition {:?} -> {:?}",
            self.stage,
            next
        );
        self.stage = next;
    }
}

/// Leave and artifact timings of a full lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitTiming {
    /// Local clock when the leave request was sent.
    pub leave_requested_at: DateTime<Utc>,
    /// Server `done` status time.
    pub left_at: DateTime<Utc>,
    pub artifact_url: String,
    pub call_ended_at: DateTime<Utc>,
    /// Server `done` status time as seen on the artifact poll.
    pub artifact_ready_at: DateTime<Utc>,
}

impl ExitTiming {
    /// Local leave request to server `done`. Mixes the local and server clocks.
    pub fn time_to_exit_ms(&self) -> i64 {
        millis_between(self.leave_requested_at, self.left_at)
    }

    /// `call_ended` to `done`, both server timestamps.
    pub fn video_creation_ms(&self) -> i64 {
        millis_between(self.call_ended_at, self.artifact_ready_at)
    }
}

/// A completed bot run. Every timestamp a duration depends on is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotSummary {
    pub slot: usize,
    pub bot_id: String,
    /// Local clock when the create request was sent.
    pub request_sent_at: DateTime<Utc>,
    /// Server clock from the create response `Date` header.
    pub created_at: DateTime<Utc>,
    /// Local wall-clock round trip of the create call.
    pub api_execution_ms: i64,
    pub joined_at: DateTime<Utc>,
    pub join_attempts: u32,
    pub exit: Option<ExitTiming>,
}

impl BotSummary {
    /// Server create time to server join status.
    pub fn time_taken_to_join_ms(&self) -> i64 {
        millis_between(self.created_at, self.joined_at)
    }

    pub fn start_time(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn join_time(&self) -> String {
        self.joined_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Runs one bot lifecycle per call to `run`.
pub struct BotLifecycleDriver {
    api: Arc<dyn BotApi>,
    config: DriverConfig,
    request_body: serde_json::Value,
    poller: StatusPoller<Arc<dyn Sleeper>>,
    log: Arc<LogAccumulator>,
}

impl BotLifecycleDriver {
    pub fn new(
        api: Arc<dyn BotApi>,
        config: DriverConfig,
        request_body: serde_json::Value,
        log: Arc<LogAccumulator>,
    ) -> Self {
        Self::with_sleeper(api, config, request_body, log, Arc::new(TokioSleeper))
    }

    /// Same as `new`, with every timed wait routed through `sleeper`.
    pub fn with_sleeper(
        api: Arc<dyn BotApi>,
        config: DriverConfig,
        request_body: serde_json::Value,
        log: Arc<LogAccumulator>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            api,
            config,
            request_body,
            poller: StatusPoller::with_sleeper(sleeper),
            log,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<LogAccumulator> {
        &self.log
    }

    /// Drive bot number `slot` through its lifecycle and log the outcome.
    pub async fn run(&self, slot: usize) -> Result<BotSummary, LifecycleError> {
        let mut run = BotRun::new(slot);
        match self.drive(&mut run).await {
            Ok(summary) => {
                run.advance(BotStage::Complete);
                let line = report::format_summary(&summary);
                self.log.append(line);
                Ok(summary)
            }
            Err(e) => {
                run.advance(BotStage::Failed);
                error!(bot = %e.bot(), stage = %e.stage(), error = %e, "bot run failed");
                self.log.append(report::format_error_line(&e));
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut BotRun) -> Result<BotSummary, LifecycleError> {
        // Created
        let request_sent_at = Utc::now();
        let created = self
            .api
            .create_bot(&self.request_body)
            .await
            .map_err(|source| LifecycleError::Transport {
                bot: run.label(),
                stage: BotStage::Created,
                source,
            })?;
        let api_execution_ms = millis_between(request_sent_at, Utc::now());
        run.bot_id = Some(created.id.clone());
        run.created_at = Some(created.server_date);
        run.api_execution_ms = Some(api_execution_ms);
        let bot_id = created.id;
        Span::current().record("bot_id", bot_id.as_str());
        info!(bot_id = %bot_id, slot = run.slot, api_execution_ms, "bot created");

        self.pause(self.config.post_create_delay).await;

        // Joining
        run.advance(BotStage::Joining);
        self.pause(self.config.pre_join_delay).await;
        let join_status = self.config.join_status.as_str();
        let (joined_at, join_attempts) = self
            .poll_stage(run, &bot_id, |details| {
                find_first(&details.status_changes, join_status, None).map(|r| r.created_at)
            })
            .await?;
        run.joined_at = Some(joined_at);
        info!(bot_id = %bot_id, attempts = join_attempts, status = %join_status, "bot joined");

        let mut summary = BotSummary {
            slot: run.slot,
            bot_id: bot_id.clone(),
            request_sent_at,
            created_at: created.server_date,
            api_execution_ms,
            joined_at,
            join_attempts,
            exit: None,
        };

        if !self.config.leave_call {
            return Ok(summary);
        }

        // InCall
        run.advance(BotStage::InCall);
        self.pause(self.config.in_call_dwell).await;

        // Leaving
        run.advance(BotStage::Leaving);
        let leave_requested_at = Utc::now();
        run.leave_requested_at = Some(leave_requested_at);
        self.api
            .leave_call(&bot_id)
            .await
            .map_err(|source| LifecycleError::Transport {
                bot: run.label(),
                stage: BotStage::Leaving,
                source,
            })?;
        let (left_at, leave_attempts) = self
            .poll_stage(run, &bot_id, |details| {
                let records = &details.status_changes;
                let acknowledged = find_by_sub_code(records, BOT_RECEIVED_LEAVE_CALL);
                let done = find_first(records, DONE, None);
                acknowledged.and(done).map(|r| r.created_at)
            })
            .await?;
        run.left_at = Some(left_at);
        info!(bot_id = %bot_id, attempts = leave_attempts, "bot left call");

        // AwaitingArtifact
        run.advance(BotStage::AwaitingArtifact);
        let ((artifact_url, call_ended, done), artifact_attempts) = self
            .poll_stage(run, &bot_id, |details| {
                let url = details.artifact_url()?;
                let records = &details.status_changes;
                Some((
                    url.to_string(),
                    find_first(records, CALL_ENDED, None).map(|r| r.created_at),
                    find_first(records, DONE, None).map(|r| r.created_at),
                ))
            })
            .await?;
        let missing = |code: &'static str| LifecycleError::MissingStatus {
            bot: bot_id.clone(),
            stage: BotStage::AwaitingArtifact,
            code,
        };
        let call_ended_at = call_ended.ok_or_else(|| missing(CALL_ENDED))?;
        let artifact_ready_at = done.ok_or_else(|| missing(DONE))?;
        run.artifact_url = Some(artifact_url.clone());
        run.artifact_ready_at = Some(artifact_ready_at);
        info!(bot_id = %bot_id, attempts = artifact_attempts, "artifact ready");

        summary.exit = Some(ExitTiming {
            leave_requested_at,
            left_at,
            artifact_url,
            call_ended_at,
            artifact_ready_at,
        });
        Ok(summary)
    }

    /// Poll `GET /bot/{id}` for the current stage of `run`.
    async fn poll_stage<T>(
        &self,
        run: &BotRun,
        bot_id: &str,
        predicate: impl FnMut(&BotDetails) -> Option<T>,
    ) -> Result<(T, u32), LifecycleError> {
        let stage = run.stage;
        let api = &self.api;
        let result = self
            .poller
            .poll(&self.config.poll, || api.get_bot(bot_id), predicate)
            .instrument(info_span!("poll", bot_id = %bot_id, %stage))
            .await
            .map_err(|source| LifecycleError::Transport {
                bot: bot_id.to_string(),
                stage,
                source,
            })?;

        match result {
            PollResult::Matched { value, attempts } => Ok((value, attempts)),
            PollResult::Exhausted { attempts } => {
                warn!(bot_id = %bot_id, %stage, attempts, "retries exhausted");
                Err(LifecycleError::RetryExhausted {
                    bot: bot_id.to_string(),
                    stage,
                    attempts,
                })
            }
        }
    }

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.poller.sleeper().sleep(duration).await;
        }
    }
}

impl fmt::Debug for BotLifecycleDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotLifecycleDriver")
            .field("config", &self.config)
            .finish()
    }
}
