//! Shared fixtures: a scripted in-process `BotApi` and sinks/sleepers that count.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use botload::api::{BotApi, BotDetails, CreatedBot, TransportError};
use botload::driver::{BotLifecycleDriver, DriverConfig};
use botload::log::{LogAccumulator, LogLine, LogSink, MemorySink};
use botload::poller::{PollConfig, Sleeper};
use botload::timeline::{
    StatusRecord, BOT_RECEIVED_LEAVE_CALL, CALL_ENDED, DONE, IN_CALL_NOT_RECORDING,
};

pub const JOIN_OFFSET_MS: i64 = 8_000;
pub const CALL_ENDED_OFFSET_MS: i64 = 1_000;
pub const DONE_OFFSET_MS: i64 = 6_000;

// ============================================================================
// Mock bot API
// ============================================================================

#[derive(Debug, Clone)]
struct BotState {
    created_at: DateTime<Utc>,
    polls: u32,
    left_at: Option<DateTime<Utc>>,
    polls_since_leave: u32,
}

/// Scripted bot API. Bots join on their `join_after`-th poll, acknowledge a
/// leave and reach `done` on the `leave_done_after`-th poll after the leave
/// request, and expose a video URL from the `artifact_after`-th poll after it.
pub struct MockBotApi {
    pub join_status: String,
    pub join_after: u32,
    pub leave_done_after: u32,
    pub artifact_after: u32,
    pub acknowledge_leave: bool,
    pub emit_call_ended: bool,
    pub fail_creates: HashSet<usize>,
    pub fail_gets: HashSet<usize>,
    pub fail_leave: bool,
    pub create_delay: Duration,

    bots: Mutex<HashMap<String, BotState>>,
    creates: AtomicUsize,
    gets: AtomicUsize,
    leaves: AtomicUsize,
    in_flight_creates: AtomicUsize,
    max_in_flight_creates: AtomicUsize,
}

impl Default for MockBotApi {
    fn default() -> Self {
        Self {
            join_status: IN_CALL_NOT_RECORDING.to_string(),
            join_after: 2,
            leave_done_after: 2,
            artifact_after: 3,
            acknowledge_leave: true,
            emit_call_ended: true,
            fail_creates: HashSet::new(),
            fail_gets: HashSet::new(),
            fail_leave: false,
            create_delay: Duration::ZERO,
            bots: Mutex::new(HashMap::new()),
            creates: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            in_flight_creates: AtomicUsize::new(0),
            max_in_flight_creates: AtomicUsize::new(0),
        }
    }
}

impl MockBotApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join_status(mut self, code: &str) -> Self {
        self.join_status = code.to_string();
        self
    }

    pub fn join_after(mut self, polls: u32) -> Self {
        self.join_after = polls;
        self
    }

    pub fn never_join(self) -> Self {
        self.join_after(u32::MAX)
    }

    pub fn without_leave_ack(mut self) -> Self {
        self.acknowledge_leave = false;
        self
    }

    pub fn without_call_ended(mut self) -> Self {
        self.emit_call_ended = false;
        self
    }

    /// Fail the n-th create call (0-based, in call order).
    pub fn fail_create(mut self, n: usize) -> Self {
        self.fail_creates.insert(n);
        self
    }

    /// Fail the n-th get call (0-based, across all bots).
    pub fn fail_get(mut self, n: usize) -> Self {
        self.fail_gets.insert(n);
        self
    }

    pub fn fail_leave(mut self) -> Self {
        self.fail_leave = true;
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_creates(&self) -> usize {
        self.max_in_flight_creates.load(Ordering::SeqCst)
    }

    fn records_for(&self, state: &BotState) -> Vec<StatusRecord> {
        let ms = chrono::Duration::milliseconds;
        let mut records = vec![StatusRecord::new("joining_call", state.created_at + ms(500))];
        if state.polls >= self.join_after {
            records.push(StatusRecord::new(
                self.join_status.clone(),
                state.created_at + ms(JOIN_OFFSET_MS),
            ));
        }
        if let Some(left) = state.left_at {
            if state.polls_since_leave >= self.leave_done_after {
                let code = if self.emit_call_ended { CALL_ENDED } else { "leaving" };
                let mut ended = StatusRecord::new(code, left + ms(CALL_ENDED_OFFSET_MS));
                if self.acknowledge_leave {
                    ended = ended.with_sub_code(BOT_RECEIVED_LEAVE_CALL);
                }
                records.push(ended);
                records.push(StatusRecord::new(DONE, left + ms(DONE_OFFSET_MS)));
            }
        }
        // Newest first, which the API does not promise either way.
        records.reverse();
        records
    }
}

#[async_trait]
impl BotApi for MockBotApi {
    async fn create_bot(&self, _body: &serde_json::Value) -> Result<CreatedBot, TransportError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let active = self.in_flight_creates.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_creates.fetch_max(active, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.in_flight_creates.fetch_sub(1, Ordering::SeqCst);

        if self.fail_creates.contains(&n) {
            return Err(unavailable("POST", "/bot".to_string()));
        }

        let id = format!("bot-{n}");
        let created_at = Utc::now();
        self.bots.lock().unwrap().insert(
            id.clone(),
            BotState {
                created_at,
                polls: 0,
                left_at: None,
                polls_since_leave: 0,
            },
        );
        Ok(CreatedBot {
            id,
            server_date: created_at,
        })
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotDetails, TransportError> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.contains(&n) {
            return Err(unavailable("GET", format!("/bot/{bot_id}")));
        }
        let mut bots = self.bots.lock().unwrap();
        let state = bots
            .get_mut(bot_id)
            .ok_or_else(|| not_found("GET", format!("/bot/{bot_id}")))?;
        state.polls += 1;
        if state.left_at.is_some() {
            state.polls_since_leave += 1;
        }
        let video_url = (state.left_at.is_some() && state.polls_since_leave >= self.artifact_after)
            .then(|| format!("https://video.example.com/{bot_id}.mp4"));
        Ok(BotDetails {
            id: Some(bot_id.to_string()),
            status_changes: self.records_for(state),
            video_url,
        })
    }

    async fn leave_call(&self, bot_id: &str) -> Result<(), TransportError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        if self.fail_leave {
            return Err(unavailable("POST", format!("/bot/{bot_id}/leave_call")));
        }
        let mut bots = self.bots.lock().unwrap();
        let state = bots
            .get_mut(bot_id)
            .ok_or_else(|| not_found("POST", format!("/bot/{bot_id}/leave_call")))?;
        state.left_at = Some(Utc::now());
        Ok(())
    }
}

fn unavailable(method: &'static str, url: String) -> TransportError {
    TransportError::Status {
        method,
        url,
        status: 503,
        body: "service unavailable".to_string(),
    }
}

fn not_found(method: &'static str, url: String) -> TransportError {
    TransportError::Status {
        method,
        url,
        status: 404,
        body: "bot not found".to_string(),
    }
}

// ============================================================================
// Sink and sleeper
// ============================================================================

/// Memory sink that also counts `write_lines` calls.
#[derive(Default)]
pub struct CountingSink {
    pub inner: MemorySink,
    pub writes: AtomicUsize,
}

impl CountingSink {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        self.inner.messages()
    }
}

impl LogSink for CountingSink {
    fn write_lines(&self, lines: &[LogLine]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_lines(lines)
    }
}

/// Records requested durations and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn fast_config() -> DriverConfig {
    DriverConfig {
        poll: PollConfig::new(10, Duration::from_millis(2000)),
        ..DriverConfig::default()
    }
}

pub struct Harness {
    pub api: Arc<MockBotApi>,
    pub sink: Arc<CountingSink>,
    pub sleeper: Arc<RecordingSleeper>,
    pub log: Arc<LogAccumulator>,
    pub driver: Arc<BotLifecycleDriver>,
}

pub fn harness(api: MockBotApi, config: DriverConfig) -> Harness {
    let api = Arc::new(api);
    let sink = Arc::new(CountingSink::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let log = Arc::new(LogAccumulator::new(Arc::clone(&sink)));
    let driver = Arc::new(BotLifecycleDriver::with_sleeper(
        api.clone(),
        config,
        serde_json::json!({"meeting_url": "https://meet.google.com/abc-defg-hij"}),
        Arc::clone(&log),
        sleeper.clone(),
    ));
    Harness {
        api,
        sink,
        sleeper,
        log,
        driver,
    }
}

pub fn count_starting_with(messages: &[String], prefix: &str) -> usize {
    messages.iter().filter(|m| m.starts_with(prefix)).count()
}
