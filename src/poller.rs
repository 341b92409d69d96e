//! Bounded fixed-interval polling.
//!
//! `StatusPoller` retries only the "not there yet" condition. A failing fetch
//! ends the poll on the spot and hands its error back to the caller untouched.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry ceiling and spacing for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum number of fetches.
    pub max_attempts: u32,
    /// Delay between a miss and the next fetch.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            interval: Duration::from_millis(2000),
        }
    }
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Outcome of a poll that did not hit a fetch error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult<T> {
    Matched { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl<T> PollResult<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            PollResult::Matched { attempts, .. } | PollResult::Exhausted { attempts } => *attempts,
        }
    }
}

/// Timed suspension used between attempts.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait::async_trait]
impl<T: Sleeper + ?Sized> Sleeper for std::sync::Arc<T> {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusPoller<S = TokioSleeper> {
    sleeper: S,
}

impl StatusPoller<TokioSleeper> {
    pub fn new() -> Self {
        Self {
            sleeper: TokioSleeper,
        }
    }
}

impl<S: Sleeper> StatusPoller<S> {
    pub fn with_sleeper(sleeper: S) -> Self {
        Self { sleeper }
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Fetch up to `config.max_attempts` times until `predicate` yields a value.
    ///
    /// The predicate sees the whole snapshot returned by each fetch. There is
    /// no sleep after the matching fetch nor after the last attempt, so a poll
    /// that exhausts performs `max_attempts - 1` sleeps.
    pub async fn poll<R, T, E, F, Fut, P>(
        &self,
        config: &PollConfig,
        mut fetch: F,
        mut predicate: P,
    ) -> Result<PollResult<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        P: FnMut(&R) -> Option<T>,
    {
        for attempt in 1..=config.max_attempts {
            let snapshot = fetch().await?;

            if let Some(value) = predicate(&snapshot) {
                return Ok(PollResult::Matched {
                    value,
                    attempts: attempt,
                });
            }

            debug!(attempt, max_attempts = config.max_attempts, "condition not met yet");

            if attempt < config.max_attempts {
                self.sleeper.sleep(config.interval).await;
            }
        }

        Ok(PollResult::Exhausted {
            attempts: config.max_attempts,
        })
    }
}
