//! Status-history lookups and elapsed-time math.
//!
//! A bot's `status_changes` array is an append-only history, but the API makes
//! no promise about array order. Every lookup here searches the whole slice and
//! resolves ties by the record's own `created_at`, never by position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status code reported while the bot waits to be admitted.
pub const IN_WAITING_ROOM: &str = "in_waiting_room";
/// Status code reported once the bot is admitted but not yet recording.
pub const IN_CALL_NOT_RECORDING: &str = "in_call_not_recording";
/// Status code reported when the call is over for the bot.
pub const CALL_ENDED: &str = "call_ended";
/// Terminal status code.
pub const DONE: &str = "done";
/// Sub-code attached when the bot has accepted a leave request.
pub const BOT_RECEIVED_LEAVE_CALL: &str = "bot_received_leave_call";

/// One entry in a bot's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub code: String,
    #[serde(default)]
    pub sub_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(code: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            sub_code: None,
            created_at,
        }
    }

    pub fn with_sub_code(mut self, sub_code: impl Into<String>) -> Self {
        self.sub_code = Some(sub_code.into());
        self
    }
}

/// Earliest record whose `code` matches, optionally also matching `sub_code`.
pub fn find_first<'a>(
    records: &'a [StatusRecord],
    code: &str,
    sub_code: Option<&str>,
) -> Option<&'a StatusRecord> {
    earliest(records.iter().filter(|r| {
        r.code == code && sub_code.map_or(true, |s| r.sub_code.as_deref() == Some(s))
    }))
}

/// Earliest record carrying `sub_code`, whatever its `code`.
pub fn find_by_sub_code<'a>(
    records: &'a [StatusRecord],
    sub_code: &str,
) -> Option<&'a StatusRecord> {
    earliest(
        records
            .iter()
            .filter(|r| r.sub_code.as_deref() == Some(sub_code)),
    )
}

fn earliest<'a>(matches: impl Iterator<Item = &'a StatusRecord>) -> Option<&'a StatusRecord> {
    // min_by_key keeps the first of equal keys, so ties fall back to position.
    matches.min_by_key(|r| r.created_at)
}

/// Milliseconds from `a` to `b`. Negative when `b` happened before `a`.
pub fn duration_between(a: &StatusRecord, b: &StatusRecord) -> i64 {
    millis_between(a.created_at, b.created_at)
}

/// Milliseconds from `from` to `to`, signed.
pub fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}
