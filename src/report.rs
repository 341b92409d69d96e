//! Metric-log line formatting and per-profile timing statistics.

use serde::Serialize;

use crate::driver::{BotSummary, LifecycleError};

/// One summary line per completed bot.
pub fn format_summary(summary: &BotSummary) -> String {
    match &summary.exit {
        Some(exit) => format!(
            "Bot ID: {}, Create bot API execution time: {}ms, Time Taken for bot to Join: {}ms, Time taken for bot to Exit: {}ms, Video Creation Time: {}ms",
            summary.bot_id,
            summary.api_execution_ms,
            summary.time_taken_to_join_ms(),
            exit.time_to_exit_ms(),
            exit.video_creation_ms(),
        ),
        None => format!(
            "Bot ID: {}, API execution time: {}ms, Start Time: {}, Join Time: {}, Time Taken to Join: {}ms",
            summary.bot_id,
            summary.api_execution_ms,
            summary.start_time(),
            summary.join_time(),
            summary.time_taken_to_join_ms(),
        ),
    }
}

/// One error line per failed bot.
pub fn format_error_line(error: &LifecycleError) -> String {
    format!(
        "Error in bot {} during {}: {}",
        error.bot(),
        error.stage(),
        error.detail()
    )
}

/// min / mean / p50 / max over one duration metric, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub p50: i64,
}

impl MetricStats {
    pub fn from_samples(samples: &[i64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let sum: i128 = sorted.iter().map(|&v| v as i128).sum();
        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum as f64 / count as f64,
            // Lower median for even counts.
            p50: sorted[(count - 1) / 2],
        })
    }
}

/// Aggregates over the successful runs of one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileStats {
    pub api_execution: Option<MetricStats>,
    pub join: Option<MetricStats>,
    pub exit: Option<MetricStats>,
    pub video_creation: Option<MetricStats>,
}

impl ProfileStats {
    pub fn from_summaries<'a>(summaries: impl IntoIterator<Item = &'a BotSummary>) -> Self {
        let mut api = Vec::new();
        let mut join = Vec::new();
        let mut exit = Vec::new();
        let mut video = Vec::new();
        for s in summaries {
            api.push(s.api_execution_ms);
            join.push(s.time_taken_to_join_ms());
            if let Some(e) = &s.exit {
                exit.push(e.time_to_exit_ms());
                video.push(e.video_creation_ms());
            }
        }
        Self {
            api_execution: MetricStats::from_samples(&api),
            join: MetricStats::from_samples(&join),
            exit: MetricStats::from_samples(&exit),
            video_creation: MetricStats::from_samples(&video),
        }
    }
}

/// `Profile <name> stats: join min/mean/p50/max=...ms, ...`, skipping empty metrics.
pub fn format_stats_line(profile: &str, stats: &ProfileStats) -> String {
    let mut parts = Vec::new();
    let metrics = [
        ("api", &stats.api_execution),
        ("join", &stats.join),
        ("exit", &stats.exit),
        ("video", &stats.video_creation),
    ];
    for (name, metric) in metrics {
        if let Some(m) = metric {
            parts.push(format!(
                "{} min/mean/p50/max={}/{:.0}/{}/{}ms (n={})",
                name, m.min, m.mean, m.p50, m.max, m.count
            ));
        }
    }
    if parts.is_empty() {
        format!("Profile {} stats: no successful bot runs", profile)
    } else {
        format!("Profile {} stats: {}", profile, parts.join(", "))
    }
}
