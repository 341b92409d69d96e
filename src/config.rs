//! Load-test configuration.
//!
//! TOML is the native format. JSON files are also accepted and may use the
//! camelCase keys of the legacy `config.json` (`authToken`, `requestBody`,
//! `numBots`, `maxRetries`, `timeout`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::recall::DEFAULT_BASE_URL;
use crate::driver::DriverConfig;
use crate::poller::PollConfig;
use crate::runner::{LoadProfile, RunMode};
use crate::timeline::IN_CALL_NOT_RECORDING;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BOTLOAD_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    #[serde(default)]
    pub api: ApiConfig,
    /// Opaque `POST /bot` payload.
    #[serde(default, alias = "requestBody")]
    pub request_body: serde_json::Value,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Deadline for profiles that do not set their own. 0 disables it.
    #[serde(default = "default_profile_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,

    // Flat keys of the legacy JSON layout, folded into the sections on load.
    #[serde(default, alias = "authToken", skip_serializing)]
    auth_token: Option<String>,
    #[serde(default, alias = "maxRetries", skip_serializing)]
    max_retries: Option<u32>,
}

fn default_profile_timeout_ms() -> u64 {
    300_000
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            request_body: serde_json::Value::Null,
            profiles: Vec::new(),
            polling: PollingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            run: RunConfig::default(),
            log: LogConfig::default(),
            timeout_ms: default_profile_timeout_ms(),
            auth_token: None,
            max_retries: None,
        }
    }
}

impl LoadTestConfig {
    /// Load from `path`; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), profiles = config.profiles.len(), "loaded load-test configuration");
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(s)?;
        config.fold_flat_keys();
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(s)?;
        config.fold_flat_keys();
        Ok(config)
    }

    /// Resolve the config path and load it.
    pub fn load_resolved(explicit: Option<&Path>) -> Result<Self> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match resolve_path(explicit, env.as_deref(), Path::new(".")) {
            Some(path) => Self::load(&path),
            None => bail!(
                "no configuration found: pass --config, set {}, or create ./botload.toml",
                CONFIG_ENV
            ),
        }
    }

    fn fold_flat_keys(&mut self) {
        if let Some(token) = self.auth_token.take() {
            if self.api.auth_token.is_empty() {
                self.api.auth_token = token;
            }
        }
        if let Some(retries) = self.max_retries.take() {
            self.polling.max_retries = retries;
        }
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.api.auth_token.trim().is_empty() {
            bail!("api.auth_token must be set");
        }
        if !self.request_body.is_object() {
            bail!("request_body must be a JSON object");
        }
        if self.profiles.is_empty() {
            bail!("at least one load profile is required");
        }
        let mut seen = HashSet::new();
        for p in &self.profiles {
            if p.num_bots == 0 {
                bail!("profile `{}` must have num_bots > 0", p.name);
            }
            if !seen.insert(p.name.as_str()) {
                bail!("duplicate profile name `{}`", p.name);
            }
        }
        if self.polling.max_retries == 0 {
            bail!("polling.max_retries must be > 0");
        }
        if self.run.max_concurrency == Some(0) {
            bail!("run.max_concurrency must be > 0 when set");
        }
        debug!("configuration validated");
        Ok(())
    }

    /// Profiles with the top-level timeout applied where a profile has none.
    pub fn load_profiles(&self) -> Vec<LoadProfile> {
        self.profiles
            .iter()
            .map(|p| LoadProfile {
                name: p.name.clone(),
                num_bots: p.num_bots,
                timeout: millis_or_none(p.timeout_ms.unwrap_or(self.timeout_ms)),
            })
            .collect()
    }

    pub fn driver_config(&self) -> DriverConfig {
        let l = &self.lifecycle;
        DriverConfig {
            join_status: l.join_status.clone(),
            poll: self.polling.poll_config(),
            post_create_delay: Duration::from_millis(l.post_create_delay_ms),
            pre_join_delay: Duration::from_millis(l.pre_join_delay_ms),
            in_call_dwell: Duration::from_millis(l.in_call_dwell_ms),
            leave_call: l.leave_call,
        }
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Config file lookup order: explicit path, `$BOTLOAD_CONFIG`, then
/// `botload.toml` and `config.json` in `dir`.
pub fn resolve_path(explicit: Option<&Path>, env: Option<&Path>, dir: &Path) -> Option<PathBuf> {
    if let Some(p) = explicit.or(env) {
        return Some(p.to_path_buf());
    }
    ["botload.toml", "config.json"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Full `Authorization` header value, e.g. `Token abc123`.
    #[serde(alias = "authToken", skip_serializing)]
    pub auth_token: String,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: String::new(),
            request_timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(alias = "numBots")]
    pub num_bots: usize,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let d = PollConfig::default();
        Self {
            max_retries: d.max_attempts,
            interval_ms: d.interval.as_millis() as u64,
        }
    }
}

impl PollingConfig {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig::new(self.max_retries, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Status code that counts as joined (`in_call_not_recording` or `in_waiting_room`).
    pub join_status: String,
    pub post_create_delay_ms: u64,
    pub pre_join_delay_ms: u64,
    pub in_call_dwell_ms: u64,
    /// Run the leave and artifact stages after joining.
    pub leave_call: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_status: IN_CALL_NOT_RECORDING.to_string(),
            post_create_delay_ms: 0,
            pre_join_delay_ms: 0,
            in_call_dwell_ms: 15_000,
            leave_call: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Cap on simultaneously running bots in concurrent mode.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Append-only metric log.
    pub path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("test.log"),
        }
    }
}
