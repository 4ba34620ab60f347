//! Pool configuration.
//!
//! Every option is optional. An unset option means "use the engine default",
//! never an error, and values are not range-checked: `max_active = 0` is a
//! valid pool that is always exhausted.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// Default cap on concurrently borrowed connections.
pub const DEFAULT_MAX_ACTIVE: usize = 8;
/// Default cap on connections kept idle.
pub const DEFAULT_MAX_IDLE: usize = 8;
/// Default idle floor maintained by the evictor.
pub const DEFAULT_MIN_IDLE: usize = 0;
/// Default idle time before a connection becomes eligible for eviction.
pub const DEFAULT_MIN_EVICTION_TIME: Duration = Duration::from_secs(30 * 60);
/// Default number of idle connections inspected per eviction sweep.
pub const DEFAULT_NUM_TESTS_PER_EVICTION_RUN: usize = 3;

/// What `borrow` does when `max_active` connections are already out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ExhaustedAction {
    /// Fail immediately with `PoolError::Exhausted`.
    Fail,
    /// Wait up to `max_wait_time` (or forever) for a connection.
    #[default]
    Block,
    /// Ignore `max_active` and create a new connection.
    Grow,
}

/// Error returned by the strict [`ExhaustedAction`] parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown exhausted action: {0}")]
pub struct UnknownExhaustedAction(pub String);

impl ExhaustedAction {
    /// Parse an action name, falling back to [`ExhaustedAction::Block`] with a
    /// warning when the name is not recognised.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_else(|e: UnknownExhaustedAction| {
            let fallback = Self::default();
            warn!(error = %e, fallback = %fallback, "unrecognised exhausted action, using default");
            fallback
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustedAction::Fail => "FAIL",
            ExhaustedAction::Block => "BLOCK",
            ExhaustedAction::Grow => "GROW",
        }
    }
}

impl FromStr for ExhaustedAction {
    type Err = UnknownExhaustedAction;

    /// Accepts `FAIL`, `BLOCK`, `GROW` and the descriptor spellings
    /// `WHEN_EXHAUSTED_FAIL`, `WHEN_EXHAUSTED_BLOCK`, `WHEN_EXHAUSTED_GROW`,
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("WHEN_EXHAUSTED_").unwrap_or(&upper);
        match name {
            "FAIL" => Ok(ExhaustedAction::Fail),
            "BLOCK" => Ok(ExhaustedAction::Block),
            "GROW" => Ok(ExhaustedAction::Grow),
            _ => Err(UnknownExhaustedAction(s.to_string())),
        }
    }
}

impl fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExhaustedAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExhaustedAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&raw))
    }
}

/// Capacity, timing and validation policy for one connection pool.
///
/// Built with the `with_*` methods or deserialized from a connector
/// descriptor; immutable afterwards. Accessors return the resolved value,
/// applying the defaults above for unset options.
///
/// ```toml
/// max_active = 4
/// max_wait_time = "500ms"
/// eviction_check_interval = "30s"
/// min_eviction_time = "5m"
/// exhausted_action = "WHEN_EXHAUSTED_FAIL"
/// test_on_borrow = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(alias = "maxActiveConnections", skip_serializing_if = "Option::is_none")]
    max_active: Option<usize>,
    #[serde(alias = "maxIdleConnections", skip_serializing_if = "Option::is_none")]
    max_idle: Option<usize>,
    #[serde(alias = "minIdleConnections", skip_serializing_if = "Option::is_none")]
    min_idle: Option<usize>,
    #[serde(
        alias = "maxWaitTime",
        with = "duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    max_wait_time: Option<Duration>,
    #[serde(
        alias = "minEvictionTime",
        with = "duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    min_eviction_time: Option<Duration>,
    #[serde(
        alias = "evictionCheckInterval",
        with = "duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    eviction_check_interval: Option<Duration>,
    #[serde(alias = "exhaustedAction", skip_serializing_if = "Option::is_none")]
    exhausted_action: Option<ExhaustedAction>,
    #[serde(alias = "testOnBorrow", skip_serializing_if = "Option::is_none")]
    test_on_borrow: Option<bool>,
    #[serde(alias = "testOnReturn", skip_serializing_if = "Option::is_none")]
    test_on_return: Option<bool>,
    #[serde(alias = "testWhileIdle", skip_serializing_if = "Option::is_none")]
    test_while_idle: Option<bool>,
    #[serde(alias = "numTestsPerEvictionRun", skip_serializing_if = "Option::is_none")]
    num_tests_per_eviction_run: Option<usize>,
    #[serde(
        alias = "softMinEvictableIdleTimeMillis",
        with = "duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    soft_min_evictable_idle_time: Option<Duration>,
}

impl PoolConfig {
    /// A configuration with every option unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration table from TOML.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read a configuration table from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn with_max_active(self, max_active: usize) -> Self {
        Self {
            max_active: Some(max_active),
            ..self
        }
    }

    pub fn with_max_idle(self, max_idle: usize) -> Self {
        Self {
            max_idle: Some(max_idle),
            ..self
        }
    }

    pub fn with_min_idle(self, min_idle: usize) -> Self {
        Self {
            min_idle: Some(min_idle),
            ..self
        }
    }

    pub fn with_max_wait_time(self, max_wait_time: Duration) -> Self {
        Self {
            max_wait_time: Some(max_wait_time),
            ..self
        }
    }

    pub fn with_min_eviction_time(self, min_eviction_time: Duration) -> Self {
        Self {
            min_eviction_time: Some(min_eviction_time),
            ..self
        }
    }

    pub fn with_eviction_check_interval(self, interval: Duration) -> Self {
        Self {
            eviction_check_interval: Some(interval),
            ..self
        }
    }

    pub fn with_exhausted_action(self, action: ExhaustedAction) -> Self {
        Self {
            exhausted_action: Some(action),
            ..self
        }
    }

    pub fn with_test_on_borrow(self, enabled: bool) -> Self {
        Self {
            test_on_borrow: Some(enabled),
            ..self
        }
    }

    pub fn with_test_on_return(self, enabled: bool) -> Self {
        Self {
            test_on_return: Some(enabled),
            ..self
        }
    }

    pub fn with_test_while_idle(self, enabled: bool) -> Self {
        Self {
            test_while_idle: Some(enabled),
            ..self
        }
    }

    pub fn with_num_tests_per_eviction_run(self, count: usize) -> Self {
        Self {
            num_tests_per_eviction_run: Some(count),
            ..self
        }
    }

    pub fn with_soft_min_evictable_idle_time(self, idle_time: Duration) -> Self {
        Self {
            soft_min_evictable_idle_time: Some(idle_time),
            ..self
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.unwrap_or(DEFAULT_MAX_ACTIVE)
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle.unwrap_or(DEFAULT_MAX_IDLE)
    }

    pub fn min_idle(&self) -> usize {
        self.min_idle.unwrap_or(DEFAULT_MIN_IDLE)
    }

    /// How long a BLOCK borrow waits. `None` (or zero) waits indefinitely.
    pub fn max_wait_time(&self) -> Option<Duration> {
        self.max_wait_time.filter(|wait| !wait.is_zero())
    }

    /// Idle time after which a connection above `min_idle` is evicted.
    /// Zero turns off eviction by age.
    pub fn min_eviction_time(&self) -> Option<Duration> {
        Some(self.min_eviction_time.unwrap_or(DEFAULT_MIN_EVICTION_TIME))
            .filter(|idle_time| !idle_time.is_zero())
    }

    /// Period of the background eviction sweep. `None` (or zero) disables it.
    pub fn eviction_check_interval(&self) -> Option<Duration> {
        self.eviction_check_interval.filter(|interval| !interval.is_zero())
    }

    pub fn exhausted_action(&self) -> ExhaustedAction {
        self.exhausted_action.unwrap_or_default()
    }

    pub fn test_on_borrow(&self) -> bool {
        self.test_on_borrow.unwrap_or(false)
    }

    pub fn test_on_return(&self) -> bool {
        self.test_on_return.unwrap_or(false)
    }

    pub fn test_while_idle(&self) -> bool {
        self.test_while_idle.unwrap_or(false)
    }

    pub fn num_tests_per_eviction_run(&self) -> usize {
        self.num_tests_per_eviction_run
            .unwrap_or(DEFAULT_NUM_TESTS_PER_EVICTION_RUN)
    }

    /// Idle threshold applied to connections that hold the pool at `min_idle`.
    /// `None` means those connections are never evicted for age.
    pub fn soft_min_evictable_idle_time(&self) -> Option<Duration> {
        self.soft_min_evictable_idle_time
    }
}

/// Parse a duration string like "500ms", "5s", "2m". A bare number is
/// milliseconds, matching the descriptor format.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}

/// Durations as integer milliseconds or human strings.
mod duration_millis {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_some(&millis)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(Raw::Text(text)) => super::parse_duration(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid duration `{text}`"))),
        }
    }
}
