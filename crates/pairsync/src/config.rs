use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReplicaError;

/// Environment variable overriding [`ReplicaConfig::retry_interval`], in ms.
pub const ENV_RETRY_INTERVAL_MS: &str = "PAIRSYNC_RETRY_INTERVAL_MS";

/// Environment variable overriding [`ReplicaConfig::notify_capacity`].
pub const ENV_NOTIFY_CAPACITY: &str = "PAIRSYNC_NOTIFY_CAPACITY";

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_NOTIFY_CAPACITY: usize = 64;

/// Tunables for a [`Replica`](crate::Replica).
///
/// Serializes with the interval in milliseconds:
///
/// ```
/// use pairsync::ReplicaConfig;
///
/// let config: ReplicaConfig = serde_json::from_str(r#"{"retry_interval_ms": 500}"#).unwrap();
/// assert_eq!(config.retry_interval.as_millis(), 500);
/// assert_eq!(config.notify_capacity, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Period of the retry schedule while the peer cannot be reached.
    #[serde(rename = "retry_interval_ms", with = "millis")]
    pub retry_interval: Duration,
    /// How many origin events a slow subscriber may fall behind before it
    /// starts losing them.
    pub notify_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl ReplicaConfig {
    /// Defaults, overridden by `PAIRSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ReplicaError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ReplicaError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_RETRY_INTERVAL_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                ReplicaError::Config(format!("{ENV_RETRY_INTERVAL_MS}={raw:?} is not a number"))
            })?;
            config.retry_interval = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup(ENV_NOTIFY_CAPACITY) {
            config.notify_capacity = raw.trim().parse().map_err(|_| {
                ReplicaError::Config(format!("{ENV_NOTIFY_CAPACITY}={raw:?} is not a number"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ReplicaError> {
        if self.retry_interval.is_zero() {
            return Err(ReplicaError::Config(
                "retry interval must be greater than zero".into(),
            ));
        }
        if self.notify_capacity == 0 {
            return Err(ReplicaError::Config(
                "notify capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
