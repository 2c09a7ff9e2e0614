//! Configuration for the transaction engine.
//!
//! [`FsmConfig`] is plain serde data so it can be embedded in a larger
//! application config or loaded on its own from JSON. Durations are expressed in
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::timer::TimerProfile;

/// Settings consumed by [`FsmDispatcher`](crate::FsmDispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    /// Timer durations copied into every new transaction.
    pub timers: TimerProfile,

    /// Route forked INVITE responses to child transactions.
    pub enable_ict_forking: bool,

    /// How long a terminated INVITE server transaction id stays blocked.
    #[serde(with = "duration_ms")]
    pub ist_block_duration: Duration,

    /// Period of the pool housekeeping tick.
    #[serde(with = "duration_ms")]
    pub housekeeping_interval: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            timers: TimerProfile::default(),
            enable_ict_forking: false,
            ist_block_duration: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(5),
        }
    }
}

impl FsmConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: FsmConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timers.validate()?;
        if self.housekeeping_interval.is_zero() {
            return Err(Error::Config("housekeeping_interval must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn with_forking(mut self, enabled: bool) -> Self {
        self.enable_ict_forking = enabled;
        self
    }

    pub fn with_timers(mut self, timers: TimerProfile) -> Self {
        self.timers = timers;
        self
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
