use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::timer::TimerName;

/// RFC 3261 timer durations used by one transaction.
///
/// A transaction copies the profile of its pool when it is created, so changing a
/// pool's profile only affects transactions created afterwards. Values for timers
/// D, I, J and K describe unreliable transports; the state machines never arm
/// those timers over reliable transports, which is the "0 for reliable" rule of
/// RFC 3261 Table 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerProfile {
    /// RTT estimate (500 ms).
    #[serde(with = "duration_ms")]
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests and INVITE responses (4 s).
    #[serde(with = "duration_ms")]
    pub t2: Duration,
    /// Maximum duration a message remains in the network (5 s).
    #[serde(with = "duration_ms")]
    pub t4: Duration,
    #[serde(with = "duration_ms")]
    pub timer_a: Duration,
    #[serde(with = "duration_ms")]
    pub timer_b: Duration,
    #[serde(with = "duration_ms")]
    pub timer_c: Duration,
    #[serde(with = "duration_ms")]
    pub timer_d: Duration,
    #[serde(with = "duration_ms")]
    pub timer_e: Duration,
    #[serde(with = "duration_ms")]
    pub timer_f: Duration,
    #[serde(with = "duration_ms")]
    pub timer_g: Duration,
    #[serde(with = "duration_ms")]
    pub timer_h: Duration,
    #[serde(with = "duration_ms")]
    pub timer_i: Duration,
    #[serde(with = "duration_ms")]
    pub timer_j: Duration,
    #[serde(with = "duration_ms")]
    pub timer_k: Duration,
    /// How long a client INVITE may sit in PROCEEDING waiting for a final response.
    #[serde(with = "duration_ms")]
    pub ict_provisional_guard: Duration,
    /// How long a client INVITE may wait for the final response overall.
    #[serde(with = "duration_ms")]
    pub ict_final_guard: Duration,
    /// Hard cap on any transaction's lifetime.
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
}

impl Default for TimerProfile {
    fn default() -> Self {
        Self::from_base(
            Duration::from_millis(500),
            Duration::from_secs(4),
            Duration::from_secs(5),
        )
    }
}

impl TimerProfile {
    /// Derives every timer from T1, T2 and T4 the way RFC 3261 Table 4 does.
    pub fn from_base(t1: Duration, t2: Duration, t4: Duration) -> Self {
        let timer_b = t1 * 64;
        Self {
            t1,
            t2,
            t4,
            timer_a: t1,
            timer_b,
            timer_c: Duration::from_secs(181),
            timer_d: Duration::from_secs(33),
            timer_e: t1,
            timer_f: t1 * 64,
            timer_g: t1,
            timer_h: t1 * 64,
            timer_i: t4,
            timer_j: t1 * 64,
            timer_k: t4,
            ict_provisional_guard: timer_b,
            ict_final_guard: timer_b * 2,
            max_lifetime: Duration::from_secs(300),
        }
    }

    /// Duration configured for the named timer.
    pub fn duration(&self, name: TimerName) -> Duration {
        match name {
            TimerName::A => self.timer_a,
            TimerName::B => self.timer_b,
            TimerName::C => self.timer_c,
            TimerName::D => self.timer_d,
            TimerName::E => self.timer_e,
            TimerName::F => self.timer_f,
            TimerName::G => self.timer_g,
            TimerName::H => self.timer_h,
            TimerName::I => self.timer_i,
            TimerName::J => self.timer_j,
            TimerName::K => self.timer_k,
            TimerName::MaxLifetime => self.max_lifetime,
            // Always armed with the delay chosen by the throttle handler.
            TimerName::RequestThrottle => Duration::ZERO,
        }
    }

    pub fn set_duration(&mut self, name: TimerName, value: Duration) {
        match name {
            TimerName::A => self.timer_a = value,
            TimerName::B => self.timer_b = value,
            TimerName::C => self.timer_c = value,
            TimerName::D => self.timer_d = value,
            TimerName::E => self.timer_e = value,
            TimerName::F => self.timer_f = value,
            TimerName::G => self.timer_g = value,
            TimerName::H => self.timer_h = value,
            TimerName::I => self.timer_i = value,
            TimerName::J => self.timer_j = value,
            TimerName::K => self.timer_k = value,
            TimerName::MaxLifetime => self.max_lifetime = value,
            TimerName::RequestThrottle => {}
        }
    }

    /// Base retransmission interval for a request with an overall transaction
    /// timeout: the timeout divided by 64, in whole milliseconds.
    ///
    /// Returns `None` when no timeout is set or it is too small.
    pub fn base_for_transaction_timeout(timeout: Option<Duration>) -> Option<Duration> {
        let base = u64::try_from(timeout?.as_millis() / 64).ok()?;
        (base > 0).then(|| Duration::from_millis(base))
    }

    /// Next retransmission interval: double the current one without exceeding T2.
    ///
    /// A base interval already above T2 (set through `transaction-timeout`) is kept.
    pub fn backoff(&self, current: Duration, base: Duration) -> Duration {
        let cap = self.t2.max(base);
        (current * 2).min(cap)
    }

    pub fn validate(&self) -> Result<()> {
        if self.t1.is_zero() {
            return Err(Error::Config("T1 must be greater than zero".into()));
        }
        if self.t2 < self.t1 {
            return Err(Error::Config(format!(
                "T2 ({:?}) must not be shorter than T1 ({:?})",
                self.t2, self.t1
            )));
        }
        if self.max_lifetime.is_zero() {
            return Err(Error::Config("max_lifetime must be greater than zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rfc_defaults() {
        let p = TimerProfile::default();
        assert_eq!(p.timer_a, Duration::from_millis(500));
        assert_eq!(p.timer_b, Duration::from_secs(32));
        assert_eq!(p.timer_c, Duration::from_secs(181));
        assert_eq!(p.timer_d, Duration::from_secs(33));
        assert_eq!(p.timer_f, Duration::from_secs(32));
        assert_eq!(p.timer_h, Duration::from_secs(32));
        assert_eq!(p.timer_i, Duration::from_secs(5));
        assert_eq!(p.timer_k, Duration::from_secs(5));
        assert_eq!(p.ict_final_guard, Duration::from_secs(64));
        assert_eq!(p.max_lifetime, Duration::from_secs(300));
    }

    #[test]
    fn test_get_set_by_name() {
        let mut p = TimerProfile::default();
        p.set_duration(TimerName::G, Duration::from_millis(250));
        assert_eq!(p.duration(TimerName::G), Duration::from_millis(250));
        assert_eq!(p.timer_g, Duration::from_millis(250));
    }

    #[test]
    fn test_transaction_timeout_base() {
        assert_eq!(
            TimerProfile::base_for_transaction_timeout(Some(Duration::from_millis(6400))),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            TimerProfile::base_for_transaction_timeout(Some(Duration::from_millis(10))),
            None
        );
        assert_eq!(TimerProfile::base_for_transaction_timeout(None), None);
    }

    #[test]
    fn test_backoff_caps_at_t2() {
        let p = TimerProfile::default();
        let base = p.timer_a;
        let mut interval = base;
        let mut seen = vec![interval];
        for _ in 0..5 {
            interval = p.backoff(interval, base);
            seen.push(interval);
        }
        let ms: Vec<u128> = seen.iter().map(Duration::as_millis).collect();
        assert_eq!(ms, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn test_validate() {
        let mut p = TimerProfile::default();
        assert!(p.validate().is_ok());
        p.t2 = Duration::from_millis(100);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_serde_in_millis() {
        let json = serde_json::to_value(TimerProfile::default()).unwrap();
        assert_eq!(json["t1"], 500);
        assert_eq!(json["timer_b"], 32000);
        let parsed: TimerProfile = serde_json::from_str(r#"{"t1": 200}"#).unwrap();
        assert_eq!(parsed.t1, Duration::from_millis(200));
        assert_eq!(parsed.t2, Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn backoff_doubles_until_capped(
            t1_ms in 1u64..2_000,
            t2_factor in 1u64..16,
            base_factor in 1u64..200,
            steps in 1usize..12,
        ) {
            let t1 = Duration::from_millis(t1_ms);
            let profile = TimerProfile::from_base(t1, t1 * t2_factor as u32, Duration::from_secs(5));
            let base = Duration::from_millis(t1_ms * base_factor / 8 + 1);
            let cap = profile.t2.max(base);

            let mut interval = base;
            for _ in 0..steps {
                let next = profile.backoff(interval, base);
                prop_assert!(next <= cap);
                prop_assert!(next >= interval);
                if interval * 2 <= cap {
                    prop_assert_eq!(next, interval * 2);
                } else {
                    prop_assert_eq!(next, cap);
                }
                interval = next;
            }
        }
    }
}
