use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of "now" for heartbeat bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A record that was never heartbeated counts as expired.
pub fn lease_expired(
    modified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lease: Duration,
) -> bool {
    match modified_at {
        None => true,
        Some(modified_at) => {
            let elapsed = now.timestamp_millis() - modified_at.timestamp_millis();
            elapsed > lease.as_millis() as i64
        }
    }
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
pub(crate) use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::Clock;

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub(crate) struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                now: Mutex::new(super::from_millis(1_700_000_000_000)),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now = *now + chrono::Duration::milliseconds(by.as_millis() as i64);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_heartbeated_is_expired() {
        assert!(lease_expired(None, Utc::now(), Duration::from_secs(10)));
    }

    #[test]
    fn expiry_is_strictly_greater_than_lease() {
        let clock = ManualClock::new();
        let heartbeat = clock.now();
        let lease = Duration::from_secs(10);

        clock.advance(lease);
        assert!(!lease_expired(Some(heartbeat), clock.now(), lease));

        clock.advance(Duration::from_millis(1));
        assert!(lease_expired(Some(heartbeat), clock.now(), lease));
    }
}
