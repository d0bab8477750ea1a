use std::time::Duration;

use crate::error::{ElectionError, Result};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_RELEASE_COOLDOWN_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Name this process writes into the `leader` column when it wins.
    pub identity: String,
    /// Period between election ticks; the lease is measured in these.
    pub tick_period: Duration,
    /// How long a leader may go without a heartbeat before peers call it dead.
    /// Must be an integer multiple of, and at least twice, the tick period.
    pub lease_duration: Duration,
    /// After a voluntary release, abstain for this many leases worth of ticks.
    pub release_cooldown_multiplier: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            tick_period: DEFAULT_TICK_PERIOD,
            lease_duration: DEFAULT_LEASE_DURATION,
            release_cooldown_multiplier: DEFAULT_RELEASE_COOLDOWN_MULTIPLIER,
        }
    }
}

impl ElectionConfig {
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(ElectionError::InvalidConfig(
                "identity must not be empty".to_string(),
            ));
        }

        let tick = self.tick_period.as_millis();
        let lease = self.lease_duration.as_millis();

        if tick == 0 {
            return Err(ElectionError::InvalidConfig(
                "tick period must be at least 1ms".to_string(),
            ));
        }
        if lease < tick * 2 {
            return Err(ElectionError::InvalidConfig(format!(
                "lease duration ({lease}ms) must be at least twice the tick period ({tick}ms)"
            )));
        }
        if lease % tick != 0 {
            return Err(ElectionError::InvalidConfig(format!(
                "lease duration ({lease}ms) must be a multiple of the tick period ({tick}ms)"
            )));
        }
        if self.release_cooldown_multiplier == 0 {
            return Err(ElectionError::InvalidConfig(
                "release cooldown multiplier must be positive".to_string(),
            ));
        }
        let lease_ticks = u32::try_from(lease / tick).map_err(|_| {
            ElectionError::InvalidConfig(format!(
                "lease duration ({lease}ms) spans too many ticks of {tick}ms"
            ))
        })?;
        if lease_ticks
            .checked_mul(self.release_cooldown_multiplier)
            .is_none()
        {
            return Err(ElectionError::InvalidConfig(format!(
                "release cooldown of {} leases overflows the tick counter",
                self.release_cooldown_multiplier
            )));
        }

        Ok(())
    }

    /// Number of ticks that fit in one lease.
    pub fn lease_ticks(&self) -> u32 {
        let tick = self.tick_period.as_millis().max(1);
        u32::try_from(self.lease_duration.as_millis() / tick).unwrap_or(u32::MAX)
    }

    /// Saturates for configs that `validate` would reject.
    pub fn release_tick_limit(&self) -> u32 {
        self.lease_ticks()
            .saturating_mul(self.release_cooldown_multiplier)
    }
}

fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
