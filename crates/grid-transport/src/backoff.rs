//! Delay between dial attempts of one connection

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Pause before the redial that follows `failures` failed dials in a row
pub fn redial_delay(config: &ReconnectConfig, failures: u32) -> Duration {
    let factor = config.multiplier.max(1.0).powi(failures.min(64) as i32);
    let millis = config.initial_backoff.as_millis() as f64 * factor;
    if !millis.is_finite() || millis >= config.max_backoff.as_millis() as f64 {
        return config.max_backoff;
    }
    Duration::from_millis(millis as u64).min(config.max_backoff)
}

/// Failed dials since the last established link
#[derive(Debug, Default)]
pub(crate) struct DialFailures(u32);

impl DialFailures {
    /// Number of the dial about to be made, from 1
    pub(crate) fn next_dial(&self) -> u32 {
        self.0.saturating_add(1)
    }

    pub(crate) fn record(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }

    pub(crate) fn delay(&self, config: &ReconnectConfig) -> Duration {
        redial_delay(config, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let config = config();
        let delays: Vec<u64> = (0..6)
            .map(|failures| redial_delay(&config, failures).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
        assert_eq!(redial_delay(&config, u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplier_below_one_holds_initial() {
        let config = ReconnectConfig {
            multiplier: 0.5,
            ..config()
        };
        assert_eq!(redial_delay(&config, 3), Duration::from_millis(10));
    }

    #[test]
    fn test_failures_cleared_by_link() {
        let config = config();
        let mut failures = DialFailures::default();
        assert_eq!(failures.next_dial(), 1);

        failures.record();
        failures.record();
        assert_eq!(failures.next_dial(), 3);
        assert_eq!(failures.delay(&config), Duration::from_millis(40));

        failures.clear();
        assert_eq!(failures.delay(&config), Duration::from_millis(10));
    }
}
