// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Lookahead, Result};
use serde::Deserialize;
use std::time::Duration;

/// Initial properties of a federate. Anything wrong here is a
/// `Error::Configuration`, raised when the federate is built and never later.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Lookahead the federate joins with.
    pub initial_lookahead: f64,
    /// Inbound queue depth past which a warning is logged. Never a limit.
    pub queue_warning_threshold: usize,
    /// How long `Federate::run` waits for traffic before re-checking its
    /// stop flag.
    pub poll_interval_ms: u64,
    /// Whether the federate joins with its timestamps holding back LBTS.
    pub time_regulating: bool,
    /// Whether the federate joins receiving timestamped messages in
    /// time-stamp order.
    pub time_constrained: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_lookahead: 1.0,
            queue_warning_threshold: 1024,
            poll_interval_ms: 10,
            time_regulating: true,
            time_constrained: true,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.lookahead()?;
        if self.queue_warning_threshold == 0 {
            return Err(Error::Configuration(
                "queue_warning_threshold must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Configuration("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn lookahead(&self) -> Result<Lookahead> {
        Lookahead::new(self.initial_lookahead).map_err(|e| {
            Error::Configuration(format!("initial_lookahead: {}", e))
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let cfg = Config::from_toml_str("initial_lookahead = 2.5\n").unwrap();
        assert_eq!(cfg.initial_lookahead, 2.5);
        assert_eq!(cfg.queue_warning_threshold, 1024);
    }

    #[test]
    fn rejects_bad_properties() {
        assert!(matches!(
            Config::from_toml_str("initial_lookahead = -1.0"),
            Err(Error::Configuration(_))
        ));
        assert!(Config::from_toml_str("queue_warning_threshold = 0").is_err());
        assert!(Config::from_toml_str("no_such_key = 1").is_err());
    }

    #[test]
    fn time_switches_default_on() {
        let cfg = Config::from_toml_str("time_constrained = false\n").unwrap();
        assert!(cfg.time_regulating);
        assert!(!cfg.time_constrained);
        assert!(Config::from_toml_str("time_regulating = 1").is_err());
    }
}
