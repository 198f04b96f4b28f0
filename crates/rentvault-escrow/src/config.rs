//! Engine configuration.
//!
//! Defaults suit tests and the CLI. Override via environment variables or
//! explicit construction.

use std::time::Duration;

use crate::escrow::EscrowConfig;

/// Bounded retry of optimistic-concurrency conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up with `ConcurrentModification`.
    pub max_attempts: u32,
    /// Backoff after the first conflict; doubles per attempt.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th conflict (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Configuration for an [`EscrowEngine`](crate::EscrowEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Conflict retry.
    pub retry: RetryPolicy,
    /// Deadlines handled per sweep pass.
    pub sweep_batch_limit: usize,
    /// Windows for escrows created without explicit config.
    pub escrow_defaults: EscrowConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sweep_batch_limit: 500,
            escrow_defaults: EscrowConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables (all optional):
    /// - `RENTVAULT_MAX_ATTEMPTS` (default: 5)
    /// - `RENTVAULT_BACKOFF_MS` (default: 2)
    /// - `RENTVAULT_MAX_BACKOFF_MS` (default: 50)
    /// - `RENTVAULT_SWEEP_BATCH` (default: 500)
    /// - `RENTVAULT_CLAIM_WINDOW_DAYS` (default: 14)
    /// - `RENTVAULT_RESPONSE_WINDOW_DAYS` (default: 7)
    /// - `RENTVAULT_AUTO_RELEASE_DAYS` (default: 0)
    /// - `RENTVAULT_SETTLEMENT_ROUNDS` (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts: u32 = parse_var(&lookup, "RENTVAULT_MAX_ATTEMPTS")?
            .unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                var: "RENTVAULT_MAX_ATTEMPTS",
                reason: "at least one attempt is required",
            });
        }
        let base_backoff = parse_var(&lookup, "RENTVAULT_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_backoff);
        let max_backoff = parse_var(&lookup, "RENTVAULT_MAX_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.max_backoff);
        if max_backoff < base_backoff {
            return Err(ConfigError::OutOfRange {
                var: "RENTVAULT_MAX_BACKOFF_MS",
                reason: "must not be below RENTVAULT_BACKOFF_MS",
            });
        }
        let sweep_batch_limit: usize = parse_var(&lookup, "RENTVAULT_SWEEP_BATCH")?
            .unwrap_or(defaults.sweep_batch_limit);
        if sweep_batch_limit == 0 {
            return Err(ConfigError::OutOfRange {
                var: "RENTVAULT_SWEEP_BATCH",
                reason: "must be positive",
            });
        }

        let d = defaults.escrow_defaults;
        let escrow_defaults = EscrowConfig {
            claim_window_days: parse_var(&lookup, "RENTVAULT_CLAIM_WINDOW_DAYS")?
                .unwrap_or(d.claim_window_days),
            response_window_days: parse_var(&lookup, "RENTVAULT_RESPONSE_WINDOW_DAYS")?
                .unwrap_or(d.response_window_days),
            auto_release_days: parse_var(&lookup, "RENTVAULT_AUTO_RELEASE_DAYS")?
                .unwrap_or(d.auto_release_days),
            settlement_rounds: parse_var(&lookup, "RENTVAULT_SETTLEMENT_ROUNDS")?
                .unwrap_or(d.settlement_rounds),
        };
        escrow_defaults
            .validate()
            .map_err(|e| ConfigError::InvalidEscrowDefaults(e.to_string()))?;

        Ok(Self {
            retry: RetryPolicy {
                max_attempts,
                base_backoff,
                max_backoff,
            },
            sweep_batch_limit,
            escrow_defaults,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { var, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Not a number.
    #[error("{var} is not a valid number: {value:?}")]
    Malformed {
        /// The variable.
        var: &'static str,
        /// Its raw value.
        value: String,
    },
    /// A number outside its permitted range.
    #[error("{var}: {reason}")]
    OutOfRange {
        /// The variable.
        var: &'static str,
        /// Why.
        reason: &'static str,
    },
    /// Escrow window defaults rejected by validation.
    #[error("invalid escrow defaults: {0}")]
    InvalidEscrowDefaults(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(
            EngineConfig::from_lookup(lookup(&[])).unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn overrides_apply() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("RENTVAULT_MAX_ATTEMPTS", "9"),
            ("RENTVAULT_CLAIM_WINDOW_DAYS", " 21 "),
            ("RENTVAULT_SWEEP_BATCH", "10"),
        ]))
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 9);
        assert_eq!(cfg.escrow_defaults.claim_window_days, 21);
        assert_eq!(cfg.sweep_batch_limit, 10);
    }

    #[test]
    fn malformed_values_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("RENTVAULT_BACKOFF_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Malformed {
                var: "RENTVAULT_BACKOFF_MS",
                ..
            }
        ));
        let err = EngineConfig::from_lookup(lookup(&[("RENTVAULT_CLAIM_WINDOW_DAYS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEscrowDefaults(_)));
        let err =
            EngineConfig::from_lookup(lookup(&[("RENTVAULT_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(4),
            max_backoff: Duration::from_millis(20),
        };
        assert_eq!(p.backoff_for(1), Duration::from_millis(4));
        assert_eq!(p.backoff_for(2), Duration::from_millis(8));
        assert_eq!(p.backoff_for(3), Duration::from_millis(16));
        assert_eq!(p.backoff_for(4), Duration::from_millis(20));
        assert_eq!(p.backoff_for(40), Duration::from_millis(20));
    }
}
