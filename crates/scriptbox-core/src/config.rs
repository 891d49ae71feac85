//! Engine configuration that downstream crates can serialize/deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Smallest arena an engine may be built with (after page rounding).
pub const CAPACITY_MIN: usize = 256 * KIB;
/// Largest arena an engine may be built with (after page rounding).
pub const CAPACITY_MAX: usize = 256 * MIB;

/// How evaluation is supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalMode {
    /// A per-call watchdog thread enforces the wall-clock ceiling and runs a
    /// native-stack-headroom check. The safe default for untrusted code.
    Monitored,
    /// Guest code runs synchronously on the caller's thread. Memory and
    /// instruction quotas still apply; intended for trusted/batch use.
    Unmonitored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard guest-heap cap in bytes; rounded up to the page size and bounded
    /// to [CAPACITY_MIN, CAPACITY_MAX]. Never grows.
    pub memory_capacity: usize,

    /// Ceiling on dispatched guest instructions over the engine's lifetime.
    pub instruction_quota: u64,

    /// Wall-clock ceiling per evaluation.
    pub time_quota: Duration,

    pub mode: EvalMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 8 * MIB,
            instruction_quota: 1_000_000,
            time_quota: Duration::from_secs(1),
            mode: EvalMode::Monitored,
        }
    }
}

impl EngineConfig {
    /// Reject quotas that could never admit any execution.
    pub fn validate(&self) -> Result<()> {
        if self.instruction_quota == 0 {
            return Err(Error::Config("instruction quota must be positive".into()));
        }
        if self.time_quota.is_zero() {
            return Err(Error::Config("time quota must be positive".into()));
        }
        Ok(())
    }

    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `SCRIPTBOX_MEMORY_BYTES`: arena capacity in bytes
    /// - `SCRIPTBOX_INSTRUCTION_QUOTA`: instruction ceiling
    /// - `SCRIPTBOX_TIME_QUOTA_MS`: wall-clock ceiling in milliseconds
    /// - `SCRIPTBOX_UNMONITORED`: any value disables the watchdog
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("SCRIPTBOX_MEMORY_BYTES") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.memory_capacity = v;
            }
        }

        if let Ok(s) = std::env::var("SCRIPTBOX_INSTRUCTION_QUOTA") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.instruction_quota = v;
            }
        }

        if let Ok(s) = std::env::var("SCRIPTBOX_TIME_QUOTA_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.time_quota = Duration::from_millis(v);
            }
        }

        if std::env::var("SCRIPTBOX_UNMONITORED").is_ok() {
            cfg.mode = EvalMode::Unmonitored;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_quotas_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.instruction_quota = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = EngineConfig::default();
        cfg.time_quota = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
