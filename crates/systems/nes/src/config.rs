//! Machine configuration: CPU/PPU clock ratio and log settings.

use nesboy_core::logging::LogSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// NTSC hardware runs three PPU dots per CPU cycle.
pub const NTSC_DOTS_PER_CPU_CYCLE: u32 = 3;

/// How many PPU dots to run after each CPU step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockRatio {
    /// `n` dots for every CPU cycle consumed
    PerCpuCycle(u32),
    /// A fixed `n` dots per instruction, regardless of its cycle count
    PerInstruction(u32),
}

impl Default for ClockRatio {
    fn default() -> Self {
        ClockRatio::PerCpuCycle(NTSC_DOTS_PER_CPU_CYCLE)
    }
}

impl ClockRatio {
    pub fn ppu_ticks(self, cpu_cycles: u32) -> u32 {
        match self {
            ClockRatio::PerCpuCycle(n) => cpu_cycles.saturating_mul(n),
            ClockRatio::PerInstruction(n) => n,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub clock: ClockRatio,
    pub log: LogSettings,
}

impl MachineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nesboy_core::logging::{LogCategory, LogLevel};

    #[test]
    fn default_is_hardware_ratio() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.clock, ClockRatio::PerCpuCycle(3));
        assert_eq!(cfg.clock.ppu_ticks(7), 21);
        assert_eq!(cfg.log, LogSettings::default());
    }

    #[test]
    fn per_instruction_ignores_cycle_count() {
        let ratio = ClockRatio::PerInstruction(1);
        assert_eq!(ratio.ppu_ticks(2), 1);
        assert_eq!(ratio.ppu_ticks(7), 1);
    }

    #[test]
    fn parses_partial_json() {
        let cfg = MachineConfig::from_json_str(r#"{ "clock": { "per_instruction": 1 } }"#)
            .expect("valid config");
        assert_eq!(cfg.clock, ClockRatio::PerInstruction(1));
        assert_eq!(cfg.log, LogSettings::default());

        let cfg = MachineConfig::from_json_str("{}").expect("empty config");
        assert_eq!(cfg, MachineConfig::default());
    }

    #[test]
    fn parses_log_section() {
        let cfg = MachineConfig::from_json_str(
            r#"{
                "clock": { "per_cpu_cycle": 3 },
                "log": { "level": "info", "categories": { "cpu": "trace" }, "rate_limit": 0 }
            }"#,
        )
        .expect("valid config");
        assert_eq!(cfg.log.level(LogCategory::Cpu), LogLevel::Trace);
        assert_eq!(cfg.log.level, LogLevel::Info);
        assert!(cfg.log.should_log(LogCategory::Ppu, LogLevel::Info));
        assert!(!cfg.log.should_log(LogCategory::Ppu, LogLevel::Debug));
        assert_eq!(cfg.log.rate_limit, 0);
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = MachineConfig::default();
        cfg.clock = ClockRatio::PerInstruction(2);
        let text = serde_json::to_string(&cfg).expect("serialize");
        assert_eq!(MachineConfig::from_json_str(&text).expect("parse"), cfg);
    }

    #[test]
    fn reports_bad_input() {
        assert!(matches!(
            MachineConfig::from_json_str(r#"{ "clock": "fast" }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            MachineConfig::from_file("/nonexistent/nesboy.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
