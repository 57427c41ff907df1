use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement engine configuration. Every field has a default, so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// SQLite path, or `:memory:`.
    pub database:                  String,
    /// Upper bound for one simulation oracle round trip.
    pub simulation_timeout_ms:     u64,
    /// Recorded as `decided_by` for decisions the runner issues.
    pub actor:                     String,
    /// A halt must start on the first day of the current or the next month.
    pub enforce_halt_month_window: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            database:                  ":memory:".to_string(),
            simulation_timeout_ms:     30_000,
            actor:                     "settlement-system".to_string(),
            enforce_halt_month_window: true,
        }
    }
}

impl SettlementConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: SettlementConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.simulation_timeout_ms == 0 {
            anyhow::bail!("simulation_timeout_ms must be positive");
        }
        if self.database.trim().is_empty() {
            anyhow::bail!("database must name a file or :memory:");
        }
        if self.actor.trim().is_empty() {
            anyhow::bail!("actor must not be empty");
        }
        Ok(())
    }

    pub fn simulation_timeout(&self) -> Duration {
        Duration::from_millis(self.simulation_timeout_ms)
    }

    /// Config for tests: in-memory database, no halt month window.
    pub fn default_test() -> Self {
        Self {
            enforce_halt_month_window: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SettlementConfig = serde_json::from_str(r#"{"simulation_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.simulation_timeout(), Duration::from_millis(500));
        assert_eq!(config.database, ":memory:");
        assert!(config.enforce_halt_month_window);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SettlementConfig { simulation_timeout_ms: 0, ..SettlementConfig::default() };
        assert!(config.validate().is_err());
    }
}
