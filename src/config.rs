//! Engine configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on branchall branches in flight at once per node.
    pub max_parallel_branches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_branches: 16,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse engine config")?;
        Ok(config.normalized())
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Set the branch concurrency limit.
    pub fn with_max_parallel_branches(mut self, limit: usize) -> Self {
        self.max_parallel_branches = limit;
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.max_parallel_branches = self.max_parallel_branches.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(EngineConfig::default().max_parallel_branches, 16);
        assert_eq!(EngineConfig::from_yaml("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_limit_clamped() {
        let config = EngineConfig::from_yaml("max_parallel_branches: 0").unwrap();
        assert_eq!(config.max_parallel_branches, 1);
        assert_eq!(
            EngineConfig::default()
                .with_max_parallel_branches(4)
                .max_parallel_branches,
            4
        );
    }

    #[test]
    fn test_invalid_yaml() {
        let err = EngineConfig::from_yaml("max_parallel_branches: lots").unwrap_err();
        assert!(err.to_string().contains("engine config"));
    }
}
