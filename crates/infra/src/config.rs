//! Runtime configuration for the cycle-count service.

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`PostingConfig::max_attempts`].
pub const POSTING_MAX_ATTEMPTS_VAR: &str = "FACILITYOPS_POSTING_MAX_ATTEMPTS";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleCountConfig {
    pub posting: PostingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    /// Version conflicts tolerated per material before a posting gives up.
    pub max_attempts: u32,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl CycleCountConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`CycleCountConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(POSTING_MAX_ATTEMPTS_VAR) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.posting.max_attempts = n,
                _ => tracing::warn!(
                    value = %raw,
                    default = config.posting.max_attempts,
                    "{POSTING_MAX_ATTEMPTS_VAR} must be a positive integer; using default"
                ),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = CycleCountConfig::from_lookup(|_| None);
        assert_eq!(config.posting.max_attempts, 3);
    }

    #[test]
    fn reads_max_attempts_override() {
        let config = CycleCountConfig::from_lookup(|key| {
            (key == POSTING_MAX_ATTEMPTS_VAR).then(|| " 5 ".to_string())
        });
        assert_eq!(config.posting.max_attempts, 5);
    }

    #[test]
    fn invalid_values_fall_back_to_default() {
        for raw in ["0", "-1", "many"] {
            let config = CycleCountConfig::from_lookup(|_| Some(raw.to_string()));
            assert_eq!(config.posting.max_attempts, 3, "value {raw:?}");
        }
    }

    #[test]
    fn deserializes_partial_config() {
        let config: CycleCountConfig = serde_json::from_str(r#"{"posting":{}}"#).unwrap();
        assert_eq!(config, CycleCountConfig::default());
    }
}
