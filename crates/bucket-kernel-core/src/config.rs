use serde::{Deserialize, Serialize};

use crate::hash_chain::StageKind;

pub const DEFAULT_ASSIGNMENT_KEY: &str = "ab_bucket";
pub const DEFAULT_MANUAL_OVERRIDE_KEY: &str = "ab_bucket_manual";
pub const DEFAULT_MANUAL_MARKER: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssignerConfig {
    pub assignment_key: String,
    pub manual_override_key: String,
    /// Literal value stored under `manual_override_key` when an override is active.
    pub manual_marker: String,
    /// Hash stages replaced with always-failing placeholders.
    pub disabled_stages: Vec<StageKind>,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            assignment_key: DEFAULT_ASSIGNMENT_KEY.to_string(),
            manual_override_key: DEFAULT_MANUAL_OVERRIDE_KEY.to_string(),
            manual_marker: DEFAULT_MANUAL_MARKER.to_string(),
            disabled_stages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn partial_config_json_falls_back_to_defaults() {
        let config: AssignerConfig = match serde_json::from_str(
            r#"{"assignment_key":"exp_group","disabled_stages":["sha256"]}"#,
        ) {
            Ok(config) => config,
            Err(err) => panic!("config should deserialize: {err}"),
        };

        assert_eq!(config.assignment_key, "exp_group");
        assert_eq!(config.manual_override_key, DEFAULT_MANUAL_OVERRIDE_KEY);
        assert_eq!(config.manual_marker, DEFAULT_MANUAL_MARKER);
        assert_eq!(config.disabled_stages, vec![StageKind::Sha256]);
    }
}
