use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::StorylineError;
use crate::types::{normalize_token, SignalType};

/// TOML-backed clustering tunables, loaded once per process.
/// Secrets (DB URL) stay as env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusteringConfig {
    /// Member count at which a forming topic freezes its anchor.
    #[serde(default = "default_anchor_lock_threshold")]
    pub anchor_lock_threshold: u32,
    /// Minimum normalized score for a topic to be a join candidate.
    #[serde(default = "default_join_threshold")]
    pub join_threshold: f64,
    /// Tokens outside `high_freq_persons` a headline needs to seed a topic.
    #[serde(default = "default_min_distinctive_tokens")]
    pub min_distinctive_tokens: usize,
    pub track_weights: BTreeMap<String, TrackWeights>,
    #[serde(default)]
    pub high_freq_persons: BTreeSet<String>,
    #[serde(default = "default_discriminators")]
    pub discriminators: Vec<DiscriminatorRule>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Per-track weight table. Every signal type must be present.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackWeights {
    pub persons: f64,
    pub orgs: f64,
    pub places: f64,
    pub commodities: f64,
    pub policies: f64,
    pub systems: f64,
    pub named_events: f64,
}

impl TrackWeights {
    pub fn weight(&self, signal_type: SignalType) -> f64 {
        match signal_type {
            SignalType::Persons => self.persons,
            SignalType::Orgs => self.orgs,
            SignalType::Places => self.places,
            SignalType::Commodities => self.commodities,
            SignalType::Policies => self.policies,
            SignalType::Systems => self.systems,
            SignalType::NamedEvents => self.named_events,
        }
    }

    /// Equal weight on every type.
    pub fn uniform(weight: f64) -> Self {
        Self {
            persons: weight,
            orgs: weight,
            places: weight,
            commodities: weight,
            policies: weight,
            systems: weight,
            named_events: weight,
        }
    }
}

/// One configured veto rule, applied in file order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case", deny_unknown_fields)]
pub enum DiscriminatorRule {
    GenericSignalDominance {
        #[serde(default = "default_max_generic_share")]
        max_share: f64,
    },
    GeographicConflict,
    NamedEventConflict,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_partitions: default_max_concurrent_partitions(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_anchor_lock_threshold() -> u32 {
    5
}

fn default_join_threshold() -> f64 {
    0.2
}

fn default_min_distinctive_tokens() -> usize {
    1
}

fn default_max_generic_share() -> f64 {
    0.5
}

fn default_discriminators() -> Vec<DiscriminatorRule> {
    vec![
        DiscriminatorRule::GenericSignalDominance {
            max_share: default_max_generic_share(),
        },
        DiscriminatorRule::GeographicConflict,
    ]
}

fn default_max_concurrent_partitions() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    900
}

impl ClusteringConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, StorylineError> {
        let config: ClusteringConfig = toml::from_str(content)
            .map_err(|e| StorylineError::Config(format!("invalid clustering config: {e}")))?;
        config.finalize()
    }

    /// Weight table for a track, if configured.
    pub fn weights_for(&self, track: &str) -> Option<&TrackWeights> {
        self.track_weights.get(track)
    }

    pub fn is_high_freq_person(&self, token: &str) -> bool {
        self.high_freq_persons.contains(token)
    }

    /// Normalize list entries and reject values the engine cannot use.
    fn finalize(mut self) -> Result<Self, StorylineError> {
        self.high_freq_persons = self
            .high_freq_persons
            .iter()
            .filter_map(|p| normalize_token(p))
            .collect();

        if self.anchor_lock_threshold == 0 {
            return Err(StorylineError::Config(
                "anchor_lock_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.join_threshold) {
            return Err(StorylineError::Config(format!(
                "join_threshold must be within [0, 1], got {}",
                self.join_threshold
            )));
        }
        if self.track_weights.is_empty() {
            return Err(StorylineError::Config(
                "track_weights must configure at least one track".into(),
            ));
        }
        for (track, weights) in &self.track_weights {
            for signal_type in SignalType::ALL {
                let w = weights.weight(signal_type);
                if !w.is_finite() || w < 0.0 {
                    return Err(StorylineError::Config(format!(
                        "track_weights.{track}.{signal_type} must be a non-negative number, got {w}"
                    )));
                }
            }
        }
        for rule in &self.discriminators {
            if let DiscriminatorRule::GenericSignalDominance { max_share } = rule {
                if !(*max_share > 0.0 && *max_share <= 1.0) {
                    return Err(StorylineError::Config(format!(
                        "generic_signal_dominance.max_share must be within (0, 1], got {max_share}"
                    )));
                }
            }
        }
        if self.scheduler.max_concurrent_partitions == 0 {
            return Err(StorylineError::Config(
                "scheduler.max_concurrent_partitions must be at least 1".into(),
            ));
        }
        Ok(self)
    }
}

/// Load and validate the clustering config file.
pub fn load_config(path: &Path) -> Result<ClusteringConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = ClusteringConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to load config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        high_freq_persons = ["Donald  Trump ", "xi\tjinping", "  "]

        [track_weights.geo_economy]
        persons = 0.5
        orgs = 2.0
        places = 0.5
        commodities = 2.0
        policies = 2.0
        systems = 1.0
        named_events = 1.0
    "#;

    #[test]
    fn defaults_fill_unspecified_tunables() {
        let config = ClusteringConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.anchor_lock_threshold, 5);
        assert_eq!(config.join_threshold, 0.2);
        assert_eq!(config.min_distinctive_tokens, 1);
        assert_eq!(config.discriminators.len(), 2);
        assert_eq!(config.scheduler.max_concurrent_partitions, 4);
        assert_eq!(config.weights_for("geo_economy").unwrap().orgs, 2.0);
        assert!(config.weights_for("geo_security").is_none());
    }

    #[test]
    fn high_freq_persons_are_normalized() {
        let config = ClusteringConfig::from_toml_str(MINIMAL).unwrap();
        assert!(config.is_high_freq_person("donald trump"));
        assert!(config.is_high_freq_person("xi jinping"));
        assert_eq!(config.high_freq_persons.len(), 2);
    }

    #[test]
    fn misspelled_discriminator_option_is_rejected() {
        let content = format!(
            "{MINIMAL}\n[[discriminators]]\nrule = \"generic_signal_dominance\"\nmax_shar = 0.6\n"
        );
        assert!(ClusteringConfig::from_toml_str(&content).is_err());

        let content = format!(
            "{MINIMAL}\n[[discriminators]]\nrule = \"generic_signal_dominance\"\nmax_share = 0.6\n"
        );
        let config = ClusteringConfig::from_toml_str(&content).unwrap();
        assert_eq!(
            config.discriminators,
            vec![DiscriminatorRule::GenericSignalDominance { max_share: 0.6 }]
        );
    }

    #[test]
    fn missing_signal_type_in_weight_table_is_rejected() {
        let err = ClusteringConfig::from_toml_str(
            r#"
            [track_weights.geo_security]
            persons = 1.0
            orgs = 1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, StorylineError::Config(_)));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let content = format!("join_threshold = 1.5\n{MINIMAL}");
        assert!(ClusteringConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn discriminator_rules_parse_in_order() {
        let content = format!(
            r#"
            {MINIMAL}
            [[discriminators]]
            rule = "geographic_conflict"

            [[discriminators]]
            rule = "generic_signal_dominance"
            max_share = 0.6

            [[discriminators]]
            rule = "named_event_conflict"
            "#
        );
        let config = ClusteringConfig::from_toml_str(&content).unwrap();
        assert_eq!(
            config.discriminators,
            vec![
                DiscriminatorRule::GeographicConflict,
                DiscriminatorRule::GenericSignalDominance { max_share: 0.6 },
                DiscriminatorRule::NamedEventConflict,
            ]
        );
    }
}
