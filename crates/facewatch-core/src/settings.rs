//! Runtime engine settings read through a [`SettingsProvider`].

use chrono::Duration;
use serde::Serialize;

use crate::provider::{ProviderError, SettingsProvider};

// -- Setting names ----------------------------------------------------------

pub const RECOGNITION_THRESHOLD: &str = "recognition_threshold";
pub const DUPLICATE_THRESHOLD: &str = "duplicate_threshold";
pub const ALERT_COOLDOWN_SECONDS: &str = "alert_cooldown_seconds";
pub const DWELL_THRESHOLD_SECONDS: &str = "dwell_threshold_seconds";
pub const MIN_CONFIDENCE: &str = "min_confidence";
pub const CLEAR_UNKNOWN_MARGIN: &str = "clear_unknown_margin";
pub const RECOGNIZED_SAMPLE_EVERY: &str = "recognized_sample_every";
pub const MATCH_AMBIGUITY_GAP: &str = "match_ambiguity_gap";

/// Definition of one recognised setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub name: &'static str,
    pub default: &'static str,
    pub min: f64,
    pub max: f64,
    /// Whole numbers only.
    pub integer: bool,
    pub description: &'static str,
}

pub const SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        name: RECOGNITION_THRESHOLD,
        default: "0.45",
        min: 0.1,
        max: 1.0,
        integer: false,
        description: "Maximum face distance accepted as a match",
    },
    SettingSpec {
        name: DUPLICATE_THRESHOLD,
        default: "0.4",
        min: 0.1,
        max: 1.0,
        integer: false,
        description: "Distance below which a new registration is a duplicate",
    },
    SettingSpec {
        name: ALERT_COOLDOWN_SECONDS,
        default: "5.0",
        min: 0.0,
        max: 3600.0,
        integer: false,
        description: "Minimum seconds between unknown alerts for one area",
    },
    SettingSpec {
        name: DWELL_THRESHOLD_SECONDS,
        default: "1.0",
        min: 0.0,
        max: 60.0,
        integer: false,
        description: "Seconds an unknown face must stay before alerting",
    },
    SettingSpec {
        name: MIN_CONFIDENCE,
        default: "0.5",
        min: 0.0,
        max: 1.0,
        integer: false,
        description: "Minimum confidence for a match",
    },
    SettingSpec {
        name: CLEAR_UNKNOWN_MARGIN,
        default: "0.1",
        min: 0.0,
        max: 1.0,
        integer: false,
        description: "Distance above the threshold that marks a face clearly unknown",
    },
    SettingSpec {
        name: RECOGNIZED_SAMPLE_EVERY,
        default: "150",
        min: 1.0,
        max: 100_000.0,
        integer: true,
        description: "Log recognised faces on every Nth frame",
    },
    SettingSpec {
        name: MATCH_AMBIGUITY_GAP,
        default: "0.0",
        min: 0.0,
        max: 1.0,
        integer: false,
        description: "Reject matches whose runner-up is closer than this (0 disables)",
    },
];

pub fn setting_spec(name: &str) -> Option<&'static SettingSpec> {
    SETTINGS.iter().find(|spec| spec.name == name)
}

/// Parse and range-check a raw value for `name`.
pub fn validate_setting(name: &str, value: &str) -> Result<f64, ProviderError> {
    let invalid = |reason: String| ProviderError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason,
    };

    let spec = setting_spec(name).ok_or_else(|| invalid("unknown setting".to_string()))?;
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| invalid("not a number".to_string()))?;

    if !parsed.is_finite() {
        return Err(invalid("not a finite number".to_string()));
    }
    if spec.integer && parsed.fract() != 0.0 {
        return Err(invalid("must be a whole number".to_string()));
    }
    if parsed < spec.min || parsed > spec.max {
        return Err(invalid(format!("must be between {} and {}", spec.min, spec.max)));
    }
    Ok(parsed)
}

/// Thresholds and timings for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSettings {
    pub recognition_threshold: f32,
    pub duplicate_threshold: f32,
    pub alert_cooldown_seconds: f32,
    pub dwell_threshold_seconds: f32,
    pub min_confidence: f32,
    pub clear_unknown_margin: f32,
    pub recognized_sample_every: u64,
    pub match_ambiguity_gap: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recognition_threshold: 0.45,
            duplicate_threshold: 0.4,
            alert_cooldown_seconds: 5.0,
            dwell_threshold_seconds: 1.0,
            min_confidence: 0.5,
            clear_unknown_margin: 0.1,
            recognized_sample_every: 150,
            match_ambiguity_gap: 0.0,
        }
    }
}

impl EngineSettings {
    /// Read every setting from `provider`.
    ///
    /// A value that does not parse or is out of range falls back to its
    /// default with a warning. Provider failures are returned.
    pub fn load(provider: &dyn SettingsProvider) -> Result<Self, ProviderError> {
        let mut settings = Self::default();
        for spec in SETTINGS {
            let raw = provider.get(spec.name, spec.default)?;
            let value = match validate_setting(spec.name, &raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(setting = spec.name, error = %e, default = spec.default, "using default");
                    continue;
                }
            };
            settings.apply(spec.name, value);
        }
        tracing::debug!(?settings, "engine settings loaded");
        Ok(settings)
    }

    fn apply(&mut self, name: &str, value: f64) {
        match name {
            RECOGNITION_THRESHOLD => self.recognition_threshold = value as f32,
            DUPLICATE_THRESHOLD => self.duplicate_threshold = value as f32,
            ALERT_COOLDOWN_SECONDS => self.alert_cooldown_seconds = value as f32,
            DWELL_THRESHOLD_SECONDS => self.dwell_threshold_seconds = value as f32,
            MIN_CONFIDENCE => self.min_confidence = value as f32,
            CLEAR_UNKNOWN_MARGIN => self.clear_unknown_margin = value as f32,
            RECOGNIZED_SAMPLE_EVERY => self.recognized_sample_every = value as u64,
            MATCH_AMBIGUITY_GAP => self.match_ambiguity_gap = value as f32,
            _ => {}
        }
    }

    pub fn dwell(&self) -> Duration {
        seconds(self.dwell_threshold_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        seconds(self.alert_cooldown_seconds)
    }

    /// Distance above which an unmatched face counts as clearly unknown.
    pub fn clear_unknown_distance(&self) -> f32 {
        self.recognition_threshold + self.clear_unknown_margin
    }
}

fn seconds(value: f32) -> Duration {
    Duration::milliseconds((f64::from(value) * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Offline;

    impl SettingsProvider for Offline {
        fn get(&self, _name: &str, _default: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Unavailable("database locked".into()))
        }
    }

    #[test]
    fn test_defaults_match_table() {
        let loaded = EngineSettings::load(&provider(&[])).unwrap();
        assert_eq!(loaded, EngineSettings::default());
    }

    #[test]
    fn test_load_overrides() {
        let loaded = EngineSettings::load(&provider(&[
            (RECOGNITION_THRESHOLD, "0.6"),
            (ALERT_COOLDOWN_SECONDS, "2.5"),
            (RECOGNIZED_SAMPLE_EVERY, "30"),
        ]))
        .unwrap();
        assert!((loaded.recognition_threshold - 0.6).abs() < 1e-6);
        assert_eq!(loaded.cooldown(), Duration::milliseconds(2500));
        assert_eq!(loaded.recognized_sample_every, 30);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let loaded = EngineSettings::load(&provider(&[
            (RECOGNITION_THRESHOLD, "1.5"),
            (DUPLICATE_THRESHOLD, "abc"),
            (RECOGNIZED_SAMPLE_EVERY, "2.5"),
        ]))
        .unwrap();
        assert_eq!(loaded, EngineSettings::default());
    }

    #[test]
    fn test_provider_failure_propagates() {
        assert!(matches!(
            EngineSettings::load(&Offline),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_validate_setting_range() {
        assert!(validate_setting(RECOGNITION_THRESHOLD, "0.1").is_ok());
        assert!(validate_setting(RECOGNITION_THRESHOLD, "1.0").is_ok());
        assert!(validate_setting(RECOGNITION_THRESHOLD, "0.05").is_err());
        assert!(validate_setting("camera_fps", "30").is_err());
    }

    #[test]
    fn test_clear_unknown_distance() {
        let settings = EngineSettings::default();
        assert!((settings.clear_unknown_distance() - 0.55).abs() < 1e-6);
        assert_eq!(settings.dwell(), Duration::seconds(1));
    }
}
