//! Watched dataset configuration.
//!
//! The delivery pipeline rewrites the watched `ConfigMap` to switch datasets.
//! Its data is parsed here into [`DatasetParams`], validated once at
//! construction, so everything downstream works with typed values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KEY_DATASET_URL: &str = "DATASET_URL";
pub const KEY_DATASET_NAME: &str = "DATASET_NAME";
pub const KEY_MODEL_FILENAME: &str = "MODEL_FILENAME";
pub const KEY_MIN_SUPPORT: &str = "MIN_SUPPORT";
pub const KEY_MIN_CONFIDENCE: &str = "MIN_CONFIDENCE";
pub const KEY_MIN_LIFT: &str = "MIN_LIFT";
pub const KEY_MAX_LEN: &str = "MAX_LEN";

const DEFAULT_MODEL_FILENAME: &str = "association_rules.pkl";
const DEFAULT_MIN_SUPPORT: f64 = 0.05;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
const DEFAULT_MIN_LIFT: f64 = 1.0;

/// Raw view of the watched `ConfigMap`, as read from the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedConfig {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

/// Mining thresholds handed to the rules generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyperparameters {
    pub min_support: f64,
    pub min_confidence: f64,
    pub min_lift: f64,
    pub max_len: Option<u32>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            min_support: DEFAULT_MIN_SUPPORT,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_lift: DEFAULT_MIN_LIFT,
            max_len: None,
        }
    }
}

/// Everything a regeneration run depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetParams {
    pub dataset_url: String,
    pub dataset_name: String,
    pub model_filename: String,
    pub hyperparameters: Hyperparameters,
}

impl WatchedConfig {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data,
        }
    }

    /// Parse and validate the regeneration parameters.
    pub fn params(&self) -> Result<DatasetParams> {
        DatasetParams::from_data(&self.data)
    }
}

impl DatasetParams {
    /// Build parameters from `ConfigMap` data, applying defaults for optional keys.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let dataset_url = required(data, KEY_DATASET_URL)?;
        let dataset_name = required(data, KEY_DATASET_NAME)?;

        let model_filename = optional(data, KEY_MODEL_FILENAME)
            .unwrap_or(DEFAULT_MODEL_FILENAME)
            .to_string();
        if model_filename.contains('/') || model_filename == "." || model_filename == ".." {
            return Err(Error::InvalidConfig(format!(
                "{KEY_MODEL_FILENAME} must be a plain file name, got '{model_filename}'"
            )));
        }

        let min_support = parse_ratio(data, KEY_MIN_SUPPORT, DEFAULT_MIN_SUPPORT)?;
        let min_confidence = parse_ratio(data, KEY_MIN_CONFIDENCE, DEFAULT_MIN_CONFIDENCE)?;

        let min_lift = parse_float(data, KEY_MIN_LIFT, DEFAULT_MIN_LIFT)?;
        if min_lift <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "{KEY_MIN_LIFT} must be positive, got {min_lift}"
            )));
        }

        let max_len = match optional(data, KEY_MAX_LEN) {
            None => None,
            Some(raw) => match raw.parse::<u32>() {
                Ok(value) if value > 0 => Some(value),
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "{KEY_MAX_LEN} must be a positive integer, got '{raw}'"
                    )))
                }
            },
        };

        Ok(Self {
            dataset_url,
            dataset_name,
            model_filename,
            hyperparameters: Hyperparameters {
                min_support,
                min_confidence,
                min_lift,
                max_len,
            },
        })
    }

    /// Canonical key/value pairs relevant to regeneration, sorted by key.
    ///
    /// Defaults are already materialized, so an omitted key and its default
    /// value produce the same pairs.
    pub fn canonical_pairs(&self) -> BTreeMap<&'static str, String> {
        let mut pairs = BTreeMap::new();
        pairs.insert(KEY_DATASET_URL, self.dataset_url.clone());
        pairs.insert(KEY_DATASET_NAME, self.dataset_name.clone());
        pairs.insert(KEY_MODEL_FILENAME, self.model_filename.clone());
        pairs.insert(KEY_MIN_SUPPORT, self.hyperparameters.min_support.to_string());
        pairs.insert(
            KEY_MIN_CONFIDENCE,
            self.hyperparameters.min_confidence.to_string(),
        );
        pairs.insert(KEY_MIN_LIFT, self.hyperparameters.min_lift.to_string());
        if let Some(max_len) = self.hyperparameters.max_len {
            pairs.insert(KEY_MAX_LEN, max_len.to_string());
        }
        pairs
    }
}

fn optional<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required(data: &BTreeMap<String, String>, key: &str) -> Result<String> {
    optional(data, key)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidConfig(format!("missing required key {key}")))
}

fn parse_float(data: &BTreeMap<String, String>, key: &str, default: f64) -> Result<f64> {
    let Some(raw) = optional(data, key) else {
        return Ok(default);
    };
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(Error::InvalidConfig(format!(
            "{key} must be a finite number, got '{raw}'"
        ))),
    }
}

/// Parse a threshold that must lie in (0, 1].
fn parse_ratio(data: &BTreeMap<String, String>, key: &str, default: f64) -> Result<f64> {
    let value = parse_float(data, key, default)?;
    if value <= 0.0 || value > 1.0 {
        return Err(Error::InvalidConfig(format!(
            "{key} must be in (0, 1], got {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_full_config() {
        let params = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/datasets/2023_spotify_ds2.csv"),
            (KEY_DATASET_NAME, "ds2"),
            (KEY_MODEL_FILENAME, "rules_ds2.pkl"),
            (KEY_MIN_SUPPORT, "0.01"),
            (KEY_MIN_CONFIDENCE, "0.3"),
            (KEY_MIN_LIFT, "2"),
            (KEY_MAX_LEN, "3"),
        ]))
        .unwrap();

        assert_eq!(params.dataset_name, "ds2");
        assert_eq!(params.model_filename, "rules_ds2.pkl");
        assert!((params.hyperparameters.min_support - 0.01).abs() < f64::EPSILON);
        assert!((params.hyperparameters.min_lift - 2.0).abs() < f64::EPSILON);
        assert_eq!(params.hyperparameters.max_len, Some(3));
    }

    #[test]
    fn applies_generator_defaults() {
        let params = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/datasets/ds1.csv"),
            (KEY_DATASET_NAME, "ds1"),
        ]))
        .unwrap();

        assert_eq!(params.model_filename, "association_rules.pkl");
        assert_eq!(params.hyperparameters, Hyperparameters::default());
    }

    #[test]
    fn missing_dataset_name_is_invalid() {
        let err = DatasetParams::from_data(&data(&[(KEY_DATASET_URL, "/d.csv")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains(KEY_DATASET_NAME)));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let result = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/d.csv"),
            (KEY_DATASET_NAME, "   "),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        for (key, value) in [
            (KEY_MIN_SUPPORT, "0"),
            (KEY_MIN_CONFIDENCE, "1.5"),
            (KEY_MIN_LIFT, "-1"),
            (KEY_MIN_SUPPORT, "NaN"),
            (KEY_MAX_LEN, "0"),
        ] {
            let result = DatasetParams::from_data(&data(&[
                (KEY_DATASET_URL, "/d.csv"),
                (KEY_DATASET_NAME, "ds1"),
                (key, value),
            ]));
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn rejects_path_in_model_filename() {
        let result = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/d.csv"),
            (KEY_DATASET_NAME, "ds1"),
            (KEY_MODEL_FILENAME, "../etc/passwd"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn canonical_pairs_normalize_numbers() {
        let a = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/d.csv"),
            (KEY_DATASET_NAME, "ds1"),
            (KEY_MIN_SUPPORT, "0.050"),
        ]))
        .unwrap();
        let b = DatasetParams::from_data(&data(&[
            (KEY_DATASET_URL, "/d.csv"),
            (KEY_DATASET_NAME, "ds1"),
        ]))
        .unwrap();
        assert_eq!(a.canonical_pairs(), b.canonical_pairs());
        assert!(!a.canonical_pairs().contains_key(KEY_MAX_LEN));
    }
}
