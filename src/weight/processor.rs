//! Validates tuning configurations and builds the weight structures the
//! managers consume.

use super::config::{Config, SizeClassDetail};
use crate::error::{Error, Result};
use crate::size_class::SizeCategory;
use std::collections::BTreeMap;

const TOLERANCE: f64 = 0.001;
const REQUIRED_TOTAL: f64 = 1.0;

/// Stateless: every method is a pure function of its input, so the same
/// processor can serve every pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightProcessor;

impl WeightProcessor {
    pub fn new() -> Self {
        WeightProcessor
    }

    /// Check that the global split and each category's weight list sum to
    /// 1.0 within tolerance. Returns the accepted configuration.
    pub fn normalize(&self, cfg: &Config) -> Result<Config> {
        let global_total = cfg.global.small + cfg.global.medium + cfg.global.large;
        check_total("global", global_total)?;
        check_detail("size_class.small", &cfg.size_class.small)?;
        check_detail("size_class.medium", &cfg.size_class.medium)?;
        check_detail("size_class.large", &cfg.size_class.large)?;
        Ok(cfg.clone())
    }

    /// Category split of a normalized configuration.
    pub fn build_global(&self, cfg: &Config) -> BTreeMap<SizeCategory, f64> {
        BTreeMap::from([
            (SizeCategory::Small, cfg.global.small),
            (SizeCategory::Medium, cfg.global.medium),
            (SizeCategory::Large, cfg.global.large),
        ])
    }

    /// Per-category weight vectors, each sorted ascending so downstream
    /// consumers see a deterministic order.
    pub fn build_size_class(&self, cfg: &Config) -> BTreeMap<SizeCategory, Vec<f64>> {
        BTreeMap::from([
            (SizeCategory::Small, sorted_weights(&cfg.size_class.small)),
            (SizeCategory::Medium, sorted_weights(&cfg.size_class.medium)),
            (SizeCategory::Large, sorted_weights(&cfg.size_class.large)),
        ])
    }
}

fn check_total(scope: &str, total: f64) -> Result<()> {
    if (total - REQUIRED_TOTAL).abs() >= TOLERANCE {
        return Err(Error::InvalidConfiguration {
            scope: scope.to_string(),
            detail: format!("weights sum to {total:.3}, expected {REQUIRED_TOTAL:.3}"),
        });
    }
    Ok(())
}

fn check_detail(scope: &str, detail: &SizeClassDetail) -> Result<()> {
    let total: f64 = detail.weights.iter().map(|w| w.weight).sum();
    check_total(scope, total)
}

fn sorted_weights(detail: &SizeClassDetail) -> Vec<f64> {
    let mut weights: Vec<f64> = detail.weights.iter().map(|w| w.weight).collect();
    weights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::config::{GlobalConfig, SizeClassConfig, SizeClassWeight};

    fn detail(weights: &[(usize, f64)]) -> SizeClassDetail {
        SizeClassDetail {
            description: String::new(),
            weights: weights
                .iter()
                .map(|&(size, weight)| SizeClassWeight { size, weight })
                .collect(),
        }
    }

    fn valid_config() -> Config {
        Config {
            version: "1.0".to_string(),
            global: GlobalConfig {
                small: 0.2,
                medium: 0.3,
                large: 0.5,
            },
            size_class: SizeClassConfig {
                small: detail(&[(8, 0.7), (64, 0.3)]),
                medium: detail(&[(8192, 0.4), (65536, 0.6)]),
                large: detail(&[(1048576, 1.0)]),
            },
        }
    }

    #[test]
    fn test_normalize_accepts_valid_config() {
        let processor = WeightProcessor::new();
        let cfg = valid_config();
        let normalized = processor.normalize(&cfg).unwrap();
        assert_eq!(normalized, cfg);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let processor = WeightProcessor::new();
        let once = processor.normalize(&valid_config()).unwrap();
        let twice = processor.normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_rejects_bad_global_sum() {
        let processor = WeightProcessor::new();
        let mut cfg = valid_config();
        cfg.global = GlobalConfig {
            small: 0.7,
            medium: 0.3,
            large: 0.1,
        };
        match processor.normalize(&cfg).unwrap_err() {
            Error::InvalidConfiguration { scope, detail } => {
                assert_eq!(scope, "global");
                assert!(detail.contains("1.1"), "detail was {detail}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_normalize_rejects_bad_category_sum() {
        let processor = WeightProcessor::new();
        let mut cfg = valid_config();
        cfg.size_class.medium = detail(&[(8192, 0.4), (65536, 0.4)]);
        match processor.normalize(&cfg).unwrap_err() {
            Error::InvalidConfiguration { scope, .. } => {
                assert_eq!(scope, "size_class.medium");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_normalize_tolerance_window() {
        let processor = WeightProcessor::new();
        let mut cfg = valid_config();
        cfg.global = GlobalConfig {
            small: 0.2,
            medium: 0.3,
            large: 0.5005,
        };
        assert!(processor.normalize(&cfg).is_ok());

        cfg.global.large = 0.502;
        assert!(processor.normalize(&cfg).is_err());
    }

    #[test]
    fn test_build_global() {
        let processor = WeightProcessor::new();
        let map = processor.build_global(&valid_config());
        assert_eq!(map[&SizeCategory::Small], 0.2);
        assert_eq!(map[&SizeCategory::Medium], 0.3);
        assert_eq!(map[&SizeCategory::Large], 0.5);
    }

    #[test]
    fn test_build_size_class_sorts_ascending() {
        let processor = WeightProcessor::new();
        let map = processor.build_size_class(&valid_config());
        assert_eq!(map[&SizeCategory::Small], vec![0.3, 0.7]);
        assert_eq!(map[&SizeCategory::Medium], vec![0.4, 0.6]);
        assert_eq!(map[&SizeCategory::Large], vec![1.0]);
    }
}
