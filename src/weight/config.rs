//! Decoded tuning configuration and its three on-disk encodings.
//!
//! The core never touches parser internals: a [`Format`] decodes raw
//! bytes into the [`Config`] record and everything downstream works on
//! that. Unknown top-level fields are ignored; unknown size values are
//! rejected when weights are resolved against the class taxonomy.

use crate::error::{Error, Result};
use crate::size_class::{SizeCategory, SizeClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One (size, weight) pair inside a category's weight list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeClassWeight {
    pub size: usize,
    pub weight: f64,
}

/// Weight list for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeClassDetail {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub weights: Vec<SizeClassWeight>,
}

/// Per-category weight lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeClassConfig {
    #[serde(default)]
    pub small: SizeClassDetail,
    #[serde(default)]
    pub medium: SizeClassDetail,
    #[serde(default)]
    pub large: SizeClassDetail,
}

/// Coarse category split; must sum to 1 within tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub small: f64,
    #[serde(default)]
    pub medium: f64,
    #[serde(default)]
    pub large: f64,
}

/// The full decoded configuration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub size_class: SizeClassConfig,
}

/// Biased toward large buffers; the workload usually proves otherwise
/// and the watcher moves the split from there.
pub fn default_global() -> GlobalConfig {
    GlobalConfig {
        small: 0.1,
        medium: 0.3,
        large: 0.6,
    }
}

/// Supported configuration encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    /// Decode raw file contents into a [`Config`].
    pub fn decode(self, data: &str) -> Result<Config> {
        let decoded = match self {
            Format::Yaml => serde_yaml::from_str(data).map_err(|e| Error::InvalidConfiguration {
                scope: "yaml".to_string(),
                detail: e.to_string(),
            }),
            Format::Json => serde_json::from_str(data).map_err(|e| Error::InvalidConfiguration {
                scope: "json".to_string(),
                detail: e.to_string(),
            }),
            Format::Toml => toml::from_str(data).map_err(|e| Error::InvalidConfiguration {
                scope: "toml".to_string(),
                detail: e.to_string(),
            }),
        }?;
        Ok(decoded)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
            Format::Toml => "toml",
        };
        f.write_str(name)
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Format::Yaml),
            "json" => Ok(Format::Json),
            "toml" => Ok(Format::Toml),
            other => Err(Error::BadArgument(format!("unknown config format: {other}"))),
        }
    }
}

fn default_description(category: SizeCategory) -> String {
    format!("{category} size category")
}

/// Assembles a [`SizeClassDetail`], rescaling the collected weights onto
/// sum 1.0 when they drift outside tolerance.
pub struct SizeClassDetailBuilder {
    category: SizeCategory,
    detail: SizeClassDetail,
}

impl SizeClassDetailBuilder {
    pub fn new(category: SizeCategory) -> Self {
        Self {
            category,
            detail: SizeClassDetail {
                description: default_description(category),
                weights: Vec::new(),
            },
        }
    }

    pub fn weight(mut self, class: SizeClass, weight: f64) -> Self {
        self.detail.weights.push(SizeClassWeight {
            size: class.size(),
            weight,
        });
        self
    }

    pub fn build(mut self) -> SizeClassDetail {
        const TOLERANCE: f64 = 0.001;
        let total: f64 = self.detail.weights.iter().map(|w| w.weight).sum();
        if (total - 1.0).abs() > TOLERANCE && total > 0.0 {
            let scale = 1.0 / total;
            for entry in &mut self.detail.weights {
                entry.weight *= scale;
            }
        }
        self.detail
    }

    pub fn category(&self) -> SizeCategory {
        self.category
    }
}

/// Resolved weight lookup for one category's detail: exact size values
/// mapped onto the class taxonomy.
#[derive(Debug, Clone)]
pub struct WeightTable {
    weights: HashMap<SizeClass, f64>,
}

impl WeightTable {
    /// Fails on any size value that is not an exact class size.
    pub fn from_detail(detail: &SizeClassDetail) -> Result<WeightTable> {
        let mut weights = HashMap::with_capacity(detail.weights.len());
        for entry in &detail.weights {
            let class = SizeClass::from_size(entry.size).ok_or_else(|| {
                Error::InvalidConfiguration {
                    scope: "size_class".to_string(),
                    detail: format!("unrecognized size value {}", entry.size),
                }
            })?;
            weights.insert(class, entry.weight);
        }
        Ok(WeightTable { weights })
    }

    pub fn get(&self, class: SizeClass) -> Option<f64> {
        self.weights.get(&class).copied()
    }

    /// (class, weight) pairs ascending by class size.
    pub fn sorted(&self) -> Vec<(SizeClass, f64)> {
        let mut entries: Vec<_> = self.weights.iter().map(|(&c, &w)| (c, w)).collect();
        entries.sort_by_key(|(c, _)| *c);
        entries
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
