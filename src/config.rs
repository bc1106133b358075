use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::SmoothingMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Runtime configuration, usually read from a TOML file.
///
/// Every field has a default so a partial (or absent) file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub labels: LabelsConfig,
    pub mesh: MeshConfig,
    pub delivery: DeliveryConfig,
    pub predictor: PredictorConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Mesh directory, relative to `output_dir`.
    pub assets_subdir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("predictions"),
            cache_dir: PathBuf::from("prediction_cache"),
            assets_subdir: PathBuf::from("unity_assets"),
        }
    }
}

impl PathsConfig {
    pub fn assets_dir(&self) -> PathBuf {
        self.output_dir.join(&self.assets_subdir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    pub liver: u16,
    pub tumor: u16,
    /// Organ name per label id. TOML keys are strings, e.g. `8 = "liver"`.
    #[serde(with = "label_names")]
    pub names: BTreeMap<u16, String>,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        let names = [
            (1, "spleen"),
            (2, "kidneys"),
            (3, "pancreas"),
            (4, "stomach"),
            (5, "heart"),
            (6, "duodenum"),
            (7, "tumsomething"),
            (8, "liver"),
            (9, "tumor"),
        ]
        .into_iter()
        .map(|(label, name)| (label, name.to_string()))
        .collect();
        Self {
            liver: 8,
            tumor: 9,
            names,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub smooth: bool,
    pub smoothing_iterations: usize,
    pub smoothing_lambda: f32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            smooth: true,
            smoothing_iterations: 2,
            smoothing_lambda: 0.5,
        }
    }
}

impl MeshConfig {
    pub fn smoothing(&self) -> SmoothingMode {
        if self.smooth && self.smoothing_iterations > 0 {
            SmoothingMode::Laplacian {
                iterations: self.smoothing_iterations,
                lambda: self.smoothing_lambda,
            }
        } else {
            SmoothingMode::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub pacing_ms: u64,
    /// Extra attempts after a failed delivery.
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            timeout_secs: 10,
            pacing_ms: 100,
            retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

impl DeliveryConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

mod label_names {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(names: &BTreeMap<u16, String>, s: S) -> Result<S::Ok, S::Error> {
        names
            .iter()
            .map(|(label, name)| (label.to_string(), name))
            .collect::<BTreeMap<_, _>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u16, String>, D::Error> {
        BTreeMap::<String, String>::deserialize(d)?
            .into_iter()
            .map(|(key, name)| {
                key.parse::<u16>()
                    .map(|label| (label, name))
                    .map_err(|_| D::Error::custom(format!("label `{key}` is not an integer")))
            })
            .collect()
    }
}
