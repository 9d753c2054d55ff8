//! Layered configuration.
//!
//! Lowest to highest priority:
//! - built-in defaults
//! - TOML file (`--config`, else `$XDG_CONFIG_HOME/faceset/config.toml`)
//! - `FACESET_*` environment variables
//! - command-line flags

use anyhow::{Context, Result};
use faceset_core::{default_model_dir, DetectionModel, EncodingModel};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Dataset build settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detection_model: DetectionModel,
    pub encoding_model: EncodingModel,
    /// Random distortions averaged per encoding (1 = none).
    pub jitters: u32,
    /// Seed for the jitter sampler; unseeded runs differ when jitters > 1.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            detection_model: DetectionModel::default(),
            encoding_model: EncodingModel::default(),
            jitters: 1,
            seed: None,
        }
    }
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub detection_model: Option<DetectionModel>,
    pub encoding_model: Option<EncodingModel>,
    pub jitters: Option<u32>,
    pub seed: Option<u64>,
}

impl FileConfig {
    pub fn parse(src: &str) -> Result<Self> {
        Ok(toml::from_str(src)?)
    }
}

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub model_dir: Option<PathBuf>,
    pub detection_model: Option<DetectionModel>,
    pub encoding_model: Option<EncodingModel>,
    pub jitters: Option<u32>,
    pub seed: Option<u64>,
}

impl Config {
    /// Build the effective configuration from every layer.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = Self::default();

        match config_path {
            Some(path) => {
                let file = read_file_config(path)?;
                config.apply_file(file);
            }
            None => {
                if let Some(path) = default_config_path().filter(|p| p.is_file()) {
                    let file = read_file_config(&path)?;
                    config.apply_file(file);
                }
            }
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_overrides(overrides);
        Ok(config)
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.detection_model {
            self.detection_model = v;
        }
        if let Some(v) = file.encoding_model {
            self.encoding_model = v;
        }
        if let Some(v) = file.jitters {
            self.jitters = v;
        }
        if file.seed.is_some() {
            self.seed = file.seed;
        }
    }

    /// Apply `FACESET_*` variables as returned by `lookup`.
    ///
    /// Unknown model identifiers are errors; unparsable numbers are ignored
    /// with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FACESET_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESET_DETECTION_MODEL") {
            self.detection_model = v.parse().context("FACESET_DETECTION_MODEL")?;
        }
        if let Some(v) = lookup("FACESET_ENCODING_MODEL") {
            self.encoding_model = v.parse().context("FACESET_ENCODING_MODEL")?;
        }
        if let Some(v) = env_parse(&lookup, "FACESET_JITTERS") {
            self.jitters = v;
        }
        if let Some(v) = env_parse(&lookup, "FACESET_SEED") {
            self.seed = Some(v);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(v) = &o.model_dir {
            self.model_dir = v.clone();
        }
        if let Some(v) = o.detection_model {
            self.detection_model = v;
        }
        if let Some(v) = o.encoding_model {
            self.encoding_model = v;
        }
        if let Some(v) = o.jitters {
            self.jitters = v;
        }
        if o.seed.is_some() {
            self.seed = o.seed;
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    FileConfig::parse(&src).with_context(|| format!("parsing config {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("faceset").join("config.toml"))
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
