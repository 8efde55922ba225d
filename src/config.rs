//! Service configuration. Values are layered: built-in defaults, then an
//! optional TOML file, then `SPOILER_<SECTION>__<KEY>` environment variables.

use anyhow::{bail, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "spoiler-classifier";

/// Prefix of the environment variables that override the config file
pub const ENV_PREFIX: &str = "SPOILER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Number of HTTP worker threads. Unset means one per physical core
    pub workers: Option<usize>,

    /// Largest accepted JSON body. Base 64 camera photos are big
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".into(),
            port: 8000,
            workers: None,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// How the weights file on disk should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ModelFormat {
    /// MobileNetV2 parameters (safetensors or `.ot`) with a
    /// `num_classes`-way linear head
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,

    /// A TorchScript module, used as-is
    #[serde(rename = "torchscript")]
    TorchScript,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::MobileNetV2 => "mobilenet_v2",
            ModelFormat::TorchScript => "torchscript",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub format: ModelFormat,
    pub num_classes: i64,

    /// Human readable name of each class index, used in logs
    pub labels: Vec<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            path: "model.safetensors".into(),
            format: ModelFormat::MobileNetV2,
            num_classes: 2,
            labels: vec!["not_rotten".into(), "rotten".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `tracing_subscriber::EnvFilter` directives. `RUST_LOG` wins if set
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            filter: "info,actix_web=info".into(),
        }
    }
}

impl Settings {
    /// Load the settings from `path` (required) or the default config file
    /// (optional), with environment overrides on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let builder = Config::builder().add_source(file).add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("model.labels")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.num_classes < 2 {
            bail!("model.num_classes must be at least 2, got {}", model.num_classes);
        }
        if !model.labels.is_empty() && model.labels.len() as i64 != model.num_classes {
            bail!(
                "model.labels has {} entries but model.num_classes is {}",
                model.labels.len(),
                model.num_classes
            );
        }
        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be positive");
        }
        Ok(())
    }

    /// Address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
