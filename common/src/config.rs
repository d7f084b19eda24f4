use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Upper bound for `detection.max_concurrent_requests`.
pub const MAX_CONCURRENT_REQUESTS: usize = 64;
/// Accepted polling rates, in frames per second.
pub const MIN_FPS: f64 = 0.01;
pub const MAX_FPS: f64 = 1000.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: CameraSource,
    #[serde(default)]
    pub index: u32,
    pub url: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Per-provider credentials. `model` and `base_url` fall back to the
/// provider's own defaults when absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_enabled")]
    pub enabled: bool,
    #[serde(default = "default_speech_command")]
    pub command: String,
    pub voice: Option<String>,
    pub rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Provider {
    #[default]
    #[serde(rename = "OpenAI", alias = "openai")]
    OpenAi,
    #[serde(rename = "Anthropic", alias = "anthropic")]
    Anthropic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    /// Local camera addressed by `camera.index`.
    #[default]
    Device,
    /// HTTP endpoint returning one JPEG per request.
    Snapshot,
    /// HTTP `multipart/x-mixed-replace` MJPEG stream.
    Mjpeg,
}

/// Provider settings after defaults and the environment have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    pub fn env_var_name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4-vision-preview",
            Provider::Anthropic => "claude-3-sonnet-20240229",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            update_interval_ms: default_update_interval_ms(),
            change_threshold: default_change_threshold(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::default(),
            index: 0,
            url: None,
            fps: default_fps(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: default_speech_enabled(),
            command: default_speech_command(),
            voice: None,
            rate: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.detection.change_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "detection.change_threshold must be within [0, 1], got {threshold}"
            )));
        }
        let concurrency = self.detection.max_concurrent_requests;
        if !(1..=MAX_CONCURRENT_REQUESTS).contains(&concurrency) {
            return Err(ConfigError::Invalid(format!(
                "detection.max_concurrent_requests must be within [1, {MAX_CONCURRENT_REQUESTS}], got {concurrency}"
            )));
        }
        // NaN fails the range check too.
        let fps = self.camera.fps;
        if !(MIN_FPS..=MAX_FPS).contains(&fps) {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be within [{MIN_FPS}, {MAX_FPS}], got {fps}"
            )));
        }
        if self.camera.source != CameraSource::Device && self.camera.url.is_none() {
            return Err(ConfigError::Invalid(
                "camera.url is required for snapshot and mjpeg sources".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the selected provider's credentials, reading the API key from
    /// the process environment when the config file leaves it out.
    pub fn resolve_provider(&self) -> Result<ResolvedProvider, ConfigError> {
        self.resolve_provider_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_provider_with<F>(&self, env: F) -> Result<ResolvedProvider, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = self.detection.provider;
        let section = match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
        };

        let api_key = section
            .api_key
            .clone()
            .or_else(|| {
                debug!(
                    env_var = provider.env_var_name(),
                    "api_key not in config, checking environment"
                );
                env(provider.env_var_name())
            })
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey {
                provider: provider.as_str(),
                env_var: provider.env_var_name(),
            })?;

        Ok(ResolvedProvider {
            provider,
            api_key,
            model: section
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
            base_url: section
                .base_url
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("no API key for provider {provider}: set it in the config file or {env_var}")]
    MissingApiKey {
        provider: &'static str,
        env_var: &'static str,
    },
}

// Default value functions
fn default_update_interval_ms() -> u64 {
    6000
}
fn default_change_threshold() -> f64 {
    0.1
}
fn default_max_concurrent_requests() -> usize {
    1
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_fps() -> f64 {
    10.0
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_speech_enabled() -> bool {
    true
}
fn default_speech_command() -> String {
    if cfg!(target_os = "macos") {
        "say".into()
    } else {
        "espeak-ng".into()
    }
}
fn default_log_level() -> String {
    "info".into()
}
