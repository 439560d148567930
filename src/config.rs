use crate::activity::DEFAULT_IDLE_TIMEOUT;
use crate::audio::gate::DEFAULT_GATE_THRESHOLD;
use crate::audio::playback::DEFAULT_SPEAKING_DEBOUNCE;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key: {0}")]
    InvalidKey(String),
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// API credentials, kept out of debug output and logs.
#[derive(Debug)]
pub struct ApiConfig {
    gemini_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load credentials from the environment (and `.env` in development).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let key = env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))?;
        Self::validate_key(&key)?;

        Ok(Self {
            gemini_key: SecretBox::new(Box::new(key)),
        })
    }

    fn validate_key(key: &str) -> Result<(), ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKey("API key cannot be empty".into()));
        }
        if key.len() < 10 {
            return Err(ConfigError::InvalidKey(
                "API key should be at least 10 characters".into(),
            ));
        }
        Ok(())
    }

    /// Expose the key only at the point of connecting.
    pub fn gemini_key(&self) -> &str {
        self.gemini_key.expose_secret()
    }
}

/// Load credentials with actionable error logging for development setups.
pub fn load_api_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Tunables for a call. Everything calibration-sensitive lives here rather
/// than as literals in the pipeline.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Noise gate threshold as a fraction of full scale.
    pub gate_threshold: f32,
    /// Silence window after which a connected call is ended.
    pub idle_timeout: Duration,
    /// Delay past the last chunk's end before the speaking flag drops.
    pub speaking_debounce: Duration,
    /// Model driving the remote agent.
    pub model: String,
    /// Prebuilt synthesis voice.
    pub voice: String,
    /// Capture device name (None = system default).
    pub device_name: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            gate_threshold: DEFAULT_GATE_THRESHOLD,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            speaking_debounce: DEFAULT_SPEAKING_DEBOUNCE,
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
            device_name: None,
        }
    }
}
