use config::{Config, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::advisors::logging::Verbosity;
use crate::advisors::retry::RetryPolicy;
use crate::errors::GatewayError;
use crate::providers::configs::OpenAiProviderConfig;

const ENV_PREFIX: &str = "CHATGATE";
const PLACEHOLDER_KEYS: [&str; 2] = ["REPLACE_ME", "changeme"];
const SHORT_KEY_LEN: usize = 20;
const MAX_TOKENS_WARNING: i32 = 100_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// The environment variable that sets a dotted configuration key
pub fn to_env_var(field: &str) -> String {
    format!("{}_{}", ENV_PREFIX, field.replace('.', "__").to_uppercase())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderSettings {
    pub fn into_config(self) -> OpenAiProviderConfig {
        OpenAiProviderConfig {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            timeout: Duration::from_secs(self.timeout_secs),
            ..OpenAiProviderConfig::new(self.base_url, self.api_key, self.model)
        }
    }

    /// Budget for a single model invocation
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: default_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            verbosity: Verbosity::default(),
            level: default_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationSettings {
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Default for ObservationSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptSettings {
    /// File holding the system prompt; the built-in fallback is used when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl ToolSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub observation: ObservationSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

impl Settings {
    /// Defaults overlaid with `CHATGATE_*` environment variables, e.g.
    /// `CHATGATE_RETRY__MAX_ATTEMPTS=5`
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("provider.base_url", default_base_url())?
            .set_default("provider.model", default_model())?
            .set_default("memory.max_messages", default_max_messages() as i64)?
            .set_default("retry.max_attempts", default_max_attempts() as i64)?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                return if error_str.starts_with("missing field") {
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .split('`')
                        .next()
                        .unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                };
            }
        };

        if settings.provider.api_key.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar {
                env_var: to_env_var("provider.api_key"),
            });
        }
        Ok(settings)
    }

    /// Reject settings that cannot work. Returns the warnings for settings that merely look off.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        let provider = &self.provider;

        if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "base URL `{}` must start with http:// or https://",
                provider.base_url
            )));
        }

        let key = provider.api_key.trim();
        if key.is_empty() {
            return Err(ConfigError::MissingEnvVar {
                env_var: to_env_var("provider.api_key"),
            });
        }
        if key.starts_with("your-")
            || key.starts_with("your_")
            || PLACEHOLDER_KEYS.iter().any(|p| key.eq_ignore_ascii_case(p))
        {
            return Err(ConfigError::Invalid(format!(
                "API key looks like a placeholder; set {}",
                to_env_var("provider.api_key")
            )));
        }
        if key.chars().count() < SHORT_KEY_LEN {
            warnings.push(format!(
                "API key seems unusually short ({} characters)",
                key.chars().count()
            ));
        }

        if !(0.0..=2.0).contains(&provider.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} must be between 0.0 and 2.0",
                provider.temperature
            )));
        }
        if provider.max_tokens > MAX_TOKENS_WARNING {
            warnings.push(format!(
                "max_tokens is very high ({}), this may result in high costs",
                provider.max_tokens
            ));
        }
        if provider.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "provider timeout must be at least one second".to_string(),
            ));
        }

        self.retry.policy()?;
        if self.memory.max_messages == 0 {
            return Err(ConfigError::Invalid(
                "memory max_messages must be at least 1".to_string(),
            ));
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(warnings)
    }

    /// Human-readable overview with the API key masked
    pub fn summary(&self) -> String {
        let provider = &self.provider;
        [
            format!("Base URL: {}", provider.base_url),
            format!(
                "API Key: {} (length: {})",
                mask_api_key(&provider.api_key),
                provider.api_key.chars().count()
            ),
            format!("Model: {}", provider.model),
            format!("Temperature: {}", provider.temperature),
            format!("Max Tokens: {}", provider.max_tokens),
            format!("Invocation timeout: {}s", provider.timeout_secs),
            format!(
                "Memory: {} (window {})",
                on_off(self.memory.enabled),
                self.memory.max_messages
            ),
            format!(
                "Retry: {} (attempts {}, backoff {}..{}ms)",
                on_off(self.retry.enabled),
                self.retry.max_attempts,
                self.retry.min_backoff_ms,
                self.retry.max_backoff_ms
            ),
            format!(
                "Logging: {} ({})",
                on_off(self.logging.enabled),
                self.logging.verbosity
            ),
            format!("Observation: {}", on_off(self.observation.enabled)),
        ]
        .join("\n")
    }
}

/// First and last four characters, the rest hidden
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn enabled() -> bool {
    true
}

fn default_base_url() -> String {
    "https://api.groq.com/openai".to_string()
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> i32 {
    2000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_messages() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_level() -> String {
    "info".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_rounds() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("CHATGATE_") {
                env::remove_var(&key);
            }
        }
    }

    fn valid() -> Settings {
        Settings {
            provider: ProviderSettings {
                api_key: "gsk_abcdefghijklmnopqrstuvwxyz".to_string(),
                ..ProviderSettings::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn test_provider_config_carries_timeout() {
        let mut settings = valid();
        settings.provider.timeout_secs = 15;

        let config = settings.provider.into_config();
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.temperature, Some(0.7));
        assert_eq!(config.model, "llama-3.3-70b-versatile");
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        env::set_var("CHATGATE_PROVIDER__API_KEY", "test-key");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.provider.base_url, "https://api.groq.com/openai");
        assert_eq!(settings.provider.model, "llama-3.3-70b-versatile");
        assert_eq!(settings.provider.api_key, "test-key");
        assert_eq!(settings.provider.temperature, 0.7);
        assert_eq!(settings.provider.max_tokens, 2000);
        assert_eq!(settings.provider.timeout(), Duration::from_secs(60));
        assert!(settings.memory.enabled);
        assert_eq!(settings.memory.max_messages, 20);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.logging.verbosity, Verbosity::Summary);
        assert!(settings.observation.enabled);
        assert_eq!(settings.prompt.path, None);
        assert_eq!(settings.tools.max_rounds, 5);

        env::remove_var("CHATGATE_PROVIDER__API_KEY");
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("CHATGATE_PROVIDER__API_KEY", "test-key");
        env::set_var("CHATGATE_PROVIDER__MODEL", "mixtral-8x7b");
        env::set_var("CHATGATE_PROVIDER__TEMPERATURE", "0.2");
        env::set_var("CHATGATE_RETRY__MAX_ATTEMPTS", "5");
        env::set_var("CHATGATE_MEMORY__ENABLED", "false");
        env::set_var("CHATGATE_LOGGING__VERBOSITY", "detailed");
        env::set_var("CHATGATE_PROMPT__PATH", "/etc/chatgate/prompt.md");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.provider.model, "mixtral-8x7b");
        assert_eq!(settings.provider.temperature, 0.2);
        assert_eq!(settings.retry.max_attempts, 5);
        assert!(!settings.memory.enabled);
        assert_eq!(settings.logging.verbosity, Verbosity::Detailed);
        assert_eq!(
            settings.prompt.path,
            Some(PathBuf::from("/etc/chatgate/prompt.md"))
        );

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_api_key() {
        clean_env();
        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CHATGATE_PROVIDER__API_KEY");
            }
            other => panic!("expected missing env var, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_accepts_defaults_with_real_key() {
        let warnings = valid().validate().unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = valid();
        settings.provider.base_url = "ftp://example.com".to_string();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = valid();
        settings.provider.api_key = "your-api-key-here".to_string();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = valid();
        settings.provider.temperature = 2.5;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = valid();
        settings.retry.min_backoff_ms = 20_000;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = valid();
        settings.memory.max_messages = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_warnings() {
        let mut settings = valid();
        settings.provider.api_key = "short-key".to_string();
        settings.provider.max_tokens = 200_000;
        let warnings = settings.validate().unwrap();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_summary_masks_key() {
        let summary = valid().summary();
        assert!(summary.contains("gsk_...wxyz"));
        assert!(!summary.contains("gsk_abcdefghijklmnopqrstuvwxyz"));
        assert!(summary.contains("Model: llama-3.3-70b-versatile"));
        assert_eq!(mask_api_key("short"), "*****");
    }

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("retry.max_attempts"), "CHATGATE_RETRY__MAX_ATTEMPTS");
    }
}
