use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default cap on multipart uploads (16MB).
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub uploads: UploadConfig,
    pub models: ModelConfig,
    pub history: HistoryConfig,
    pub dedup: DedupConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory every media path is resolved against.
    pub root: PathBuf,
    pub max_images_per_request: usize,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Backend loaded when `load` is called without an id.
    pub default_model_id: String,
    pub load_on_startup: bool,
    /// OpenAI-compatible inference server hosting the remote backends.
    pub inference_base_url: String,
    pub inference_api_key: Option<String>,
    pub inference_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub limit_pairs: usize,
}

/// Windows for the two deduplication tiers. Kept independent on purpose.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    pub memory_window_secs: u64,
    pub durable_window_secs: u64,
    pub cache_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    pub default_max_new_tokens: u32,
    pub default_temperature: f32,
    /// Capacity of the worker-to-caller token handoff channel.
    pub stream_buffer_size: usize,
    pub timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { limit_pairs: 5 }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            memory_window_secs: 10,
            durable_window_secs: 30,
            cache_retention_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

impl DedupConfig {
    pub fn memory_window(&self) -> Duration {
        Duration::from_secs(self.memory_window_secs)
    }

    pub fn durable_window(&self) -> Duration {
        Duration::from_secs(self.durable_window_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_new_tokens: 512,
            default_temperature: 0.7,
            stream_buffer_size: 32,
            timeout_secs: 300,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";
        let history_defaults = HistoryConfig::default();
        let dedup_defaults = DedupConfig::default();
        let generation_defaults = GenerationConfig::default();

        Ok(ChatConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("chat-service"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: get_parsed("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            uploads: UploadConfig {
                root: PathBuf::from(get_env("UPLOAD_ROOT", Some("./uploads"), is_prod)?),
                max_images_per_request: get_parsed("MAX_IMAGES_PER_REQUEST", 10)?,
                max_upload_bytes: get_parsed("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            },
            models: ModelConfig {
                default_model_id: get_env("DEFAULT_MODEL_ID", Some("qwen2_5_7b"), false)?,
                load_on_startup: get_parsed("LOAD_MODEL_ON_STARTUP", false)?,
                inference_base_url: get_env(
                    "INFERENCE_BASE_URL",
                    Some("http://localhost:8000"),
                    is_prod,
                )?,
                inference_api_key: env::var("INFERENCE_API_KEY").ok().filter(|v| !v.is_empty()),
                inference_timeout_secs: get_parsed("INFERENCE_TIMEOUT_SECS", 300)?,
            },
            history: HistoryConfig {
                limit_pairs: get_parsed("HISTORY_LIMIT_PAIRS", history_defaults.limit_pairs)?,
            },
            dedup: DedupConfig {
                memory_window_secs: get_parsed(
                    "DEDUP_MEMORY_WINDOW_SECS",
                    dedup_defaults.memory_window_secs,
                )?,
                durable_window_secs: get_parsed(
                    "DEDUP_DURABLE_WINDOW_SECS",
                    dedup_defaults.durable_window_secs,
                )?,
                cache_retention_secs: get_parsed(
                    "DEDUP_CACHE_RETENTION_SECS",
                    dedup_defaults.cache_retention_secs,
                )?,
                sweep_interval_secs: get_parsed(
                    "DEDUP_SWEEP_INTERVAL_SECS",
                    dedup_defaults.sweep_interval_secs,
                )?,
            },
            generation: GenerationConfig {
                default_max_new_tokens: get_parsed(
                    "DEFAULT_MAX_NEW_TOKENS",
                    generation_defaults.default_max_new_tokens,
                )?,
                default_temperature: get_parsed(
                    "DEFAULT_TEMPERATURE",
                    generation_defaults.default_temperature,
                )?,
                stream_buffer_size: get_parsed(
                    "STREAM_BUFFER_SIZE",
                    generation_defaults.stream_buffer_size,
                )?,
                timeout_secs: get_parsed(
                    "GENERATION_TIMEOUT_SECS",
                    generation_defaults.timeout_secs,
                )?,
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_windows_default_to_independent_values() {
        let dedup = DedupConfig::default();
        assert_eq!(dedup.memory_window(), Duration::from_secs(10));
        assert_eq!(dedup.durable_window(), Duration::from_secs(30));
        assert_eq!(dedup.cache_retention(), Duration::from_secs(60));
    }

    #[test]
    fn sweep_interval_is_never_zero() {
        let dedup = DedupConfig {
            sweep_interval_secs: 0,
            ..DedupConfig::default()
        };
        assert_eq!(dedup.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn parsed_env_rejects_garbage() {
        env::set_var("CHAT_TEST_PARSE_GARBAGE", "ten");
        let result: Result<u64, _> = get_parsed("CHAT_TEST_PARSE_GARBAGE", 1);
        assert!(result.is_err());
        env::remove_var("CHAT_TEST_PARSE_GARBAGE");
    }

    #[test]
    fn parsed_env_falls_back_to_default() {
        let value: usize = get_parsed("CHAT_TEST_PARSE_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
