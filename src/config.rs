//! Configuration management for webpilot.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. The LLM model to use. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3100`.
//! - `BROWSER_CDP_URL` - Optional. Connect to an existing Chrome with remote
//!   debugging enabled instead of launching a headless instance.
//! - `PLAN_MAX_DEPTH` - Optional. Maximum plan-stack depth. Defaults to `3`.
//! - `GOAL_TIMEOUT_SECS` - Optional. Advisory goal timeout. Defaults to `120`.
//! - `SUBGOAL_TIMEOUT_SECS` - Optional. Advisory subgoal timeout. Defaults to `30`.
//! - `STREAM_MODE` - Optional. `push` (CDP screencast) or `poll` (screenshot
//!   interval). Defaults to `push`.
//! - `STREAM_FPS` - Optional. Target frame rate, clamped to 1-60. Defaults to `15`.
//! - `STREAM_QUALITY` - Optional. JPEG quality, clamped to 1-100. Defaults to `70`.
//! - `STREAM_MAX_WIDTH` / `STREAM_MAX_HEIGHT` - Optional. Frame bounds.
//!   Default to `1280` x `720`.

use std::str::FromStr;
use thiserror::Error;

use crate::stream::{StreamMode, StreamingConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Plan-store tuning.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Maximum plan-stack depth before subgoal expansion is refused
    pub max_depth: usize,

    /// Advisory goal timeout in seconds
    pub goal_timeout_secs: i64,

    /// Advisory subgoal timeout in seconds
    pub subgoal_timeout_secs: i64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            goal_timeout_secs: 120,
            subgoal_timeout_secs: 30,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// LLM model identifier (OpenRouter format)
    pub model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// CDP URL of an already-running Chrome; when unset a headless instance
    /// is launched per session
    pub cdp_url: Option<String>,

    /// Plan-store tuning
    pub plan: PlanConfig,

    /// Frame-streaming defaults for new sessions
    pub stream: StreamingConfig,
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3100)?;

        let cdp_url = std::env::var("BROWSER_CDP_URL").ok();

        let plan = PlanConfig {
            max_depth: env_parse("PLAN_MAX_DEPTH", 3)?,
            goal_timeout_secs: env_parse("GOAL_TIMEOUT_SECS", 120)?,
            subgoal_timeout_secs: env_parse("SUBGOAL_TIMEOUT_SECS", 30)?,
        };

        let stream = StreamingConfig {
            mode: env_parse("STREAM_MODE", StreamMode::Push)?,
            target_fps: env_parse("STREAM_FPS", 15)?,
            quality: env_parse("STREAM_QUALITY", 70)?,
            max_width: env_parse("STREAM_MAX_WIDTH", 1280)?,
            max_height: env_parse("STREAM_MAX_HEIGHT", 720)?,
        }
        .clamped();

        Ok(Self {
            api_key,
            model,
            host,
            port,
            cdp_url,
            plan,
            stream,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            host: "127.0.0.1".to_string(),
            port: 3100,
            cdp_url: None,
            plan: PlanConfig::default(),
            stream: StreamingConfig::default(),
        }
    }
}
