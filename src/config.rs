use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::collaborator::openai::{normalize_endpoint, OpenAiConfig};
use crate::logging::LogSettings;
use crate::services::catalog::{Catalog, CatalogError};
use crate::services::composer::SessionLimits;

const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_API_ENDPOINT: &str = "https://api.deepseek.com/v1";
const DEFAULT_LLM_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_LOG_DIR: &str = "./logs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
}

/// Orchestrator-facing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub limits: SessionLimits,
    /// Silence window before a proactive turn.
    pub idle_timeout: Duration,
    /// Pause between turns in auto-advance mode.
    pub auto_advance_delay: Duration,
    /// Delay at `Completed` before moving to the next queued item.
    pub countdown: Duration,
    /// Upper bound on one collaborator turn.
    pub turn_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            idle_timeout: Duration::from_secs(30),
            auto_advance_delay: Duration::from_secs(5),
            countdown: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log: LogSettings,
    /// `None` keeps all state in memory.
    pub database_path: Option<PathBuf>,
    /// `None` uses the built-in word list.
    pub catalog_path: Option<PathBuf>,
    pub llm: OpenAiConfig,
    pub llm_mock: bool,
    pub session: SessionSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env_parse::<u16>("PORT").unwrap_or(3000);

        let host = env_parse::<IpAddr>("HOST").unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log = LogSettings {
            filter: env_string("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            file_dir: env_bool("ENABLE_FILE_LOGS")
                .then(|| PathBuf::from(env_string("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()))),
        };

        let llm = OpenAiConfig {
            api_key: env_string("LLM_API_KEY"),
            model: env_string("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_endpoint: normalize_endpoint(
                &env_string("LLM_API_ENDPOINT").unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            ),
            timeout: Duration::from_millis(env_parse("LLM_TIMEOUT").unwrap_or(DEFAULT_LLM_TIMEOUT_MS)),
        };

        let defaults = SessionSettings::default();
        let limits = SessionLimits {
            max_reviews: env_parse("SESSION_MAX_REVIEWS").unwrap_or(defaults.limits.max_reviews),
            max_new_per_session: env_parse("SESSION_MAX_NEW").unwrap_or(defaults.limits.max_new_per_session),
            max_total: env_parse("SESSION_MAX_TOTAL").unwrap_or(defaults.limits.max_total),
        };
        let session = SessionSettings {
            limits,
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            auto_advance_delay: env_secs("AUTO_ADVANCE_DELAY_SECS").unwrap_or(defaults.auto_advance_delay),
            countdown: env_secs("COUNTDOWN_SECS").unwrap_or(defaults.countdown),
            turn_timeout: env_secs("TURN_TIMEOUT_SECS").unwrap_or(defaults.turn_timeout),
        };

        Self {
            host,
            port,
            log,
            database_path: env_string("DATABASE_PATH").map(PathBuf::from),
            catalog_path: env_string("CATALOG_PATH").map(PathBuf::from),
            llm,
            llm_mock: env_bool("LLM_MOCK"),
            session,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn load_catalog(&self) -> Result<Catalog, ConfigError> {
        match &self.catalog_path {
            Some(path) => Ok(Catalog::from_json_file(path)?),
            None => Ok(Catalog::builtin()),
        }
    }

    /// Scripted collaborator when mocked or when no API key is set.
    pub fn use_scripted_collaborator(&self) -> bool {
        self.llm_mock || !self.llm.is_available()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key)?.trim().parse().ok()
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_bool(key: &str) -> bool {
    env_string(key).is_some_and(|v| v == "true" || v == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SessionSettings::default();
        assert_eq!(settings.limits.max_reviews, 15);
        assert_eq!(settings.limits.max_new_per_session, 5);
        assert_eq!(settings.limits.max_total, 20);
        assert_eq!(settings.idle_timeout, Duration::from_secs(30));
        assert_eq!(settings.countdown, Duration::from_secs(5));
    }

    #[test]
    fn scripted_collaborator_without_key() {
        let config = Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            log: LogSettings {
                filter: "info".into(),
                file_dir: None,
            },
            database_path: None,
            catalog_path: None,
            llm: OpenAiConfig {
                api_key: None,
                model: DEFAULT_MODEL.into(),
                api_endpoint: DEFAULT_API_ENDPOINT.into(),
                timeout: Duration::from_millis(DEFAULT_LLM_TIMEOUT_MS),
            },
            llm_mock: false,
            session: SessionSettings::default(),
        };
        assert!(config.use_scripted_collaborator());
        assert_eq!(config.bind_addr().port(), 3000);
        assert!(!config.load_catalog().unwrap().is_empty());
    }

    #[test]
    fn missing_catalog_file_is_reported() {
        let config = Config {
            catalog_path: Some(PathBuf::from("/nonexistent/words.json")),
            ..Config::from_env()
        };
        assert!(matches!(config.load_catalog(), Err(ConfigError::Catalog(CatalogError::Io(_)))));
    }
}
