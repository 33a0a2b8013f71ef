//! Configuration management for the NL-to-SQL agent.
//!
//! Configuration is read from environment variables (the binaries load a
//! `.env` file into the environment first):
//! - `NEBIUS_API_KEY` - Required. API key for the model and embedding endpoints.
//! - `LLM_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to Nebius AI Studio.
//! - `AGENT_MODEL` - Optional. Fine-tuned model identifier used by the agent.
//! - `LLM_TEMPERATURE` / `LLM_MAX_TOKENS` / `LLM_TIMEOUT_SECS` - Optional sampling and timeout knobs.
//! - `EMBED_BASE_URL` - Optional. Defaults to `LLM_BASE_URL`.
//! - `EMBED_MODEL` - Optional. Defaults to `BAAI/bge-en-icl`.
//! - `EMBED_TIMEOUT_SECS` - Optional. Defaults to `30`.
//! - `TRANSPORT_MAX_ATTEMPTS` - Optional. Attempts per network call. Defaults to `3`.
//! - `DATABASE_PATH` - Optional. SQLite sales database. Defaults to `data/sales_database.db`.
//! - `SCHEMA_INDEX_PATH` - Optional. SQLite vector index. Defaults to `data/schema_index.db`.
//! - `SCHEMA_COLLECTION` / `SCHEMA_TOP_K` - Optional. Collection name and match count.
//! - `SQL_MAX_ROWS` - Optional. Row cap for rendered query results. Defaults to `200`.
//! - `MAX_STEPS` / `MAX_PROTOCOL_RETRIES` - Optional. Agent loop budgets.
//! - `REQUIRE_SCHEMA_LOOKUP` - Optional. Reject SQL before a schema lookup. Defaults to `false`.
//! - `HOST` / `PORT` - Optional. HTTP bind address. Defaults to `127.0.0.1:3000`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.studio.nebius.com/v1";
pub const DEFAULT_AGENT_MODEL: &str =
    "meta-llama/Meta-Llama-3.1-8B-Instruct-LoRa:nl-to-sql-finetuned-jbkN";
pub const DEFAULT_EMBED_MODEL: &str = "BAAI/bge-en-icl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Completion endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL (without `/chat/completions`)
    pub base_url: String,

    /// Model identifier sent with every request
    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_AGENT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Schema retrieval settings: embedding endpoint plus vector index location.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub embed_base_url: String,

    pub embed_model: String,

    pub embed_timeout: Duration,

    /// SQLite file holding the embedded schema documents
    pub index_path: PathBuf,

    /// Collection inside the index file
    pub collection: String,

    /// Number of documents returned per lookup
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embed_base_url: DEFAULT_BASE_URL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            embed_timeout: Duration::from_secs(30),
            index_path: PathBuf::from("data/schema_index.db"),
            collection: "schema_kb".to_string(),
            top_k: 2,
        }
    }
}

/// Agent loop budgets and policy switches.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum model calls per turn
    pub max_steps: usize,

    /// Maximum protocol errors tolerated per turn
    pub max_protocol_retries: usize,

    /// Reject `execute_sql_query` until a schema lookup happened in the turn
    pub require_schema_lookup: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_protocol_retries: 3,
            require_schema_lookup: false,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the model and embedding endpoints
    pub api_key: String,

    pub llm: LlmConfig,

    pub retrieval: RetrievalConfig,

    pub agent: AgentConfig,

    /// Retry policy shared by the model and embedding clients
    pub transport: RetryPolicy,

    /// SQLite sales database queried by `execute_sql_query`
    pub database_path: PathBuf,

    /// Row cap for rendered query results
    pub sql_max_rows: usize,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `NEBIUS_API_KEY` is not set, and
    /// `ConfigError::InvalidValue` for any variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("NEBIUS_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("NEBIUS_API_KEY".to_string()))?;

        let base_url = env_or("LLM_BASE_URL", DEFAULT_BASE_URL);

        let llm = LlmConfig {
            base_url: base_url.clone(),
            model: env_or("AGENT_MODEL", DEFAULT_AGENT_MODEL),
            temperature: env_parse("LLM_TEMPERATURE", 0.0)?,
            max_tokens: env_parse("LLM_MAX_TOKENS", 1024)?,
            timeout: Duration::from_secs(nonzero(
                "LLM_TIMEOUT_SECS",
                env_parse("LLM_TIMEOUT_SECS", 60)?,
            )?),
        };

        let retrieval = RetrievalConfig {
            embed_base_url: env_or("EMBED_BASE_URL", &base_url),
            embed_model: env_or("EMBED_MODEL", DEFAULT_EMBED_MODEL),
            embed_timeout: Duration::from_secs(nonzero(
                "EMBED_TIMEOUT_SECS",
                env_parse("EMBED_TIMEOUT_SECS", 30)?,
            )?),
            index_path: PathBuf::from(env_or("SCHEMA_INDEX_PATH", "data/schema_index.db")),
            collection: env_or("SCHEMA_COLLECTION", "schema_kb"),
            top_k: nonzero("SCHEMA_TOP_K", env_parse("SCHEMA_TOP_K", 2)?)?,
        };

        let require_schema_lookup = std::env::var("REQUIRE_SCHEMA_LOOKUP")
            .ok()
            .map(|v| {
                parse_bool(&v)
                    .map_err(|e| ConfigError::InvalidValue("REQUIRE_SCHEMA_LOOKUP".to_string(), e))
            })
            .transpose()?
            .unwrap_or(false);

        let agent = AgentConfig {
            max_steps: nonzero("MAX_STEPS", env_parse("MAX_STEPS", 10)?)?,
            max_protocol_retries: env_parse("MAX_PROTOCOL_RETRIES", 3)?,
            require_schema_lookup,
        };

        let max_attempts: u32 = nonzero(
            "TRANSPORT_MAX_ATTEMPTS",
            env_parse("TRANSPORT_MAX_ATTEMPTS", 3)?,
        )?;
        let transport = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };

        Ok(Self {
            api_key,
            llm,
            retrieval,
            agent,
            transport,
            database_path: PathBuf::from(env_or("DATABASE_PATH", "data/sales_database.db")),
            sql_max_rows: env_parse("SQL_MAX_ROWS", 200)?,
            host: env_or("HOST", "127.0.0.1"),
            port: env_parse("PORT", 3000)?,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            agent: AgentConfig::default(),
            transport: RetryPolicy::default(),
            database_path: PathBuf::from("data/sales_database.db"),
            sql_max_rows: 200,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Reject a zero count or timeout.
fn nonzero<T>(name: &str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be at least 1".to_string(),
        ));
    }
    Ok(value)
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Ok(true));
        assert_eq!(parse_bool("off"), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn new_uses_documented_defaults() {
        let config = Config::new("key".to_string());
        assert_eq!(config.retrieval.top_k, 2);
        assert_eq!(config.retrieval.collection, "schema_kb");
        assert_eq!(config.agent.max_steps, 10);
        assert!(!config.agent.require_schema_lookup);
        assert_eq!(config.llm.model, DEFAULT_AGENT_MODEL);
        assert_eq!(config.transport.max_attempts, 3);
    }

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        let value: usize = env_parse("NL_SQL_AGENT_TEST_SURELY_UNSET", 7).expect("default");
        assert_eq!(value, 7);
    }

    #[test]
    fn env_parse_reads_and_rejects_set_values() {
        std::env::set_var("NL_SQL_AGENT_TEST_PARSE_OK", " 12 ");
        let value: usize = env_parse("NL_SQL_AGENT_TEST_PARSE_OK", 7).expect("parsed");
        assert_eq!(value, 12);

        std::env::set_var("NL_SQL_AGENT_TEST_PARSE_BAD", "twelve");
        let err = env_parse::<usize>("NL_SQL_AGENT_TEST_PARSE_BAD", 7).unwrap_err();
        match err {
            ConfigError::InvalidValue(name, _) => assert_eq!(name, "NL_SQL_AGENT_TEST_PARSE_BAD"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_counts_and_timeouts_are_rejected() {
        for name in ["SCHEMA_TOP_K", "MAX_STEPS"] {
            let err = nonzero(name, 0usize).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue(ref n, _) if n == name));
        }
        assert!(nonzero("TRANSPORT_MAX_ATTEMPTS", 0u32).is_err());
        assert!(nonzero("LLM_TIMEOUT_SECS", 0u64).is_err());
        assert!(nonzero("EMBED_TIMEOUT_SECS", 0u64).is_err());
        assert_eq!(nonzero("MAX_STEPS", 10usize).expect("positive"), 10);
    }
}
