//! Configuration for the memory engine
//!
//! Environment-driven configuration with validated defaults. Startup fails
//! fast when required settings (the LLM API key) are missing; everything
//! else has a working default.

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Top-level configuration for the memory engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub context: ContextConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cold_path: ColdPathConfig,
    pub rag: RagConfig,
    pub echo: EchoConfig,
    pub state: StateConfig,
    pub stores: StoreConfig,
}

/// Hot-path context pressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Working-buffer capacity in estimated tokens.
    pub max_context_tokens: usize,
    /// Fraction of capacity at which relief triggers.
    pub offload_threshold: f64,
    /// Fraction of capacity relief sheds down to.
    pub target_after_relief: f64,
    /// Fraction below which relief will not re-trigger after a prior relief.
    pub hysteresis_threshold: f64,
    /// Domain tag attached to offload jobs from this session.
    pub domain: String,
    /// Logical flow id attached to offload jobs from this session.
    pub thread_id: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 4096,
            offload_threshold: 0.80,
            target_after_relief: 0.60,
            hysteresis_threshold: 0.70,
            domain: "general".to_string(),
            thread_id: "default_flow".to_string(),
        }
    }
}

/// External LLM endpoint settings (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "mistralai/mistral-7b-instruct".to_string(),
            timeout_secs: 90,
            max_tokens: 500,
            temperature: 0.3,
        }
    }
}

/// Embedding endpoint settings (OpenAI-compatible `/embeddings`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434/v1/embeddings".to_string(),
            api_key: None,
            model: "snowflake-arctic-embed-l-v2.0".to_string(),
            dimension: 1024,
            timeout_secs: 30,
        }
    }
}

/// Cold-path worker and sleep-cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdPathConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub max_queue_size: usize,
    /// Seconds between sleep-cycle consolidation passes.
    pub sleep_cycle_interval_secs: u64,
    /// Minimum event age in seconds before consolidation.
    pub consolidation_age_secs: u64,
    /// Events consolidated into one MacroEvent per group.
    pub consolidation_group_size: usize,
    /// Maximum events scanned per consolidation pass.
    pub consolidation_scan_limit: usize,
}

impl Default for ColdPathConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            workers: 4,
            max_queue_size: 100,
            sleep_cycle_interval_secs: 60,
            consolidation_age_secs: 3600,
            consolidation_group_size: 5,
            consolidation_scan_limit: 10,
        }
    }
}

/// Hybrid retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub top_k_semantic: usize,
    pub top_k_relational: usize,
    /// Minimum cosine similarity for vector hits.
    pub score_threshold: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k_semantic: 10,
            top_k_relational: 5,
            score_threshold: 0.4,
        }
    }
}

/// Echo-guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    pub enabled: bool,
    /// Cosine similarity at or above which a response counts as an echo.
    pub similarity_threshold: f32,
    /// Recent response embeddings kept for comparison.
    pub history_size: usize,
    pub max_regeneration_attempts: u32,
    /// Retry number (1-based) on which retrieved/state overlays are stripped.
    pub strip_context_on_retry: u32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            history_size: 10,
            max_regeneration_attempts: 3,
            strip_context_on_retry: 3,
        }
    }
}

/// Per-kind limits on how many states are injected into context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateInjectionLimits {
    pub goal: usize,
    pub task: usize,
    pub decision: usize,
    pub fact: usize,
}

impl Default for StateInjectionLimits {
    fn default() -> Self {
        Self {
            goal: 2,
            task: 3,
            decision: 2,
            fact: 3,
        }
    }
}

/// State tracking and boredom detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub tracking_enabled: bool,
    pub injection_limits: StateInjectionLimits,
    pub boredom_enabled: bool,
    /// Visit count above which a state is considered fatigued.
    pub boredom_threshold: u64,
    /// Number of alternative focus suggestions in the loop warning.
    pub alternative_count: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            injection_limits: StateInjectionLimits::default(),
            boredom_enabled: true,
            boredom_threshold: 5,
            alternative_count: 3,
        }
    }
}

/// External store endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: String,
    /// TTL on `chunk:<job_id>` keys, in seconds.
    pub chunk_ttl_secs: i64,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    #[serde(skip_serializing)]
    pub neo4j_password: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            chunk_ttl_secs: 86_400,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_collection: "vicw_memory".to_string(),
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            cold_path: ColdPathConfig::default(),
            rag: RagConfig::default(),
            echo: EchoConfig::default(),
            state: StateConfig::default(),
            stores: StoreConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl MemoryConfig {
    /// Load configuration from environment variables, validating the result.
    /// Fails fast if `VICW_LLM_API_KEY` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = MemoryConfig::default();

        let api_key = env::var("VICW_LLM_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "VICW_LLM_API_KEY".to_string(),
            });
        }

        let config = Self {
            context: ContextConfig {
                max_context_tokens: env_parse(
                    "MAX_CONTEXT_TOKENS",
                    defaults.context.max_context_tokens,
                )?,
                offload_threshold: env_parse(
                    "OFFLOAD_THRESHOLD",
                    defaults.context.offload_threshold,
                )?,
                target_after_relief: env_parse(
                    "TARGET_AFTER_RELIEF",
                    defaults.context.target_after_relief,
                )?,
                hysteresis_threshold: env_parse(
                    "HYSTERESIS_THRESHOLD",
                    defaults.context.hysteresis_threshold,
                )?,
                domain: env_string("VICW_DOMAIN", &defaults.context.domain),
                thread_id: env_string("VICW_THREAD_ID", &defaults.context.thread_id),
            },
            llm: LlmConfig {
                api_url: env_string("VICW_LLM_API_URL", &defaults.llm.api_url),
                api_key,
                model: env_string("VICW_LLM_MODEL_NAME", &defaults.llm.model),
                timeout_secs: env_parse("LLM_TIMEOUT", defaults.llm.timeout_secs)?,
                max_tokens: env_parse("LLM_MAX_TOKENS", defaults.llm.max_tokens)?,
                temperature: env_parse("LLM_TEMPERATURE", defaults.llm.temperature)?,
            },
            embedding: EmbeddingConfig {
                api_url: env_string("EMBEDDING_API_URL", &defaults.embedding.api_url),
                api_key: env::var("EMBEDDING_API_KEY").ok().filter(|k| !k.is_empty()),
                model: env_string("EMBEDDING_MODEL_NAME", &defaults.embedding.model),
                dimension: env_parse("EMBEDDING_DIMENSION", defaults.embedding.dimension)?,
                timeout_secs: env_parse(
                    "EMBEDDING_TIMEOUT",
                    defaults.embedding.timeout_secs,
                )?,
            },
            cold_path: ColdPathConfig {
                batch_size: env_parse("COLD_PATH_BATCH_SIZE", defaults.cold_path.batch_size)?,
                workers: env_parse("COLD_PATH_WORKERS", defaults.cold_path.workers)?,
                max_queue_size: env_parse(
                    "MAX_OFFLOAD_QUEUE_SIZE",
                    defaults.cold_path.max_queue_size,
                )?,
                sleep_cycle_interval_secs: env_parse(
                    "SLEEP_CYCLE_INTERVAL",
                    defaults.cold_path.sleep_cycle_interval_secs,
                )?,
                consolidation_age_secs: env_parse(
                    "CONSOLIDATION_AGE",
                    defaults.cold_path.consolidation_age_secs,
                )?,
                consolidation_group_size: defaults.cold_path.consolidation_group_size,
                consolidation_scan_limit: defaults.cold_path.consolidation_scan_limit,
            },
            rag: RagConfig {
                top_k_semantic: env_parse("RAG_TOP_K_SEMANTIC", defaults.rag.top_k_semantic)?,
                top_k_relational: env_parse(
                    "RAG_TOP_K_RELATIONAL",
                    defaults.rag.top_k_relational,
                )?,
                score_threshold: env_parse("RAG_SCORE_THRESHOLD", defaults.rag.score_threshold)?,
            },
            echo: EchoConfig {
                enabled: env_bool("ECHO_GUARD_ENABLED", defaults.echo.enabled),
                similarity_threshold: env_parse(
                    "ECHO_SIMILARITY_THRESHOLD",
                    defaults.echo.similarity_threshold,
                )?,
                history_size: env_parse(
                    "ECHO_RESPONSE_HISTORY_SIZE",
                    defaults.echo.history_size,
                )?,
                max_regeneration_attempts: env_parse(
                    "MAX_REGENERATION_ATTEMPTS",
                    defaults.echo.max_regeneration_attempts,
                )?,
                strip_context_on_retry: env_parse(
                    "ECHO_STRIP_CONTEXT_ON_RETRY",
                    defaults.echo.strip_context_on_retry,
                )?,
            },
            state: StateConfig {
                tracking_enabled: env_bool(
                    "STATE_TRACKING_ENABLED",
                    defaults.state.tracking_enabled,
                ),
                injection_limits: StateInjectionLimits {
                    goal: env_parse("STATE_LIMIT_GOAL", defaults.state.injection_limits.goal)?,
                    task: env_parse("STATE_LIMIT_TASK", defaults.state.injection_limits.task)?,
                    decision: env_parse(
                        "STATE_LIMIT_DECISION",
                        defaults.state.injection_limits.decision,
                    )?,
                    fact: env_parse("STATE_LIMIT_FACT", defaults.state.injection_limits.fact)?,
                },
                boredom_enabled: env_bool(
                    "BOREDOM_DETECTION_ENABLED",
                    defaults.state.boredom_enabled,
                ),
                boredom_threshold: env_parse(
                    "BOREDOM_THRESHOLD",
                    defaults.state.boredom_threshold,
                )?,
                alternative_count: env_parse(
                    "BOREDOM_ALTERNATIVE_COUNT",
                    defaults.state.alternative_count,
                )?,
            },
            stores: StoreConfig {
                redis_url: env_string("REDIS_URL", &defaults.stores.redis_url),
                chunk_ttl_secs: env_parse("REDIS_CHUNK_TTL", defaults.stores.chunk_ttl_secs)?,
                qdrant_url: env_string("QDRANT_URL", &defaults.stores.qdrant_url),
                qdrant_collection: env_string(
                    "QDRANT_COLLECTION",
                    &defaults.stores.qdrant_collection,
                ),
                neo4j_uri: env_string("NEO4J_URI", &defaults.stores.neo4j_uri),
                neo4j_user: env_string("NEO4J_USER", &defaults.stores.neo4j_user),
                neo4j_password: env_string("NEO4J_PASSWORD", &defaults.stores.neo4j_password),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = |key: &str, value: f64| -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("{value} is outside [0.0, 1.0]"),
                });
            }
            Ok(())
        };

        ratio("OFFLOAD_THRESHOLD", self.context.offload_threshold)?;
        ratio("TARGET_AFTER_RELIEF", self.context.target_after_relief)?;
        ratio("HYSTERESIS_THRESHOLD", self.context.hysteresis_threshold)?;

        if self.context.target_after_relief >= self.context.offload_threshold {
            return Err(ConfigError::InvalidValue {
                key: "TARGET_AFTER_RELIEF".to_string(),
                reason: "relief target must be below the offload threshold".to_string(),
            });
        }
        if self.context.hysteresis_threshold > self.context.offload_threshold {
            return Err(ConfigError::InvalidValue {
                key: "HYSTERESIS_THRESHOLD".to_string(),
                reason: "hysteresis threshold must not exceed the offload threshold".to_string(),
            });
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMBEDDING_DIMENSION".to_string(),
                reason: "dimension must be positive".to_string(),
            });
        }
        if self.cold_path.workers == 0 || self.cold_path.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COLD_PATH_WORKERS".to_string(),
                reason: "worker count and batch size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Cap BLAS-family thread pools. Must run before any heavy numeric library
/// initializes its own pool.
pub fn apply_thread_caps(threads: usize) {
    let value = threads.max(1).to_string();
    for key in [
        "OMP_NUM_THREADS",
        "OPENBLAS_NUM_THREADS",
        "MKL_NUM_THREADS",
        "VECLIB_MAXIMUM_THREADS",
        "NUMEXPR_NUM_THREADS",
    ] {
        if env::var(key).is_err() {
            env::set_var(key, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn target_above_threshold_rejected() {
        let mut config = MemoryConfig::default();
        config.context.target_after_relief = 0.9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn ratio_out_of_range_rejected() {
        let mut config = MemoryConfig::default();
        config.context.offload_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_dimension_rejected() {
        let mut config = MemoryConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());
    }
}
