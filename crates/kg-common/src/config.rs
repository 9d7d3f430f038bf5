use std::env;
use std::time::Duration;

/// Recognized environment configuration (§6). Loaded once at process start
/// and passed down as an explicit collaborator — no implicit globals (§9).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub group_id_default: String,

    pub queue_url: String,
    pub use_queue_for_ingestion: bool,

    pub llm_provider_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_small_model: String,

    pub embed_provider_url: String,
    pub embed_model: String,
    pub embed_dimension: usize,

    pub graph_uri: String,
    pub graph_user: String,
    pub graph_password: String,
    pub graph_database: String,

    pub sim_high: f64,
    pub name_exact: f64,
    pub edge_sim: f64,
    pub enable_cross_graph_deduplication: bool,

    pub worker_parallelism: usize,
    pub batch_size: u32,
    pub visibility_timeout: Duration,
    pub task_deadline: Duration,

    pub webhook_url: Option<String>,

    pub sync_enable_continuous: bool,
    pub sync_interval: Duration,
    pub sync_full_on_startup: bool,

    pub bind_addr: String,
    pub log_format: LogFormat,

    pub feedback_commit_window: Duration,
    pub feedback_alpha: f64,

    pub dead_letter_table: String,
    pub dead_letter_sweep_interval: Duration,
    pub centrality_enabled: bool,

    pub graph_secondary_uri: Option<String>,
    pub graph_secondary_user: Option<String>,
    pub graph_secondary_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl AppConfig {
    /// Load configuration from environment variables, applying the defaults
    /// named throughout SPEC_FULL.md §6. Panics with a clear message if a
    /// required variable is missing.
    pub fn from_env() -> Self {
        Self {
            group_id_default: env::var("GROUP_ID_DEFAULT").unwrap_or_else(|_| "default".into()),

            queue_url: env::var("QUEUE_URL").unwrap_or_else(|_| "postgres://localhost/kg".into()),
            use_queue_for_ingestion: bool_env("USE_QUEUE_FOR_INGESTION", true),

            llm_provider_url: env::var("LLM_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),
            llm_api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".into()),
            llm_small_model: env::var("LLM_SMALL_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5".into()),

            embed_provider_url: env::var("EMBED_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.voyageai.com/v1".into()),
            embed_model: env::var("EMBED_MODEL").unwrap_or_else(|_| "voyage-3".into()),
            embed_dimension: usize_env("EMBED_DIMENSION", 1024),

            graph_uri: required_env("GRAPH_URI"),
            graph_user: required_env("GRAPH_USER"),
            graph_password: required_env("GRAPH_PASSWORD"),
            graph_database: env::var("GRAPH_DATABASE").unwrap_or_else(|_| "neo4j".into()),

            sim_high: f64_env("SIM_HIGH", 0.92),
            name_exact: f64_env("NAME_EXACT", 0.95),
            edge_sim: f64_env("EDGE_SIM", 0.95),
            enable_cross_graph_deduplication: bool_env(
                "ENABLE_CROSS_GRAPH_DEDUPLICATION",
                false,
            ),

            worker_parallelism: usize_env("WORKER_PARALLELISM", 8),
            batch_size: usize_env("BATCH_SIZE", 10) as u32,
            visibility_timeout: Duration::from_secs(usize_env("VISIBILITY_TIMEOUT", 300) as u64),
            task_deadline: Duration::from_secs(usize_env("TASK_DEADLINE_SECS", 300) as u64),

            webhook_url: env::var("WEBHOOK_URL").ok(),

            sync_enable_continuous: bool_env("SYNC_ENABLE_CONTINUOUS", false),
            sync_interval: Duration::from_secs(usize_env("SYNC_INTERVAL_SECONDS", 60) as u64),
            sync_full_on_startup: bool_env("SYNC_FULL_ON_STARTUP", false),

            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into()),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },

            feedback_commit_window: Duration::from_millis(
                usize_env("FEEDBACK_COMMIT_WINDOW_MS", 1000) as u64,
            ),
            feedback_alpha: f64_env("FEEDBACK_ALPHA", 0.2),

            dead_letter_table: env::var("DEAD_LETTER_TABLE")
                .unwrap_or_else(|_| "dead_letter_tasks".into()),
            dead_letter_sweep_interval: Duration::from_secs(
                usize_env("DEAD_LETTER_SWEEP_INTERVAL_SECS", 60) as u64,
            ),
            centrality_enabled: bool_env("CENTRALITY_ENABLED", true),

            graph_secondary_uri: env::var("GRAPH_SECONDARY_URI").ok(),
            graph_secondary_user: env::var("GRAPH_SECONDARY_USER").ok(),
            graph_secondary_password: env::var("GRAPH_SECONDARY_PASSWORD").ok(),
        }
    }

    /// Log presence/length of sensitive values without leaking them.
    pub fn log_keys(&self) {
        let vars = [
            ("LLM_API_KEY", &self.llm_api_key),
            ("GRAPH_PASSWORD", &self.graph_password),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!(name, "config key not set");
            } else {
                tracing::info!(name, chars = value.len(), "config key set");
            }
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn f64_env(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_parses_or_defaults() {
        std::env::remove_var("KG_TEST_BOOL_UNSET");
        assert!(bool_env("KG_TEST_BOOL_UNSET", true));
        std::env::set_var("KG_TEST_BOOL_SET", "false");
        assert!(!bool_env("KG_TEST_BOOL_SET", true));
        std::env::remove_var("KG_TEST_BOOL_SET");
    }

    #[test]
    fn f64_env_parses_or_defaults() {
        std::env::remove_var("KG_TEST_F64_UNSET");
        assert_eq!(f64_env("KG_TEST_F64_UNSET", 0.92), 0.92);
    }
}
