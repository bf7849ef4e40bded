use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;

/// Tunables for column type inference. Thresholds are heuristics and stay
/// configurable rather than hard constants.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Fraction of non-null values that must parse as numbers.
    pub numeric_threshold: f64,
    /// Fraction of non-null values that must match a date pattern.
    pub datetime_threshold: f64,
    /// A column is categorical when distinct/non-null is below this ratio.
    pub categorical_ratio: f64,
    /// Frequency table truncation for categorical columns.
    pub top_k: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            numeric_threshold: 0.9,
            datetime_threshold: 0.9,
            categorical_ratio: 0.5,
            top_k: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InsightConfig {
    /// Cap on raw sample rows embedded in the prompt.
    pub prompt_sample_rows: usize,
    /// Per-call ceiling on the completion request.
    pub timeout: Duration,
    /// Fixed pause before the single retry on a transient failure.
    pub retry_backoff: Duration,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            prompt_sample_rows: 20,
            timeout: Duration::from_secs(45),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChartConfig {
    pub histogram_buckets: usize,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openai_key: String,
    pub openai_model: String,
    /// Upload ceiling in bytes.
    pub max_file_size: usize,
    /// JSON body ceiling for the text endpoint.
    pub max_json_body: usize,
    /// Row ceiling applied by the ingestor.
    pub max_rows: usize,
    /// Records sampled when deriving the column set of inline input.
    pub schema_sample_rows: usize,
    pub profiler: ProfilerConfig,
    pub insight: InsightConfig,
    pub charts: ChartConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            openai_key: String::new(),
            openai_model: "gpt-4o-mini".to_string(),
            max_file_size: 10 * 1024 * 1024,
            max_json_body: 1024 * 1024,
            max_rows: 100_000,
            schema_sample_rows: 100,
            profiler: ProfilerConfig::default(),
            insight: InsightConfig::default(),
            charts: ChartConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        // Load .env file first
        dotenv().ok();

        let openai_key = std::env::var("OPENAI_API_KEY")
            .map_err(|e| anyhow::anyhow!("Failed to load OPENAI_API_KEY: {}", e))?;

        let defaults = Config::default();
        Ok(Config {
            port: env_or("PORT", defaults.port),
            openai_key,
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            max_json_body: env_or("MAX_JSON_BODY", defaults.max_json_body),
            max_rows: env_or("MAX_ROWS", defaults.max_rows),
            schema_sample_rows: env_or("SCHEMA_SAMPLE_ROWS", defaults.schema_sample_rows),
            profiler: ProfilerConfig {
                numeric_threshold: env_or("NUMERIC_THRESHOLD", 0.9),
                datetime_threshold: env_or("DATETIME_THRESHOLD", 0.9),
                categorical_ratio: env_or("CATEGORICAL_RATIO", 0.5),
                top_k: env_or("CATEGORICAL_TOP_K", 10),
            },
            insight: InsightConfig {
                prompt_sample_rows: env_or("PROMPT_SAMPLE_ROWS", 20),
                timeout: Duration::from_secs(env_or("LLM_TIMEOUT_SECS", 45)),
                retry_backoff: Duration::from_millis(env_or("LLM_RETRY_BACKOFF_MS", 500)),
            },
            charts: ChartConfig {
                histogram_buckets: env_or("HISTOGRAM_BUCKETS", 10),
            },
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
