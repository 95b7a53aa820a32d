use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// When set, outbound error messages keep internal detail.
    pub dev_mode: bool,
    /// Fixes the watermark wrapper-selection RNG; unset in production.
    pub watermark_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            dev_mode: std::env::var("DEV_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            watermark_seed: std::env::var("WATERMARK_SEED")
                .ok()
                .map(|v| v.parse::<u64>().context("WATERMARK_SEED must be a u64"))
                .transpose()?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
