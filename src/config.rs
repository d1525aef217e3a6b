use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub public_base_url: Option<String>,
    pub webhook_rps: u32,
    pub webhook_verify_signature: bool,
    pub kobo_webhook_secret: Option<String>,
    pub max_payload_size: usize,
    pub kobo_polling_interval: Duration,
    pub kobo_batch_size: u32,
    pub checkpoint_path: PathBuf,
    pub retry_backoff: BackoffStrategy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env_opt("DATABASE_URL"),
            jwt_secret: get_env("JWT_SECRET")?,
            public_base_url: get_env_opt("PUBLIC_BASE_URL"),
            webhook_rps: get_env_parse_or("WEBHOOK_RPS", 50)?,
            webhook_verify_signature: get_env_parse_or("WEBHOOK_VERIFY_SIGNATURE", true)?,
            kobo_webhook_secret: get_env_opt("KOBO_WEBHOOK_SECRET"),
            max_payload_size: get_env_parse_or("MAX_PAYLOAD_SIZE", DEFAULT_MAX_PAYLOAD_SIZE)?,
            kobo_polling_interval: Duration::from_secs(get_env_parse_or(
                "KOBO_POLLING_INTERVAL_SECS",
                30u64,
            )?),
            kobo_batch_size: get_env_parse_or("KOBO_BATCH_SIZE", 50)?,
            checkpoint_path: get_env_opt("CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/checkpoints.json")),
            retry_backoff: get_env_parse_or("RETRY_BACKOFF", BackoffStrategy::Fixed)?,
        })
    }

    /// Settings suitable for tests and local runs: in-memory storage, no signature check.
    pub fn for_tests() -> Self {
        Self {
            server_address: "127.0.0.1:0".to_string(),
            database_url: None,
            jwt_secret: "test_secret_key".to_string(),
            public_base_url: None,
            webhook_rps: 1_000,
            webhook_verify_signature: false,
            kobo_webhook_secret: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            kobo_polling_interval: Duration::from_secs(30),
            kobo_batch_size: 50,
            checkpoint_path: std::env::temp_dir()
                .join(format!("kobo-relay-{}.json", uuid::Uuid::new_v4())),
            retry_backoff: BackoffStrategy::Fixed,
        }
    }

    pub fn webhook_url(&self) -> String {
        let base = self
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.server_address));
        format!("{}/kobo-webhook", base.trim_end_matches('/'))
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get_env_opt(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        None => Ok(default),
    }
}
