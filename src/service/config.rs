use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "0.0.0.0:8080";
const DEFAULT_SUBSCRIBERS: &str = "reconciler";
const DEFAULT_CONSUMER_ID: &str = "reconciler";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DEDUP_TTL_SECONDS: u64 = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_WORKER_COUNT: usize = 4;

/// Process configuration read from the environment (and `.env`, once loaded).
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub endpoint: String,
    pub subscribers: Vec<String>,
    pub consumer_id: String,
    pub db_max_connections: u32,
    pub dedup_ttl: Duration,
    pub poll_interval: Duration,
    /// Reconciler tasks sharing one consumer id.
    pub worker_count: usize,
}

fn var_or(key: &str, default: &str) -> String {
    dotenvy::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match dotenvy::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {}='{}': {}", key, value, err)),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = dotenvy::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let subscribers = var_or("SUBSCRIBERS", DEFAULT_SUBSCRIBERS)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            endpoint: var_or("ENDPOINT", DEFAULT_ENDPOINT),
            subscribers,
            consumer_id: var_or("CONSUMER_ID", DEFAULT_CONSUMER_ID),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            dedup_ttl: Duration::from_secs(parse_var(
                "DEDUP_TTL_SECONDS",
                DEFAULT_DEDUP_TTL_SECONDS,
            )?),
            poll_interval: Duration::from_millis(parse_var(
                "POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            worker_count: parse_var("WORKER_COUNT", DEFAULT_WORKER_COUNT)?.max(1),
        })
    }
}
