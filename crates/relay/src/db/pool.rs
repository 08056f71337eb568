use std::{env, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

/// Connection limits for the canvas store pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_connections: 2, max_connections: 20, acquire_timeout: Duration::from_secs(10) }
    }
}

impl PoolConfig {
    /// Reads `EASEL_RELAY_DB_{MIN_CONNECTIONS,MAX_CONNECTIONS,ACQUIRE_TIMEOUT_SECS}`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let min_connections =
            number_or(&lookup, "EASEL_RELAY_DB_MIN_CONNECTIONS", defaults.min_connections);
        // A max below the min would make sqlx refuse to build the pool.
        let max_connections =
            number_or(&lookup, "EASEL_RELAY_DB_MAX_CONNECTIONS", defaults.max_connections)
                .max(min_connections);
        let acquire_timeout = number_or(
            &lookup,
            "EASEL_RELAY_DB_ACQUIRE_TIMEOUT_SECS",
            defaults.acquire_timeout.as_secs(),
        );

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout),
        }
    }
}

fn number_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable pool setting");
            default
        }),
        None => default,
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(database_url)
        .context("canvas store DATABASE_URL is not a valid PostgreSQL url")?;
    require_tls_for_remote_host(&options)?;

    tracing::debug!(
        host = options.get_host(),
        min = config.min_connections,
        max = config.max_connections,
        "connecting canvas store pool"
    );
    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .context("failed to connect to canvas store PostgreSQL")
}

/// Loopback hosts may connect in plain text; anything else needs `sslmode=require` or stricter.
fn require_tls_for_remote_host(options: &PgConnectOptions) -> Result<()> {
    let host = options.get_host();
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return Ok(());
    }

    let mode = options.get_ssl_mode();
    if !matches!(mode, PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull) {
        bail!("canvas store connection to {host} must require TLS (sslmode={mode:?})");
    }
    Ok(())
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    let one = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("canvas store PostgreSQL health check failed")?;
    if one != 1 {
        bail!("canvas store PostgreSQL health check returned {one}");
    }
    Ok(())
}
