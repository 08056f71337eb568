// Relay server settings, read once at startup from `EASEL_RELAY_*`
// environment variables. Pool sizing lives in `db::pool`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEV_JWT_SECRET: &str = "easel_local_development_jwt_secret_must_be_32_chars";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
const DEFAULT_PORT: u16 = 8080;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    pub token_ttl_secs: i64,
    /// `None` selects the in-memory canvas store.
    pub database_url: Option<String>,
    /// `*` or a comma-separated origin list; see `cors::cors_layer`.
    pub cors_origins: Option<String>,
    /// `EnvFilter` directive, e.g. `info,easel_relay=debug`.
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// | Variable | Default |
    /// |---|---|
    /// | `EASEL_RELAY_HOST` | `0.0.0.0` |
    /// | `EASEL_RELAY_PORT` | `8080` |
    /// | `EASEL_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `EASEL_RELAY_TOKEN_TTL_SECS` | `86400` |
    /// | `EASEL_RELAY_DATABASE_URL` | unset (in-memory store) |
    /// | `EASEL_RELAY_CORS_ORIGINS` | unset (local front-end origins) |
    /// | `EASEL_RELAY_LOG_FILTER` | `info` |
    /// | `EASEL_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let setting = |key: &str| lookup(key).map(|value| value.trim().to_owned());
        let non_empty = |key: &str| setting(key).filter(|value| !value.is_empty());

        let ip = non_empty("EASEL_RELAY_HOST")
            .and_then(|host| host.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = setting("EASEL_RELAY_PORT")
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let token_ttl_secs = setting("EASEL_RELAY_TOKEN_TTL_SECS")
            .and_then(|ttl| ttl.parse::<i64>().ok())
            .filter(|ttl| *ttl > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        let log_format = match setting("EASEL_RELAY_LOG_FORMAT") {
            Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr: SocketAddr::new(ip, port),
            jwt_secret: non_empty("EASEL_RELAY_JWT_SECRET")
                .unwrap_or_else(|| DEV_JWT_SECRET.to_owned()),
            token_ttl_secs,
            database_url: non_empty("EASEL_RELAY_DATABASE_URL"),
            cors_origins: non_empty("EASEL_RELAY_CORS_ORIGINS"),
            log_filter: non_empty("EASEL_RELAY_LOG_FILTER").unwrap_or_else(|| "info".to_owned()),
            log_format,
        }
    }

    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
