//! Environment-sourced gateway configuration
//!
//! Required: `DB_HOST`, `DB_USER`, `DB_NAME`. Everything else falls back to
//! the defaults below. Parsing goes through a lookup function so tests never
//! have to mutate the process environment.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use crate::error::ConfigError;

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_POOL_MAX: u32 = 100;
pub const DEFAULT_POOL_MIN: u32 = 2;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SERVICE_PORT: u16 = 50051;
pub const DEFAULT_RELAY_BUFFER: usize = 64;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    /// Idle connections older than this are recycled
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a free slot before failing with `PoolExhausted`
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_POOL_MIN,
            max: DEFAULT_POOL_MAX,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub port: u16,
    pub pool: PoolConfig,
}

impl DatabaseConfig {
    /// Connection options for sqlx
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .application_name("pgrelay")
    }
}

/// Per-subscription buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Capacity of the driver → relay event channel
    pub event_buffer: usize,
    /// Capacity of the relay → client outbound stream
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_RELAY_BUFFER,
            outbound_buffer: DEFAULT_RELAY_BUFFER,
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    /// Port the RPC service listens on
    pub port: u16,
    pub relay: RelayConfig,
    /// Bound for each listener teardown and for closing the pool at shutdown
    pub shutdown_timeout: Duration,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let pool = PoolConfig {
            min: env.parsed("DB_POOL_MIN", DEFAULT_POOL_MIN)?,
            max: env.parsed("DB_POOL_MAX", DEFAULT_POOL_MAX)?,
            idle_timeout: Duration::from_millis(
                env.parsed("DB_POOL_IDLE_TIMEOUT", DEFAULT_IDLE_TIMEOUT_MS)?,
            ),
            acquire_timeout: Duration::from_millis(
                env.parsed("DB_POOL_ACQUIRE_TIMEOUT", DEFAULT_ACQUIRE_TIMEOUT_MS)?,
            ),
        };

        if pool.max == 0 {
            return Err(ConfigError::Invalid {
                var: "DB_POOL_MAX",
                value: pool.max.to_string(),
                reason: "must be at least 1".into(),
            });
        }
        if pool.min > pool.max {
            return Err(ConfigError::Invalid {
                var: "DB_POOL_MIN",
                value: pool.min.to_string(),
                reason: format!("exceeds DB_POOL_MAX ({})", pool.max),
            });
        }

        let database = DatabaseConfig {
            host: env.required("DB_HOST")?,
            user: env.required("DB_USER")?,
            password: env.get("DB_PASSWORD").unwrap_or_default(),
            database: env.required("DB_NAME")?,
            port: env.parsed("DB_PORT", DEFAULT_DB_PORT)?,
            pool,
        };

        let buffer: usize = env.parsed("RELAY_BUFFER", DEFAULT_RELAY_BUFFER)?;
        if buffer == 0 {
            return Err(ConfigError::Invalid {
                var: "RELAY_BUFFER",
                value: buffer.to_string(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            database,
            port: env.parsed("PORT", DEFAULT_SERVICE_PORT)?,
            relay: RelayConfig {
                event_buffer: buffer,
                outbound_buffer: buffer,
            },
            shutdown_timeout: Duration::from_millis(
                env.parsed("SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_MS)?,
            ),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Empty values count as unset.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing { var })
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
