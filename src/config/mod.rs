//! Typed, validated configuration per deployment environment
//!
//! All parameters come from the process environment (with `.env` support in
//! development). Resolution happens once at startup; required production
//! values with no default fail fast with [`ConfigError`] before any pool or
//! monitor is built.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::pool::RetryPolicy;

/// Deployment environment discriminator, selected once at process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(ConfigError::Invalid {
                key: "APP_ENV",
                value: other.to_string(),
                reason: "expected development, production or test".to_string(),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fatal configuration failure; the process must not proceed to pool
/// creation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required configuration `{key}` is not set ({hint})")]
    Missing { key: &'static str, hint: &'static str },

    #[error("configuration `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// TLS posture for the primary datastore connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum TlsPolicy {
    Disabled,
    Required {
        accept_invalid_certs: bool,
        #[serde(skip_serializing)]
        ca_cert: Option<String>,
    },
}

/// Primary datastore connection and pool parameters
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub pool_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls: TlsPolicy,
}

impl DatabaseConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Secondary cache/session store connection parameters
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database_index: u32,
    pub connect_timeout: Duration,
    /// When set, a permanently failed cache link terminates the process
    /// instead of degrading
    pub required: bool,
}

impl CacheConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Session cookie policy backed by the cache store
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(skip_serializing)]
    pub secret: String,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,
    pub max_age: Duration,
}

/// Object-storage collaborator credentials and defaults
#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    /// Explicit endpoint override; defaults to the region's standard one
    pub endpoint: Option<String>,
    pub acl: String,
    pub encryption: String,
    pub max_upload_size: u64,
    pub cdn_url: Option<String>,
    pub accept_invalid_certs: bool,
}

/// Payment-provider collaborator credentials and defaults
#[derive(Debug, Clone, Serialize)]
pub struct PaymentConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub api_base: String,
    pub currency: String,
    pub refund_reason: String,
}

/// Outbound API client defaults and feature flags for the frontend shell
#[derive(Debug, Clone, Serialize)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub enable_caching: bool,
    pub enable_rate_limiting: bool,
}

/// Immutable per-environment configuration, resolved once per process
#[derive(Debug, Clone, Serialize)]
pub struct ResourceConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    pub storage: Option<StorageConfig>,
    pub payment: Option<PaymentConfig>,
    pub api: ApiClientConfig,
}

impl ResourceConfig {
    /// Build the configuration for `environment` from the process
    /// environment
    pub fn resolve(environment: Environment) -> Result<Self, ConfigError> {
        // Best-effort .env loading; absence is not an error.
        let _ = dotenvy::dotenv();

        Ok(Self {
            environment,
            database: resolve_database(environment)?,
            cache: resolve_cache()?,
            retry: resolve_retry()?,
            session: resolve_session(environment)?,
            storage: resolve_storage()?,
            payment: resolve_payment()?,
            api: resolve_api()?,
        })
    }
}

fn resolve_database(environment: Environment) -> Result<DatabaseConfig, ConfigError> {
    match environment {
        Environment::Production => {
            let raw = required(
                "DATABASE_URL",
                "production needs an explicit connection string",
            )?;
            let url = Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                key: "DATABASE_URL",
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            let host = url
                .host_str()
                .ok_or_else(|| ConfigError::Invalid {
                    key: "DATABASE_URL",
                    value: raw.clone(),
                    reason: "connection string has no host".to_string(),
                })?
                .to_string();
            let database = url.path().trim_start_matches('/').to_string();
            let user = if url.username().is_empty() {
                "postgres".to_string()
            } else {
                url.username().to_string()
            };

            Ok(DatabaseConfig {
                host,
                port: url.port().unwrap_or(5432),
                database,
                user,
                password: url.password().map(str::to_string),
                pool_size: parsed("DB_POOL_SIZE", 50)?,
                idle_timeout: millis("DB_IDLE_TIMEOUT_MS", 30_000)?,
                connect_timeout: millis("DB_CONNECT_TIMEOUT_MS", 2_000)?,
                tls: TlsPolicy::Required {
                    accept_invalid_certs: true,
                    ca_cert: optional("DATABASE_SSL_CERT"),
                },
            })
        }
        Environment::Development => Ok(DatabaseConfig {
            host: optional("DATABASE_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parsed("DATABASE_PORT", 5432)?,
            database: optional("DATABASE_NAME").unwrap_or_else(|| "app_dev".to_string()),
            user: optional("DATABASE_USER").unwrap_or_else(|| "postgres".to_string()),
            password: optional("DATABASE_PASSWORD"),
            pool_size: parsed("DB_POOL_SIZE", 20)?,
            idle_timeout: millis("DB_IDLE_TIMEOUT_MS", 30_000)?,
            connect_timeout: millis("DB_CONNECT_TIMEOUT_MS", 2_000)?,
            tls: TlsPolicy::Disabled,
        }),
        Environment::Test => Ok(DatabaseConfig {
            host: optional("TEST_DATABASE_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parsed("TEST_DATABASE_PORT", 5432)?,
            database: optional("TEST_DATABASE_NAME").unwrap_or_else(|| "app_test".to_string()),
            user: optional("TEST_DATABASE_USER").unwrap_or_else(|| "postgres".to_string()),
            password: optional("TEST_DATABASE_PASSWORD"),
            pool_size: parsed("DB_POOL_SIZE", 10)?,
            idle_timeout: millis("DB_IDLE_TIMEOUT_MS", 30_000)?,
            connect_timeout: millis("DB_CONNECT_TIMEOUT_MS", 2_000)?,
            tls: TlsPolicy::Disabled,
        }),
    }
}

fn resolve_cache() -> Result<CacheConfig, ConfigError> {
    Ok(CacheConfig {
        host: optional("CACHE_HOST").unwrap_or_else(|| "localhost".to_string()),
        port: parsed("CACHE_PORT", 6379)?,
        password: optional("CACHE_PASSWORD"),
        database_index: parsed("CACHE_DB", 0)?,
        connect_timeout: millis("CACHE_CONNECT_TIMEOUT_MS", 2_000)?,
        required: flag("CACHE_REQUIRED", false)?,
    })
}

fn resolve_retry() -> Result<RetryPolicy, ConfigError> {
    Ok(RetryPolicy {
        base_unit: millis("RETRY_BASE_MS", 100)?,
        max_delay: millis("RETRY_MAX_DELAY_MS", 3_000)?,
        max_elapsed: Duration::from_secs(parsed("RETRY_MAX_ELAPSED_SECS", 3_600)?),
        max_attempts: parsed("RETRY_MAX_ATTEMPTS", 10)?,
        retry_refused: flag("RETRY_REFUSED", false)?,
    })
}

fn resolve_session(environment: Environment) -> Result<SessionConfig, ConfigError> {
    let secret = match optional("SESSION_SECRET") {
        Some(secret) => secret,
        None if environment == Environment::Production => {
            return Err(ConfigError::Missing {
                key: "SESSION_SECRET",
                hint: "sessions cannot be signed without a secret in production",
            })
        }
        None => "insecure-dev-secret".to_string(),
    };

    Ok(SessionConfig {
        secret,
        cookie_secure: flag("COOKIE_SECURE", environment == Environment::Production)?,
        cookie_http_only: true,
        max_age: millis("SESSION_MAX_AGE_MS", 86_400_000)?,
    })
}

fn resolve_storage() -> Result<Option<StorageConfig>, ConfigError> {
    let access_key = match optional("STORAGE_ACCESS_KEY") {
        Some(key) => key,
        None => return Ok(None),
    };
    let secret_key = required(
        "STORAGE_SECRET_KEY",
        "set together with STORAGE_ACCESS_KEY",
    )?;
    let bucket = required("STORAGE_BUCKET", "object storage needs a bucket")?;

    Ok(Some(StorageConfig {
        access_key,
        secret_key,
        region: optional("STORAGE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        bucket,
        endpoint: optional("STORAGE_ENDPOINT"),
        acl: optional("STORAGE_ACL").unwrap_or_else(|| "private".to_string()),
        encryption: optional("STORAGE_ENCRYPTION").unwrap_or_else(|| "AES256".to_string()),
        max_upload_size: parsed("MAX_UPLOAD_SIZE", 10_485_760)?,
        cdn_url: optional("CDN_URL"),
        accept_invalid_certs: flag("STORAGE_INSECURE_TLS", false)?,
    }))
}

fn resolve_payment() -> Result<Option<PaymentConfig>, ConfigError> {
    let api_key = match optional("PAYMENT_API_KEY") {
        Some(key) => key,
        None => return Ok(None),
    };
    let webhook_secret = required(
        "PAYMENT_WEBHOOK_SECRET",
        "webhooks cannot be verified without the signing secret",
    )?;

    Ok(Some(PaymentConfig {
        api_key,
        webhook_secret,
        api_base: optional("PAYMENT_API_BASE")
            .unwrap_or_else(|| "https://api.stripe.com".to_string()),
        currency: optional("DEFAULT_CURRENCY").unwrap_or_else(|| "usd".to_string()),
        refund_reason: optional("REFUND_REASON")
            .unwrap_or_else(|| "requested_by_customer".to_string()),
    }))
}

fn resolve_api() -> Result<ApiClientConfig, ConfigError> {
    Ok(ApiClientConfig {
        base_url: optional("API_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8000/api".to_string()),
        request_timeout: Duration::from_secs(parsed("API_TIMEOUT_SECS", 30)?),
        enable_caching: flag("ENABLE_API_CACHING", true)?,
        enable_rate_limiting: flag("ENABLE_RATE_LIMITING", true)?,
    })
}

/// Non-empty value of `key`, if set
fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn required(key: &'static str, hint: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing { key, hint })
}

fn parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parsed(key, default)?))
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
