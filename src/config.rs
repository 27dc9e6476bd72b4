//! Configuration Module
//!
//! Handles loading and managing cache, collector and backend settings from
//! environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::naming::GLOBAL_BUCKET;

/// The shortest lease duration accepted from the environment, in milliseconds.
pub const GC_LEASE_DURATION_MIN_MS: u64 = 30_000;

// == Token Scheme ==
/// How the collector derives the token it stores in the leadership lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScheme {
    /// The application name. Every instance of one application shares it.
    Application,
    /// Unique per process: `{app}:{pid}:{nanos}`.
    Process,
}

impl FromStr for TokenScheme {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "application" | "app" => Ok(TokenScheme::Application),
            "process" | "pid" => Ok(TokenScheme::Process),
            other => Err(CacheError::Validation(format!(
                "Unknown GC token scheme: {}",
                other
            ))),
        }
    }
}

// == Retry Policy ==
/// Connection retry policy for the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which retrying is reported as exhausted
    pub max_attempts: u32,
    /// Total retry time in milliseconds after which retrying is reported as exhausted
    pub max_retry_time_ms: u64,
    /// Base delay in milliseconds, multiplied by the attempt number
    pub retry_freq_ms: u64,
}

impl RetryPolicy {
    /// Returns the delay before `attempt` (1-based), or None once the policy is exhausted.
    ///
    /// The delay grows linearly with the attempt and is capped by the max retry time.
    pub fn delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if attempt > self.max_attempts || elapsed.as_millis() as u64 > self.max_retry_time_ms {
            return None;
        }
        let delay = (attempt as u64)
            .saturating_mul(self.retry_freq_ms)
            .min(self.max_retry_time_ms);
        Some(Duration::from_millis(delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 31,
            max_retry_time_ms: 30_000,
            retry_freq_ms: 1_000,
        }
    }
}

// == GC Config ==
/// Garbage collector settings.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Whether this process runs a collector at all
    pub enabled: bool,
    /// Lease duration and loop period in milliseconds
    pub lease_duration_ms: u64,
    /// How long before lease expiry the renewal fires, in milliseconds
    pub renewal_margin_ms: u64,
    /// Host CPU usage percentage at or above which sweeps are skipped
    pub cpu_load_cutoff: f32,
    /// Members examined per atomic step in a regular bucket
    pub regular_batch_size: usize,
    /// Tuples examined per atomic step in a GLOBAL index
    pub global_batch_size: usize,
    /// Lease token scheme
    pub token_scheme: TokenScheme,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_duration_ms: GC_LEASE_DURATION_MIN_MS,
            renewal_margin_ms: 1_000,
            cpu_load_cutoff: 50.0,
            regular_batch_size: 2_000,
            global_batch_size: 1_000,
            token_scheme: TokenScheme::Application,
        }
    }
}

// == Config ==
/// Process configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Owning application name; unqualified buckets resolve against it
    pub app_name: String,
    /// Deployment environment; scopes every key the cache writes
    pub environment: String,
    /// HTTP server port
    pub server_port: u16,
    /// When false the engine fails open on every call
    pub cache_enabled: bool,
    /// Active expiration interval of the backing store in milliseconds
    pub expiry_interval_ms: u64,
    /// Member keys deleted per atomic step when purging a bucket
    pub purge_batch_size: usize,
    /// GLOBAL tuples rewritten per atomic step when reconciling a deleted bucket
    pub global_purge_batch_size: usize,
    /// Backend connection retry policy
    pub retry: RetryPolicy,
    /// Garbage collector settings
    pub gc: GcConfig,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `APP_NAME` - Owning application (default: bucket-cache)
    /// - `APP_ENV` - Environment name (default: development)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CACHE_ENABLED` - Turns caching on or off (default: true)
    /// - `EXPIRY_INTERVAL_MS` - Active expiration interval (default: 100)
    /// - `REG_BUCKET_MEMBER_BULK_DEL_SIZE` - Purge batch size (default: 2000)
    /// - `GLOBAL_BUCKET_MEMBER_BULK_DEL_SIZE` - GLOBAL reconcile batch size (default: 2000)
    /// - `BACKEND_MAX_RETRY_TIME` - Max total retry time in ms (default: 30000)
    /// - `BACKEND_MAX_RETRY_ATTEMPTS` - Max retry attempts (default: 31)
    /// - `BACKEND_RETRY_FREQ` - Retry base delay in ms (default: 1000)
    /// - `GC_ENABLED` - Runs the garbage collector (default: true)
    /// - `GC_LEASE_DURATION` - Lease duration in ms, at least 30000 (default: 30000)
    /// - `GC_RENEWAL_MARGIN` - Lease renewal margin in ms (default: 1000)
    /// - `CPU_LOAD_CUTOFF` - Max CPU percentage for sweeping (default: 50)
    /// - `REG_BUCKET_MEMBER_BULK_GC_SIZE` - Sweep batch size (default: 2000)
    /// - `GLOBAL_BUCKET_MEMBER_BULK_GC_SIZE` - GLOBAL sweep batch size (default: 1000)
    /// - `GC_TOKEN_SCHEME` - `application` or `process` (default: application)
    ///
    /// Fails on an unknown `GC_TOKEN_SCHEME`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let lease_duration_ms = env_or("GC_LEASE_DURATION", defaults.gc.lease_duration_ms)
            .max(GC_LEASE_DURATION_MIN_MS);

        let token_scheme =
            token_scheme_or(env::var("GC_TOKEN_SCHEME").ok(), defaults.gc.token_scheme)?;

        Ok(Self {
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            environment: env::var("APP_ENV").unwrap_or(defaults.environment),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            cache_enabled: env_or("CACHE_ENABLED", defaults.cache_enabled),
            expiry_interval_ms: env_or("EXPIRY_INTERVAL_MS", defaults.expiry_interval_ms),
            purge_batch_size: env_or("REG_BUCKET_MEMBER_BULK_DEL_SIZE", defaults.purge_batch_size),
            global_purge_batch_size: env_or(
                "GLOBAL_BUCKET_MEMBER_BULK_DEL_SIZE",
                defaults.global_purge_batch_size,
            ),
            retry: RetryPolicy {
                max_attempts: env_or("BACKEND_MAX_RETRY_ATTEMPTS", defaults.retry.max_attempts),
                max_retry_time_ms: env_or(
                    "BACKEND_MAX_RETRY_TIME",
                    defaults.retry.max_retry_time_ms,
                ),
                retry_freq_ms: env_or("BACKEND_RETRY_FREQ", defaults.retry.retry_freq_ms),
            },
            gc: GcConfig {
                enabled: env_or("GC_ENABLED", defaults.gc.enabled),
                lease_duration_ms,
                renewal_margin_ms: env_or("GC_RENEWAL_MARGIN", defaults.gc.renewal_margin_ms),
                cpu_load_cutoff: env_or("CPU_LOAD_CUTOFF", defaults.gc.cpu_load_cutoff),
                regular_batch_size: env_or(
                    "REG_BUCKET_MEMBER_BULK_GC_SIZE",
                    defaults.gc.regular_batch_size,
                ),
                global_batch_size: env_or(
                    "GLOBAL_BUCKET_MEMBER_BULK_GC_SIZE",
                    defaults.gc.global_batch_size,
                ),
                token_scheme,
            },
        })
    }

    /// Rejects settings the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() || self.app_name.contains('.') {
            return Err(CacheError::Validation(format!(
                "APP_NAME must be non-empty and must not contain '.': {:?}",
                self.app_name
            )));
        }
        if self.app_name == GLOBAL_BUCKET {
            return Err(CacheError::Validation(
                "APP_NAME must not be the reserved name GLOBAL".to_string(),
            ));
        }
        if self.environment.is_empty() || self.environment.contains('.') {
            return Err(CacheError::Validation(format!(
                "APP_ENV must be non-empty and must not contain '.': {:?}",
                self.environment
            )));
        }
        if self.purge_batch_size == 0
            || self.global_purge_batch_size == 0
            || self.gc.regular_batch_size == 0
            || self.gc.global_batch_size == 0
        {
            return Err(CacheError::Validation(
                "Batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.gc.renewal_margin_ms >= self.gc.lease_duration_ms {
            return Err(CacheError::Validation(
                "GC_RENEWAL_MARGIN must be shorter than GC_LEASE_DURATION".to_string(),
            ));
        }
        if !(self.gc.cpu_load_cutoff > 0.0 && self.gc.cpu_load_cutoff <= 100.0) {
            return Err(CacheError::Validation(
                "CPU_LOAD_CUTOFF must be in (0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "bucket-cache".to_string(),
            environment: "development".to_string(),
            server_port: 3000,
            cache_enabled: true,
            expiry_interval_ms: 100,
            purge_batch_size: 2_000,
            global_purge_batch_size: 2_000,
            retry: RetryPolicy::default(),
            gc: GcConfig::default(),
        }
    }
}

/// Parses a token scheme setting; unset or blank means `default`.
fn token_scheme_or(raw: Option<String>, default: TokenScheme) -> Result<TokenScheme> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value.parse(),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.app_name, "bucket-cache");
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.purge_batch_size, 2000);
        assert_eq!(config.gc.global_batch_size, 1000);
        assert_eq!(config.gc.token_scheme, TokenScheme::Application);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_clamps_lease_duration() {
        env::set_var("GC_LEASE_DURATION", "500");
        let config = Config::from_env().unwrap();
        env::remove_var("GC_LEASE_DURATION");

        assert_eq!(config.gc.lease_duration_ms, GC_LEASE_DURATION_MIN_MS);
    }

    #[test]
    fn test_validate_rejects_dotted_app_name() {
        let config = Config {
            app_name: "my.app".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_margin_longer_than_lease() {
        let mut config = Config::default();
        config.gc.renewal_margin_ms = config.gc.lease_duration_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_scheme_parse() {
        assert_eq!("process".parse::<TokenScheme>().unwrap(), TokenScheme::Process);
        assert_eq!("APP".parse::<TokenScheme>().unwrap(), TokenScheme::Application);
        assert!("random".parse::<TokenScheme>().is_err());
    }

    #[test]
    fn test_unknown_token_scheme_is_rejected() {
        let parsed = token_scheme_or(Some("per-host".to_string()), TokenScheme::Application);
        assert!(matches!(parsed, Err(CacheError::Validation(_))));

        assert_eq!(
            token_scheme_or(None, TokenScheme::Application).unwrap(),
            TokenScheme::Application
        );
        assert_eq!(
            token_scheme_or(Some(" ".to_string()), TokenScheme::Application).unwrap(),
            TokenScheme::Application
        );
        assert_eq!(
            token_scheme_or(Some("process".to_string()), TokenScheme::Application).unwrap(),
            TokenScheme::Process
        );
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            max_retry_time_ms: 2_500,
            retry_freq_ms: 1_000,
        };

        assert_eq!(policy.delay(1, Duration::ZERO), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay(3, Duration::ZERO), Some(Duration::from_millis(2_500)));
        assert_eq!(policy.delay(4, Duration::ZERO), None);
        assert_eq!(policy.delay(1, Duration::from_secs(3)), None);
    }
}
