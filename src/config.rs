//! Typed process configuration, assembled from environment variables.
//!
//! Sourcing the environment itself (container orchestration, `.env` files,
//! secrets managers) is an external concern; parsing what lands in
//! `std::env` is in-core and, like any other module, typed and tested.

use std::time::Duration;

use crate::error::ConfigError;
use crate::partition_key::{PartitionKeyFallback, PartitionKeyMode};

const ENV_PREFIX: &str = "CDC_";

#[derive(Debug, Clone)]
pub struct Config {
    pub postgres_conninfo: String,
    pub replication_slot: String,
    pub output_plugin: String,
    pub wal2json_options_sql: String,
    pub replication_feedback_interval: Duration,

    pub leader_lock_key: i64,
    pub standby_retry_interval: Duration,

    pub inflight_max_messages: usize,
    pub inflight_max_bytes: usize,

    pub kinesis_stream: String,
    pub aws_region: String,
    pub kinesis_batch_max_records: usize,
    pub kinesis_batch_max_bytes: usize,
    pub kinesis_batch_max_delay: Duration,
    pub kinesis_retry_base_delay: Duration,
    pub kinesis_retry_max_delay: Duration,
    pub kinesis_retry_max_attempts: u32,
    pub kinesis_call_timeout: Duration,

    pub partition_key_mode: PartitionKeyMode,
    pub partition_key_fallback: PartitionKeyFallback,

    pub log_format: LogFormat,
    pub shutdown_grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let partition_key_mode = match required_str("PARTITION_KEY_MODE")?.as_str() {
            "static" => {
                let value = opt("PARTITION_KEY_STATIC_VALUE").ok_or(ConfigError::Invalid {
                    key: "CDC_PARTITION_KEY_STATIC_VALUE",
                    reason: "required when CDC_PARTITION_KEY_MODE=static".to_string(),
                })?;
                PartitionKeyMode::Static(value)
            }
            "fallback" => PartitionKeyMode::Fallback,
            other => {
                return Err(ConfigError::Invalid {
                    key: "CDC_PARTITION_KEY_MODE",
                    reason: format!("expected 'static' or 'fallback', got {other:?}"),
                })
            }
        };

        let partition_key_fallback = match opt("PARTITION_KEY_FALLBACK").as_deref() {
            None | Some("lsn") => PartitionKeyFallback::Lsn,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "CDC_PARTITION_KEY_FALLBACK",
                    reason: format!("unknown fallback {other:?}"),
                })
            }
        };

        Ok(Self {
            postgres_conninfo: required_str("POSTGRES_CONNINFO")?,
            replication_slot: required_str("REPLICATION_SLOT")?,
            output_plugin: opt("OUTPUT_PLUGIN").unwrap_or_else(|| "wal2json".to_string()),
            wal2json_options_sql: opt("WAL2JSON_OPTIONS_SQL").unwrap_or_default(),
            replication_feedback_interval: parse_secs_f64("REPLICATION_FEEDBACK_INTERVAL_S", 60.0)?,

            leader_lock_key: parse_required("LEADER_LOCK_KEY")?,
            standby_retry_interval: parse_secs_f64("STANDBY_RETRY_INTERVAL_S", 1.0)?,

            inflight_max_messages: parse_required("INFLIGHT_MAX_MESSAGES")?,
            inflight_max_bytes: parse_required("INFLIGHT_MAX_BYTES")?,

            kinesis_stream: required_str("KINESIS_STREAM")?,
            aws_region: required_str("AWS_REGION")?,
            kinesis_batch_max_records: parse_required("KINESIS_BATCH_MAX_RECORDS")?,
            kinesis_batch_max_bytes: parse_required("KINESIS_BATCH_MAX_BYTES")?,
            kinesis_batch_max_delay: parse_millis("KINESIS_BATCH_MAX_DELAY_MS")?,
            kinesis_retry_base_delay: parse_millis("KINESIS_RETRY_BASE_DELAY_MS")?,
            kinesis_retry_max_delay: parse_millis("KINESIS_RETRY_MAX_DELAY_MS")?,
            kinesis_retry_max_attempts: parse_required("KINESIS_RETRY_MAX_ATTEMPTS")?,
            kinesis_call_timeout: parse_millis_default("KINESIS_CALL_TIMEOUT_MS", 5_000)?,

            partition_key_mode,
            partition_key_fallback,

            log_format: match opt("LOG_FORMAT").as_deref() {
                None | Some("json") => LogFormat::Json,
                Some("pretty") => LogFormat::Pretty,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "CDC_LOG_FORMAT",
                        reason: format!("expected 'json' or 'pretty', got {other:?}"),
                    })
                }
            },
            shutdown_grace_period: parse_millis_default("SHUTDOWN_GRACE_PERIOD_MS", 5_000)?,
        })
    }
}

fn opt(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn required_str(suffix: &str) -> Result<String, ConfigError> {
    opt(suffix).ok_or_else(|| ConfigError::Missing(leak_key(suffix)))
}

fn parse_required<T>(suffix: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key_static = leak_key(suffix);
    let raw = opt(suffix).ok_or(ConfigError::Missing(key_static))?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key_static,
        reason: e.to_string(),
    })
}

fn parse_secs_f64(suffix: &str, default: f64) -> Result<Duration, ConfigError> {
    let key_static = leak_key(suffix);
    let raw = opt(suffix);
    let secs = match raw {
        Some(s) => s.parse::<f64>().map_err(|e| ConfigError::Invalid {
            key: key_static,
            reason: e.to_string(),
        })?,
        None => default,
    };
    Ok(Duration::from_secs_f64(secs))
}

fn parse_millis(suffix: &str) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_required(suffix)?;
    Ok(Duration::from_millis(millis))
}

fn parse_millis_default(suffix: &str, default: u64) -> Result<Duration, ConfigError> {
    let key_static = leak_key(suffix);
    let raw = opt(suffix);
    let millis = match raw {
        Some(s) => s.parse::<u64>().map_err(|e| ConfigError::Invalid {
            key: key_static,
            reason: e.to_string(),
        })?,
        None => default,
    };
    Ok(Duration::from_millis(millis))
}

/// Environment variable names are a small fixed set known at compile time;
/// leaking them gives `ConfigError` a `&'static str` without per-key const
/// declarations scattered across this module.
fn leak_key(suffix: &str) -> &'static str {
    Box::leak(format!("{ENV_PREFIX}{suffix}").into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_minimal_env() {
        let pairs = [
            ("POSTGRES_CONNINFO", "postgres://example"),
            ("REPLICATION_SLOT", "slot_a"),
            ("LEADER_LOCK_KEY", "42"),
            ("INFLIGHT_MAX_MESSAGES", "100"),
            ("INFLIGHT_MAX_BYTES", "1000000"),
            ("KINESIS_STREAM", "stream_a"),
            ("AWS_REGION", "us-east-1"),
            ("KINESIS_BATCH_MAX_RECORDS", "100"),
            ("KINESIS_BATCH_MAX_BYTES", "1000000"),
            ("KINESIS_BATCH_MAX_DELAY_MS", "250"),
            ("KINESIS_RETRY_BASE_DELAY_MS", "100"),
            ("KINESIS_RETRY_MAX_DELAY_MS", "5000"),
            ("KINESIS_RETRY_MAX_ATTEMPTS", "5"),
            ("PARTITION_KEY_MODE", "fallback"),
        ];
        for (k, v) in pairs {
            std::env::set_var(format!("{ENV_PREFIX}{k}"), v);
        }
    }

    #[test]
    fn loads_defaults_for_optional_keys() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_minimal_env();
        std::env::remove_var("CDC_OUTPUT_PLUGIN");
        std::env::remove_var("CDC_REPLICATION_FEEDBACK_INTERVAL_S");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.output_plugin, "wal2json");
        assert_eq!(cfg.replication_feedback_interval, Duration::from_secs(60));
        assert_eq!(cfg.partition_key_fallback, PartitionKeyFallback::Lsn);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_minimal_env();
        std::env::remove_var("CDC_KINESIS_STREAM");
        assert!(matches!(Config::from_env(), Err(ConfigError::Missing(_))));
        std::env::set_var("CDC_KINESIS_STREAM", "stream_a");
    }

    #[test]
    fn invalid_partition_key_mode_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_minimal_env();
        std::env::set_var("CDC_PARTITION_KEY_MODE", "bogus");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid { .. })));
        std::env::set_var("CDC_PARTITION_KEY_MODE", "fallback");
    }

    #[test]
    fn static_mode_without_value_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_minimal_env();
        std::env::set_var("CDC_PARTITION_KEY_MODE", "static");
        std::env::remove_var("CDC_PARTITION_KEY_STATIC_VALUE");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid { .. })));

        std::env::set_var("CDC_PARTITION_KEY_STATIC_VALUE", "tenant-a");
        assert!(Config::from_env().is_ok());
        std::env::remove_var("CDC_PARTITION_KEY_STATIC_VALUE");
        std::env::set_var("CDC_PARTITION_KEY_MODE", "fallback");
    }
}
