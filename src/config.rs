use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::BookingPolicy;
use crate::model::MINUTE_MS;

/// Server settings, read from `COWORKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends after which a space's WAL is compacted.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "coworkd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            policy: BookingPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => Err(ConfigError { var, value }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let minutes = |var: &'static str| -> Result<Option<i64>, ConfigError> {
            let value: Option<i64> = parsed(&lookup, var)?;
            match value {
                Some(m) if m <= 0 => Err(ConfigError { var, value: m.to_string() }),
                other => Ok(other.map(|m| m * MINUTE_MS)),
            }
        };
        let policy = BookingPolicy {
            min_duration_ms: minutes("COWORKD_MIN_BOOKING_MINUTES")?,
            max_duration_ms: minutes("COWORKD_MAX_BOOKING_MINUTES")?,
        };
        if let (Some(min), Some(max)) = (policy.min_duration_ms, policy.max_duration_ms)
            && min > max
        {
            return Err(ConfigError {
                var: "COWORKD_MIN_BOOKING_MINUTES",
                value: (min / MINUTE_MS).to_string(),
            });
        }

        Ok(Self {
            port: parsed(&lookup, "COWORKD_PORT")?.unwrap_or(d.port),
            bind: lookup("COWORKD_BIND").unwrap_or(d.bind),
            data_dir: lookup("COWORKD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("COWORKD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "COWORKD_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "COWORKD_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            tls_cert: lookup("COWORKD_TLS_CERT"),
            tls_key: lookup("COWORKD_TLS_KEY"),
            metrics_port: parsed(&lookup, "COWORKD_METRICS_PORT")?,
            policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = from(&[
            ("COWORKD_PORT", "6000"),
            ("COWORKD_BIND", "127.0.0.1"),
            ("COWORKD_DATA_DIR", "/var/lib/coworkd"),
            ("COWORKD_PASSWORD", "s3cret"),
            ("COWORKD_MAX_CONNECTIONS", "8"),
            ("COWORKD_COMPACT_THRESHOLD", "50"),
            ("COWORKD_TLS_CERT", "cert.pem"),
            ("COWORKD_TLS_KEY", "key.pem"),
            ("COWORKD_METRICS_PORT", "9100"),
            ("COWORKD_MIN_BOOKING_MINUTES", "30"),
            ("COWORKD_MAX_BOOKING_MINUTES", "480"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/coworkd"));
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(cfg.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.policy.min_duration_ms, Some(30 * MINUTE_MS));
        assert_eq!(cfg.policy.max_duration_ms, Some(480 * MINUTE_MS));
    }

    #[test]
    fn malformed_number_names_the_variable() {
        let err = from(&[("COWORKD_PORT", "fifty")]).unwrap_err();
        assert_eq!(err.var, "COWORKD_PORT");
        assert!(err.to_string().contains("fifty"));
    }

    #[test]
    fn booking_bounds_must_be_positive_and_ordered() {
        assert!(from(&[("COWORKD_MIN_BOOKING_MINUTES", "0")]).is_err());
        assert!(
            from(&[
                ("COWORKD_MIN_BOOKING_MINUTES", "120"),
                ("COWORKD_MAX_BOOKING_MINUTES", "60"),
            ])
            .is_err()
        );
    }
}
