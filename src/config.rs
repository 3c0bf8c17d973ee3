use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Environment variables injected into every testbed container.
pub const ENV_CLIENT_ID: &str = "COLEXT_CLIENT_ID";
pub const ENV_CLIENT_DB_ID: &str = "COLEXT_CLIENT_DB_ID";
pub const ENV_JOB_ID: &str = "COLEXT_JOB_ID";
pub const ENV_DEVICE_TYPE: &str = "COLEXT_DEVICE_TYPE";
pub const ENV_SCRAPE_INTERVAL: &str = "COLEXT_MONITORING_SCRAPE_INTERVAL";
pub const ENV_PUSH_INTERVAL: &str = "COLEXT_MONITORING_PUSH_INTERVAL";
pub const ENV_LIVE_METRICS: &str = "COLEXT_MONITORING_LIVE_METRICS";
pub const ENV_MEASURE_SELF: &str = "COLEXT_MONITORING_MEASURE_SELF";
pub const ENV_TARGET_PID: &str = "COLEXT_TARGET_PID";
pub const ENV_DB_DSN: &str = "COLEXT_DB_DSN";
pub const ENV_PUBSUB_URL: &str = "COLEXT_PUBSUB_URL";
pub const ENV_NETWORK_DIR: &str = "COLEXT_NETWORK_DIR";
pub const ENV_NETWORK_INTERFACE: &str = "COLEXT_NETWORK_INTERFACE";
pub const ENV_SP_IP_ADDRESS: &str = "SP_IP_ADDRESS";
pub const ENV_SP_USERNAME: &str = "TAPO_USERNAME";
pub const ENV_SP_PASSWORD: &str = "TAPO_PASSWORD";

const DEFAULT_PUBSUB_URL: &str = "amqp://10.0.0.100:6942/%2f";
const DEFAULT_NETWORK_DIR: &str = "network";
const DEFAULT_NETWORK_INTERFACE: &str = "eth0";

/// Full agent configuration, resolved from the testbed environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client index within the job (human-facing).
    pub client_id: u32,
    /// Client row id in the testbed database.
    pub client_db_id: i64,
    pub job_id: String,
    pub monitoring: MonitoringConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
}

/// Hardware-scraping and metric-push settings.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub scrape_interval: Duration,
    pub push_interval: Duration,
    /// Flush on every push tick instead of accumulating until shutdown.
    pub live_metrics: bool,
    /// Sample our own process rather than a separately named target pid.
    pub measure_self: bool,
    pub target_pid: Option<u32>,
    pub device: DeviceType,
    pub smart_plug: Option<SmartPlugConfig>,
}

impl MonitoringConfig {
    /// Pid the scraper should sample.
    pub fn resolved_target_pid(&self) -> u32 {
        if self.measure_self {
            return std::process::id();
        }
        self.target_pid.unwrap_or_else(std::process::id)
    }
}

/// Device family, selecting the power/GPU scraper backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Generic,
    Jetson,
    LattePanda,
}

impl DeviceType {
    /// Map a testbed device-type string (e.g. "JetsonOrinNano",
    /// "LattePandaDelta3") onto a backend family.
    pub fn from_device_name(name: &str) -> Self {
        if name.contains("Jetson") {
            DeviceType::Jetson
        } else if name.contains("LattePanda") {
            DeviceType::LattePanda
        } else {
            DeviceType::Generic
        }
    }
}

/// TP-Link Tapo smart plug access, present when the device is plugged
/// into a metered socket.
#[derive(Debug, Clone)]
pub struct SmartPlugConfig {
    pub ip_address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dsn: String,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Directory holding static_rules and time_*/epoch_* rule files.
    pub rules_dir: PathBuf,
    pub interface: String,
    pub bus_url: String,
}

impl Config {
    /// Resolve the full configuration from the process environment.
    ///
    /// Missing or malformed variables are configuration errors: the agent
    /// only runs inside the testbed, so there is nothing to fall back to.
    pub fn from_env() -> Result<Self> {
        let client_id = require_env(ENV_CLIENT_ID)?
            .parse::<u32>()
            .with_context(|| format!("parsing {ENV_CLIENT_ID}"))?;
        let client_db_id = require_env(ENV_CLIENT_DB_ID)?
            .parse::<i64>()
            .with_context(|| format!("parsing {ENV_CLIENT_DB_ID}"))?;
        let job_id = require_env(ENV_JOB_ID)?;

        let scrape_interval = parse_secs(&require_env(ENV_SCRAPE_INTERVAL)?)
            .with_context(|| format!("parsing {ENV_SCRAPE_INTERVAL}"))?;
        let push_interval = parse_secs(&require_env(ENV_PUSH_INTERVAL)?)
            .with_context(|| format!("parsing {ENV_PUSH_INTERVAL}"))?;
        let live_metrics = parse_bool_flag(&require_env(ENV_LIVE_METRICS)?)
            .with_context(|| format!("parsing {ENV_LIVE_METRICS}"))?;
        let measure_self = match optional_env(ENV_MEASURE_SELF) {
            Some(raw) => {
                parse_bool_flag(&raw).with_context(|| format!("parsing {ENV_MEASURE_SELF}"))?
            }
            None => false,
        };
        let target_pid = match optional_env(ENV_TARGET_PID) {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .with_context(|| format!("parsing {ENV_TARGET_PID}"))?,
            ),
            None => None,
        };
        let device = DeviceType::from_device_name(&require_env(ENV_DEVICE_TYPE)?);

        let monitoring = MonitoringConfig {
            scrape_interval,
            push_interval,
            live_metrics,
            measure_self,
            target_pid,
            device,
            smart_plug: smart_plug_from_env(),
        };

        let storage = StorageConfig {
            dsn: require_env(ENV_DB_DSN)?,
        };

        let network = NetworkConfig {
            rules_dir: PathBuf::from(
                optional_env(ENV_NETWORK_DIR).unwrap_or_else(|| DEFAULT_NETWORK_DIR.to_string()),
            ),
            interface: optional_env(ENV_NETWORK_INTERFACE)
                .unwrap_or_else(|| DEFAULT_NETWORK_INTERFACE.to_string()),
            bus_url: optional_env(ENV_PUBSUB_URL)
                .unwrap_or_else(|| DEFAULT_PUBSUB_URL.to_string()),
        };

        Ok(Config {
            client_id,
            client_db_id,
            job_id,
            monitoring,
            storage,
            network,
        })
    }
}

/// Smart-plug config is present iff the plug address is set. Credential
/// validation happens in the scraper, which degrades rather than aborts.
fn smart_plug_from_env() -> Option<SmartPlugConfig> {
    let ip_address = optional_env(ENV_SP_IP_ADDRESS)?;
    Some(SmartPlugConfig {
        ip_address,
        username: optional_env(ENV_SP_USERNAME),
        password: optional_env(ENV_SP_PASSWORD),
    })
}

fn require_env(name: &str) -> Result<String> {
    match optional_env(name) {
        Some(value) => Ok(value),
        None => {
            bail!("expected env variable {name} inside the testbed environment, but it is not defined")
        }
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse the testbed's Python-style boolean flags.
fn parse_bool_flag(raw: &str) -> Result<bool> {
    match raw {
        "True" => Ok(true),
        "False" => Ok(false),
        other => bail!("expected 'True' or 'False', got {other:?}"),
    }
}

/// Parse a positive interval given in (possibly fractional) seconds.
fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .parse()
        .with_context(|| format!("invalid interval {raw:?}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        bail!("interval must be a positive number of seconds, got {raw:?}");
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_flag() {
        assert!(parse_bool_flag("True").expect("should parse"));
        assert!(!parse_bool_flag("False").expect("should parse"));
        assert!(parse_bool_flag("true").is_err());
        assert!(parse_bool_flag("1").is_err());
        assert!(parse_bool_flag("").is_err());
    }

    #[test]
    fn test_parse_secs_valid() {
        assert_eq!(
            parse_secs("0.3").expect("should parse"),
            Duration::from_millis(300)
        );
        assert_eq!(
            parse_secs("5").expect("should parse"),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_parse_secs_invalid() {
        assert!(parse_secs("0").is_err());
        assert!(parse_secs("-1").is_err());
        assert!(parse_secs("NaN").is_err());
        assert!(parse_secs("fast").is_err());
    }

    #[test]
    fn test_device_type_detection() {
        assert_eq!(
            DeviceType::from_device_name("JetsonOrinNano"),
            DeviceType::Jetson
        );
        assert_eq!(
            DeviceType::from_device_name("JetsonAGXOrin"),
            DeviceType::Jetson
        );
        assert_eq!(
            DeviceType::from_device_name("LattePandaDelta3"),
            DeviceType::LattePanda
        );
        assert_eq!(
            DeviceType::from_device_name("OrangePi5B"),
            DeviceType::Generic
        );
    }

    #[test]
    fn test_resolved_target_pid_prefers_explicit_pid() {
        let cfg = MonitoringConfig {
            scrape_interval: Duration::from_millis(300),
            push_interval: Duration::from_secs(10),
            live_metrics: true,
            measure_self: false,
            target_pid: Some(12345),
            device: DeviceType::Generic,
            smart_plug: None,
        };
        assert_eq!(cfg.resolved_target_pid(), 12345);

        let cfg = MonitoringConfig {
            measure_self: true,
            ..cfg
        };
        assert_eq!(cfg.resolved_target_pid(), std::process::id());
    }
}
