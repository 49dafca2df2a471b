//! Configuration module for plcwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "plcwatch.db")
    pub db_path: String,
    pub plc: PlcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "plcwatch.db".to_string(),
            plc: PlcConfig::default(),
        }
    }
}

/// Timing and capacity settings for controller sessions and fault monitoring.
#[derive(Debug, Clone)]
pub struct PlcConfig {
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    /// Watchdog period for connected sessions.
    pub check_period: Duration,
    pub default_tag_interval: Duration,
    pub monitor_interval: Duration,
    pub batch_period: Duration,
    pub batch_max_size: usize,
    /// Capacity of the raw fault change channel.
    pub change_capacity: usize,
    /// Outbound buffer of each event subscriber.
    pub subscriber_buffer: usize,
    pub s7_port: u16,
    /// PDU size requested during S7 setup.
    pub pdu_size: u16,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            check_period: Duration::from_secs(30),
            default_tag_interval: Duration::from_millis(1000),
            monitor_interval: Duration::from_secs(1),
            batch_period: Duration::from_millis(200),
            batch_max_size: 50,
            change_capacity: 1000,
            subscriber_buffer: 100,
            s7_port: 102,
            pdu_size: 480,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PLCWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PLCWATCH_DB_PATH`: Database file path (default: "plcwatch.db")
    /// - `PLCWATCH_*_MS` and friends: see [`PlcConfig::load`]
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("PLCWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("PLCWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.plc = PlcConfig::load();
        cfg
    }
}

impl PlcConfig {
    /// Environment variables (all optional):
    /// - `PLCWATCH_CONNECT_TIMEOUT_MS` (5000)
    /// - `PLCWATCH_RETRY_DELAY_MS` (5000)
    /// - `PLCWATCH_CHECK_PERIOD_MS` (30000)
    /// - `PLCWATCH_TAG_INTERVAL_MS` (1000)
    /// - `PLCWATCH_MONITOR_INTERVAL_MS` (1000)
    /// - `PLCWATCH_BATCH_PERIOD_MS` (200)
    /// - `PLCWATCH_BATCH_MAX_SIZE` (50)
    /// - `PLCWATCH_CHANGE_CAPACITY` (1000)
    /// - `PLCWATCH_SUBSCRIBER_BUFFER` (100)
    /// - `PLCWATCH_S7_PORT` (102)
    /// - `PLCWATCH_PDU_SIZE` (480)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        let millis = |name: &str, slot: &mut Duration| {
            if let Some(ms) = parse_var::<u64>(name).filter(|ms| *ms > 0) {
                *slot = Duration::from_millis(ms);
            }
        };
        millis("PLCWATCH_CONNECT_TIMEOUT_MS", &mut cfg.connect_timeout);
        millis("PLCWATCH_RETRY_DELAY_MS", &mut cfg.retry_delay);
        millis("PLCWATCH_CHECK_PERIOD_MS", &mut cfg.check_period);
        millis("PLCWATCH_TAG_INTERVAL_MS", &mut cfg.default_tag_interval);
        millis("PLCWATCH_MONITOR_INTERVAL_MS", &mut cfg.monitor_interval);
        millis("PLCWATCH_BATCH_PERIOD_MS", &mut cfg.batch_period);

        if let Some(n) = parse_var::<usize>("PLCWATCH_BATCH_MAX_SIZE").filter(|n| *n > 0) {
            cfg.batch_max_size = n;
        }
        if let Some(n) = parse_var::<usize>("PLCWATCH_CHANGE_CAPACITY").filter(|n| *n > 0) {
            cfg.change_capacity = n;
        }
        if let Some(n) = parse_var::<usize>("PLCWATCH_SUBSCRIBER_BUFFER").filter(|n| *n > 0) {
            cfg.subscriber_buffer = n;
        }
        if let Some(port) = parse_var("PLCWATCH_S7_PORT") {
            cfg.s7_port = port;
        }
        if let Some(pdu) = parse_var::<u16>("PLCWATCH_PDU_SIZE").filter(|p| *p >= 240) {
            cfg.pdu_size = pdu;
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "plcwatch.db");
    }

    #[test]
    fn test_default_plc_timings() {
        let plc = PlcConfig::default();
        assert_eq!(plc.connect_timeout, Duration::from_secs(5));
        assert_eq!(plc.retry_delay, Duration::from_secs(5));
        assert_eq!(plc.check_period, Duration::from_secs(30));
        assert_eq!(plc.batch_period, Duration::from_millis(200));
        assert_eq!(plc.batch_max_size, 50);
        assert_eq!(plc.change_capacity, 1000);
        assert_eq!(plc.s7_port, 102);
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("PLCWATCH_RETRY_DELAY_MS", "250");
        env::set_var("PLCWATCH_BATCH_MAX_SIZE", "not-a-number");
        let plc = PlcConfig::load();
        env::remove_var("PLCWATCH_RETRY_DELAY_MS");
        env::remove_var("PLCWATCH_BATCH_MAX_SIZE");

        assert_eq!(plc.retry_delay, Duration::from_millis(250));
        assert_eq!(plc.batch_max_size, 50);
    }
}
