use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Cloud endpoints of one vendor farm
#[derive(Debug, Clone, PartialEq)]
pub struct FarmEndpoints {
    pub service_location_url: String,
    pub token_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
}

impl FarmEndpoints {
    pub fn for_farm(farm: u8) -> Result<Self> {
        let (api_host, mqtt_host, mqtt_port) = match farm {
            1 => ("app1pub.smappee.net", "52.51.163.167", 80),
            2 => ("farm2pub.smappee.net", "mqtttest.smappee.net", 10000),
            3 => ("farm3pub.smappee.net", "mqttdev.smappee.net", 10000),
            other => return Err(Error::Config(format!("unknown farm {other}"))),
        };
        Ok(Self {
            service_location_url: format!("https://{api_host}/dev/v3/servicelocation"),
            token_url: format!("https://{api_host}/dev/v3/oauth2/token"),
            mqtt_host: mqtt_host.to_string(),
            mqtt_port,
        })
    }
}

/// Runtime settings shared by every location of an account
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub farm: u8,
    pub endpoints: FarmEndpoints,
    pub local_mqtt_port: u16,
    /// Log topics the dispatcher does not recognise
    pub discovery: bool,
    pub trend_ttl: Duration,
    /// Upper bound for any call into the local network
    pub local_timeout: Duration,
    pub tracking_interval: Duration,
    pub heartbeat_interval: Duration,
    pub tracking_toggle_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            farm: 1,
            endpoints: FarmEndpoints {
                service_location_url: "https://app1pub.smappee.net/dev/v3/servicelocation"
                    .to_string(),
                token_url: "https://app1pub.smappee.net/dev/v3/oauth2/token".to_string(),
                mqtt_host: "52.51.163.167".to_string(),
                mqtt_port: 80,
            },
            local_mqtt_port: 1883,
            discovery: false,
            trend_ttl: Duration::from_secs(300),
            local_timeout: Duration::from_millis(2000),
            tracking_interval: Duration::from_secs(60 * 5),
            heartbeat_interval: Duration::from_secs(60),
            tracking_toggle_delay: Duration::from_millis(2000),
        }
    }
}

impl Settings {
    /// Builds settings from `SMAPPEE_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let farm: u8 = parse_env("SMAPPEE_FARM")?.unwrap_or(defaults.farm);
        let mut endpoints = FarmEndpoints::for_farm(farm)?;
        if let Some(url) = non_empty_env("SMAPPEE_API_URL") {
            endpoints.service_location_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = non_empty_env("SMAPPEE_MQTT_HOST") {
            endpoints.mqtt_host = host;
        }
        if let Some(port) = parse_env("SMAPPEE_MQTT_PORT")? {
            endpoints.mqtt_port = port;
        }

        Ok(Self {
            farm,
            endpoints,
            local_mqtt_port: parse_env("SMAPPEE_LOCAL_MQTT_PORT")?
                .unwrap_or(defaults.local_mqtt_port),
            discovery: parse_bool_safe(env::var("SMAPPEE_DISCOVERY").ok()),
            trend_ttl: parse_env("SMAPPEE_TREND_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.trend_ttl),
            local_timeout: parse_env("SMAPPEE_LOCAL_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.local_timeout),
            tracking_interval: parse_env("SMAPPEE_TRACKING_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tracking_interval),
            heartbeat_interval: parse_env("SMAPPEE_HEARTBEAT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            tracking_toggle_delay: parse_env("SMAPPEE_TRACKING_TOGGLE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.tracking_toggle_delay),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match non_empty_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that touch process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 6] = [
        "SMAPPEE_FARM",
        "SMAPPEE_API_URL",
        "SMAPPEE_MQTT_PORT",
        "SMAPPEE_DISCOVERY",
        "SMAPPEE_TREND_TTL_SECS",
        "SMAPPEE_LOCAL_TIMEOUT_MS",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));
        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));
        assert!(!parse_bool_safe(Some("FALSE".to_string())));
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }

    #[test]
    fn test_defaults_without_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.endpoints, FarmEndpoints::for_farm(1).unwrap());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SMAPPEE_FARM", "2");
        env::set_var("SMAPPEE_API_URL", "http://127.0.0.1:9000/servicelocation/");
        env::set_var("SMAPPEE_DISCOVERY", "true");
        env::set_var("SMAPPEE_TREND_TTL_SECS", "600");
        env::set_var("SMAPPEE_LOCAL_TIMEOUT_MS", "1500");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.farm, 2);
        assert_eq!(
            settings.endpoints.service_location_url,
            "http://127.0.0.1:9000/servicelocation"
        );
        assert_eq!(settings.endpoints.mqtt_host, "mqtttest.smappee.net");
        assert_eq!(settings.endpoints.mqtt_port, 10000);
        assert!(settings.discovery);
        assert_eq!(settings.trend_ttl, Duration::from_secs(600));
        assert_eq!(settings.local_timeout, Duration::from_millis(1500));

        clear_env();
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SMAPPEE_FARM", "7");
        assert!(matches!(Settings::from_env(), Err(Error::Config(_))));

        env::set_var("SMAPPEE_FARM", "1");
        env::set_var("SMAPPEE_MQTT_PORT", "not-a-port");
        assert!(matches!(Settings::from_env(), Err(Error::Config(_))));

        clear_env();
    }
}
