use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::SmartPlugConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for a TP-Link Tapo metered plug.
///
/// The plug measures wall power for the whole device, so its reading takes
/// precedence over any on-board estimate. Cloning shares the underlying
/// connection pool, so a clone is cheap enough to move into a request task.
#[derive(Clone)]
pub struct SmartPlug {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct EnergyUsageResponse {
    /// Instantaneous draw in milliwatts.
    current_power: u64,
}

impl SmartPlug {
    /// Requires the full credential trio; a plug address without credentials
    /// is a deployment mistake the caller reports and survives.
    pub fn new(cfg: &SmartPlugConfig) -> Result<Self> {
        let username = match &cfg.username {
            Some(u) => u.clone(),
            None => bail!("smart plug at {} configured without a username", cfg.ip_address),
        };
        let password = match &cfg.password {
            Some(p) => p.clone(),
            None => bail!("smart plug at {} configured without a password", cfg.ip_address),
        };

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("http://{}/app", cfg.ip_address),
            username,
            password,
        })
    }

    /// Current wall power draw in milliwatts.
    pub async fn current_power(&self) -> Result<f32> {
        let url = format!("{}/energy_usage", self.base_url);

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await
            .context("requesting smart plug energy usage")?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {status} from smart plug");
        }

        let usage: EnergyUsageResponse = response
            .json()
            .await
            .context("decoding smart plug response")?;

        Ok(usage.current_power as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug_config(username: Option<&str>, password: Option<&str>) -> SmartPlugConfig {
        SmartPlugConfig {
            ip_address: "10.0.0.50".to_string(),
            username: username.map(String::from),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_new_requires_credentials() {
        assert!(SmartPlug::new(&plug_config(None, None)).is_err());
        assert!(SmartPlug::new(&plug_config(Some("lab"), None)).is_err());
        assert!(SmartPlug::new(&plug_config(None, Some("secret"))).is_err());
        assert!(SmartPlug::new(&plug_config(Some("lab"), Some("secret"))).is_ok());
    }

    #[test]
    fn test_energy_usage_decoding() {
        let usage: EnergyUsageResponse =
            serde_json::from_str(r#"{"current_power": 4835, "today_energy": 12}"#)
                .expect("should decode");
        assert_eq!(usage.current_power, 4835);
    }
}
