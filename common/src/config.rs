use serde::{Deserialize, Serialize};

/// Wi-Fi station credentials, persisted wholesale in NVS. Both fields are
/// always written together; an empty ssid means the device is unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn is_configured(&self) -> bool {
        !self.ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub collar_id: String,
    pub cow_name: String,
    pub mac_address: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            collar_id: "collar-001".to_string(),
            cow_name: "Sofia".to_string(),
            mac_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollarConfig {
    pub identity: DeviceIdentity,
    pub upload_url: String,
    pub api_key: String,
    pub probe_url: String,
    pub upload_interval_s: u32,
    pub http_timeout_s: u32,
}

impl Default for CollarConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            upload_url: "https://pmonitunl.vercel.app/api/arduino/monitoreo".to_string(),
            api_key: String::new(),
            probe_url: "http://httpbin.org/get".to_string(),
            upload_interval_s: 30,
            http_timeout_s: 5,
        }
    }
}

impl CollarConfig {
    pub fn sanitize(&mut self) {
        self.upload_interval_s = self.upload_interval_s.clamp(5, 3_600);
        self.http_timeout_s = self.http_timeout_s.clamp(1, 30);

        if self.upload_url.trim().is_empty() {
            self.upload_url = CollarConfig::default().upload_url;
        }
        if self.probe_url.trim().is_empty() {
            self.probe_url = CollarConfig::default().probe_url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blank_ssid_means_unconfigured() {
        assert!(!WifiCredentials::default().is_configured());
        assert!(!WifiCredentials {
            ssid: "   ".to_string(),
            password: "secret".to_string(),
        }
        .is_configured());
        assert!(WifiCredentials {
            ssid: "barn-net".to_string(),
            password: String::new(),
        }
        .is_configured());
    }

    #[test]
    fn credentials_roundtrip_as_json() {
        let creds = WifiCredentials {
            ssid: "barn-net".to_string(),
            password: "m00-m00".to_string(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        let back: WifiCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(creds, back);
    }

    #[test]
    fn sanitize_restores_defaults_for_blank_urls() {
        let mut config = CollarConfig {
            upload_url: String::new(),
            probe_url: "  ".to_string(),
            upload_interval_s: 0,
            http_timeout_s: 90,
            ..CollarConfig::default()
        };
        config.sanitize();

        assert_eq!(config.upload_url, CollarConfig::default().upload_url);
        assert_eq!(config.probe_url, CollarConfig::default().probe_url);
        assert_eq!(config.upload_interval_s, 5);
        assert_eq!(config.http_timeout_s, 30);
    }
}
