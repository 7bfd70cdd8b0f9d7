//! Configuration-portal wire format: the `/scan` response and the
//! `/save` form body. The HTTP serving itself lives in the firmware crate;
//! everything parseable is here so it can be tested on the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WifiCredentials;

/// Access point raised while the portal is active.
pub const PORTAL_AP_SSID: &str = "CollarSalome_Config";
pub const PORTAL_AP_PASSWORD: &str = "12345678";

/// Delay between acknowledging `/save` and restarting the device.
pub const RESTART_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanNetwork {
    pub ssid: String,
    pub rssi: i32,
    pub secure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    pub networks: Vec<ScanNetwork>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortalError {
    #[error("ssid cannot be empty")]
    EmptySsid,
    #[error("malformed form body")]
    MalformedForm,
}

/// Parses the form-urlencoded body of `POST /save`.
///
/// An empty or missing ssid is an error; the password may legitimately be
/// empty for open networks.
pub fn parse_save_form(body: &str) -> Result<WifiCredentials, PortalError> {
    let mut ssid = None;
    let mut password = None;

    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match percent_decode(key)?.as_str() {
            "ssid" => ssid = Some(percent_decode(value)?),
            "password" => password = Some(percent_decode(value)?),
            _ => {}
        }
    }

    let ssid = ssid.unwrap_or_default();
    if ssid.trim().is_empty() {
        return Err(PortalError::EmptySsid);
    }

    Ok(WifiCredentials {
        ssid,
        password: password.unwrap_or_default(),
    })
}

fn percent_decode(input: &str) -> Result<String, PortalError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| core::str::from_utf8(h).ok())
                    .ok_or(PortalError::MalformedForm)?;
                let byte =
                    u8::from_str_radix(hex, 16).map_err(|_| PortalError::MalformedForm)?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| PortalError::MalformedForm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_form() {
        let creds = parse_save_form("ssid=barn-net&password=m00-m00").unwrap();
        assert_eq!(creds.ssid, "barn-net");
        assert_eq!(creds.password, "m00-m00");
    }

    #[test]
    fn decodes_escapes_and_plus_signs() {
        let creds = parse_save_form("ssid=Granja+Salom%C3%A9&password=p%26w%3Dd").unwrap();
        assert_eq!(creds.ssid, "Granja Salomé");
        assert_eq!(creds.password, "p&w=d");
    }

    #[test]
    fn empty_password_is_allowed() {
        let creds = parse_save_form("ssid=open-net&password=").unwrap();
        assert_eq!(creds.ssid, "open-net");
        assert_eq!(creds.password, "");
    }

    #[test]
    fn empty_ssid_is_rejected() {
        assert_eq!(
            parse_save_form("ssid=&password=whatever"),
            Err(PortalError::EmptySsid)
        );
        assert_eq!(
            parse_save_form("password=whatever"),
            Err(PortalError::EmptySsid)
        );
        assert_eq!(
            parse_save_form("ssid=+++&password=x"),
            Err(PortalError::EmptySsid)
        );
    }

    #[test]
    fn truncated_escape_is_malformed() {
        assert_eq!(
            parse_save_form("ssid=abc%2&password=x"),
            Err(PortalError::MalformedForm)
        );
    }

    #[test]
    fn scan_response_matches_wire_shape() {
        let response = ScanResponse {
            networks: vec![
                ScanNetwork {
                    ssid: "barn-net".to_string(),
                    rssi: -48,
                    secure: true,
                },
                ScanNetwork {
                    ssid: "guest".to_string(),
                    rssi: -77,
                    secure: false,
                },
            ],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"networks":[{"ssid":"barn-net","rssi":-48,"secure":true},{"ssid":"guest","rssi":-77,"secure":false}]}"#
        );
    }
}
