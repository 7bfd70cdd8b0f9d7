pub mod beat;
pub mod config;
pub mod connectivity;
pub mod heart_rate;
pub mod portal;
pub mod reading;
pub mod temperature;

pub use beat::BeatDetector;
pub use config::{CollarConfig, DeviceIdentity, WifiCredentials};
pub use connectivity::{CheckAction, ConnectivityMonitor, ConnectivityState};
pub use heart_rate::HeartRateEngine;
pub use portal::{parse_save_form, PortalError, ScanNetwork, ScanResponse};
pub use reading::{SensorReading, UploadOutcome, UploadPayload};
pub use temperature::TemperatureFilter;
