use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{info, warn};

use collar_common::{
    CheckAction, CollarConfig, ConnectivityMonitor, HeartRateEngine, SensorReading,
    TemperatureFilter, UploadOutcome, UploadPayload,
};

const USER_AGENT: &str = "ControlBovino/2.0";

/// Host-side run loop: no probe or pulse hardware, so both sources run in
/// simulated mode, but the reachability probe and the upload are real HTTP
/// against whatever endpoint the environment points at.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = CollarConfig::default();
    if let Ok(url) = std::env::var("COLLAR_UPLOAD_URL") {
        config.upload_url = url;
    }
    if let Ok(url) = std::env::var("COLLAR_PROBE_URL") {
        config.probe_url = url;
    }
    if let Ok(key) = std::env::var("COLLAR_API_KEY") {
        config.api_key = key;
    }
    if let Ok(id) = std::env::var("COLLAR_ID") {
        config.identity.collar_id = id;
    }
    if let Ok(name) = std::env::var("COLLAR_COW_NAME") {
        config.identity.cow_name = name;
    }
    config.identity.mac_address = "00:00:00:00:00:00".to_string();
    config.sanitize();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_s as u64))
        .build()
        .context("failed to build http client")?;

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    // No hardware on a workstation: both sources report simulated data.
    let mut heart_rate = HeartRateEngine::new(false, seed);
    let mut temp_filter = TemperatureFilter::new();
    let mut monitor = ConnectivityMonitor::new(true);

    let probe_ok = probe_internet(&client, &config.probe_url).await;
    monitor.association_succeeded(probe_ok);
    info!(state = ?monitor.state(), "host collar started");

    let boot = Instant::now();
    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(config.upload_interval_s as u64));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);
        let now_ms = boot.elapsed().as_millis() as u64;

        // Hardware integration point: replace this synthesized probe value
        // with the DS18B20 driver on the ESP target.
        let raw_temp = 38.2 + ((tick % 6) as f32 * 0.1);
        let temperature = temp_filter.accept(raw_temp);

        let bpm = heart_rate.measure(false, temperature, now_ms);
        let reading = SensorReading {
            temperature_c: temperature,
            heart_rate_bpm: bpm,
            temperature_real: false,
            heart_rate_real: false,
        };

        if monitor.check_due(now_ms) {
            let action = monitor.probe_result(probe_internet(&client, &config.probe_url).await);
            if action != CheckAction::None {
                // The host build has no portal to fall back to; keep probing.
                warn!(
                    failures = monitor.consecutive_failures(),
                    "internet unreachable from host"
                );
            }
        }

        if !monitor.is_online() {
            info!("skipping upload while offline (reading dropped, not queued)");
            continue;
        }

        match send_reading(&client, &config, &reading).await {
            Ok(outcome) if outcome.is_success() => {
                info!(bpm = reading.heart_rate_bpm, temperature = ?reading.temperature_c, "upload {outcome}")
            }
            Ok(outcome) => warn!("upload {outcome}"),
            Err(err) => warn!("upload transport failure: {err:#}"),
        }
    }
}

async fn probe_internet(client: &reqwest::Client, url: &str) -> bool {
    // Only completion matters; the response body and status are ignored.
    client.get(url).send().await.is_ok()
}

async fn send_reading(
    client: &reqwest::Client,
    config: &CollarConfig,
    reading: &SensorReading,
) -> anyhow::Result<UploadOutcome> {
    let payload = UploadPayload::new(reading, &config.identity);

    let response = client
        .post(&config.upload_url)
        .header("User-Agent", USER_AGENT)
        .bearer_auth(&config.api_key)
        .json(&payload)
        .send()
        .await
        .context("POST did not complete")?;

    Ok(UploadOutcome::from_status(response.status().as_u16()))
}
