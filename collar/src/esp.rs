use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, BLOCK},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver, I2C0},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpServerConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use collar_common::{
    connectivity::{ASSOCIATION_ATTEMPTS, ASSOCIATION_RETRY_DELAY_MS},
    parse_save_form,
    portal::{PORTAL_AP_PASSWORD, PORTAL_AP_SSID, RESTART_DELAY_MS},
    BeatDetector, CheckAction, CollarConfig, ConnectivityMonitor, HeartRateEngine, ScanNetwork,
    ScanResponse, SensorReading, TemperatureFilter, UploadOutcome, UploadPayload, WifiCredentials,
};

const NVS_NAMESPACE: &str = "collar";
const NVS_WIFI_KEY: &str = "wifi_json";
const NVS_CONFIG_KEY: &str = "config_json";

const ONE_WIRE_PIN: i32 = 4;
const I2C_SDA_PIN: i32 = 21;
const I2C_SCL_PIN: i32 = 22;

const USER_AGENT: &str = "ControlBovino/2.0";
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const SAMPLE_PERIOD_MS: u64 = 20;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Collar WiFi Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .network{padding:.5rem;border:1px solid #ddd;border-radius:4px;margin:.3rem 0;cursor:pointer;background:#f9f9f9}
    .network:hover{background:#e9e9e9}.rssi{float:right;color:#555}
    .muted{color:#555}button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Collar WiFi Setup</h1>
  <p class="muted">The collar cannot reach the internet. Pick a network and
  save new credentials; the device restarts and reconnects on its own.</p>

  <div class="card">
    <h2>Nearby networks</h2>
    <div id="networks" class="muted">Scanning...</div>
  </div>

  <div class="card">
    <form method="POST" action="/save">
      <label>Network (SSID)</label><input id="ssid" name="ssid" type="text" required>
      <label>Password</label><input id="password" name="password" type="password">
      <label><input type="checkbox" onchange="password.type=this.checked?'text':'password'"> Show password</label>
      <button type="submit">Save and restart</button>
    </form>
  </div>

  <script>
    fetch('/scan').then(r=>r.json()).then(data=>{
      const list=document.getElementById('networks');
      if(!data.networks.length){list.textContent='No networks found';return;}
      list.innerHTML='';
      data.networks.forEach(n=>{
        const div=document.createElement('div');
        div.className='network';
        div.innerHTML=(n.secure?'&#128274; ':'')+n.ssid+'<span class="rssi">'+n.rssi+' dBm</span>';
        div.onclick=()=>{document.getElementById('ssid').value=n.ssid;};
        list.appendChild(div);
      });
    }).catch(()=>{document.getElementById('networks').textContent='Scan failed';});
  </script>
</body>
</html>
"#;

const SAVED_HTML: &str = r#"<!doctype html>
<html><head><title>Saved</title><meta http-equiv="refresh" content="5;url=/"></head>
<body style="font-family:Arial;text-align:center;margin-top:50px">
<h1>Credentials saved</h1>
<p>The collar restarts in a moment and connects to the new network.</p>
</body></html>
"#;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn load_credentials(&self) -> anyhow::Result<WifiCredentials> {
        match self.load_json(NVS_WIFI_KEY)? {
            Some(creds) => Ok(creds),
            None => Ok(WifiCredentials::default()),
        }
    }

    /// Persists both fields together; there is no partial write path.
    fn save_credentials(&self, credentials: &WifiCredentials) -> anyhow::Result<()> {
        self.save_json(NVS_WIFI_KEY, credentials)
    }

    fn load_config(&self) -> anyhow::Result<CollarConfig> {
        match self.load_json(NVS_CONFIG_KEY)? {
            Some(config) => Ok(config),
            None => Ok(CollarConfig::default()),
        }
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(key, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str(value)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(value)?;
        nvs.set_str(key, &payload)?;
        Ok(())
    }
}

struct TemperatureProbe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
    filter: TemperatureFilter,
}

impl TemperatureProbe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
            filter: TemperatureFilter::new(),
        };
        probe.scan_bus();
        Ok(probe)
    }

    fn is_available(&self) -> bool {
        self.address.is_some()
    }

    fn scan_bus(&mut self) {
        let mut first_ds18: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first_ds18;

        if let Some(address) = self.address {
            info!(
                "DS18B20 ready on GPIO{} ({} one-wire device(s), using {:?})",
                ONE_WIRE_PIN, device_count, address
            );
        } else {
            warn!(
                "no DS18B20 on GPIO{}; temperature will be reported as missing",
                ONE_WIRE_PIN
            );
        }
    }

    /// One validated reading, or `None` when the probe is absent or the raw
    /// value is outside the physical range. Never serves the cached value.
    fn read_celsius(&mut self) -> Option<f32> {
        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => match self.filter.accept(data.temperature) {
                Some(temp_c) => {
                    info!("[DS18B20] body temperature: {temp_c:.1} C");
                    Some(temp_c)
                }
                None => {
                    warn!(
                        "DS18B20 reading {:.1} out of physical range; reported as missing",
                        data.temperature
                    );
                    None
                }
            },
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                None
            }
        }
    }
}

// MAX30105 register map, the handful this firmware touches.
const MAX3010X_ADDR: u8 = 0x57;
const REG_FIFO_WR_PTR: u8 = 0x04;
const REG_FIFO_RD_PTR: u8 = 0x06;
const REG_FIFO_DATA: u8 = 0x07;
const REG_FIFO_CONFIG: u8 = 0x08;
const REG_MODE_CONFIG: u8 = 0x09;
const REG_SPO2_CONFIG: u8 = 0x0A;
const REG_LED1_PA: u8 = 0x0C;
const REG_LED2_PA: u8 = 0x0D;
const REG_LED3_PA: u8 = 0x0E;
const REG_PART_ID: u8 = 0xFF;
const MAX3010X_PART_ID: u8 = 0x15;
const MODE_RESET: u8 = 0x40;
const MODE_SPO2: u8 = 0x03;

struct PulseSensor {
    i2c: I2cDriver<'static>,
    detector: BeatDetector,
}

impl PulseSensor {
    fn new(i2c: I2C0, sda: AnyIOPin, scl: AnyIOPin) -> anyhow::Result<Self> {
        let config = I2cConfig::new().baudrate(Hertz(400_000));
        let i2c = I2cDriver::new(i2c, sda, scl, &config)?;

        let mut sensor = Self {
            i2c,
            detector: BeatDetector::new(),
        };

        let part_id = sensor.read_reg(REG_PART_ID)?;
        if part_id != MAX3010X_PART_ID {
            bail!("unexpected part id 0x{part_id:02x} at address 0x{MAX3010X_ADDR:02x}");
        }

        sensor.write_reg(REG_MODE_CONFIG, MODE_RESET)?;
        thread::sleep(Duration::from_millis(100));

        sensor.write_reg(REG_FIFO_CONFIG, 0x50)?; // average 4 samples, roll over on full
        sensor.write_reg(REG_MODE_CONFIG, MODE_SPO2)?; // red + infrared active
        sensor.write_reg(REG_SPO2_CONFIG, 0x27)?; // 100 Hz, 411 us pulses
        sensor.write_reg(REG_LED1_PA, 0x0A)?; // red low: presence only
        sensor.write_reg(REG_LED2_PA, 0x1F)?; // infrared carries the pulse signal
        sensor.write_reg(REG_LED3_PA, 0x00)?; // green off
        sensor.write_reg(REG_FIFO_WR_PTR, 0x00)?;
        sensor.write_reg(REG_FIFO_RD_PTR, 0x00)?;

        info!("MAX30105 ready on I2C (SDA GPIO{I2C_SDA_PIN}, SCL GPIO{I2C_SCL_PIN})");
        Ok(sensor)
    }

    /// Feeds the newest IR sample to the beat detector; true on a beat.
    fn sample(&mut self, now_ms: u64) -> bool {
        match self.read_ir() {
            Some(ir) => self.detector.update(ir, now_ms),
            None => false,
        }
    }

    fn read_ir(&mut self) -> Option<u32> {
        // One FIFO entry in SpO2 mode: 3 bytes red, then 3 bytes infrared.
        let mut data = [0_u8; 6];
        self.i2c
            .write_read(MAX3010X_ADDR, &[REG_FIFO_DATA], &mut data, BLOCK)
            .ok()?;
        let ir =
            ((data[3] as u32) << 16 | (data[4] as u32) << 8 | data[5] as u32) & 0x03_FFFF;
        Some(ir)
    }

    fn read_reg(&mut self, reg: u8) -> anyhow::Result<u8> {
        let mut value = [0_u8; 1];
        self.i2c
            .write_read(MAX3010X_ADDR, &[reg], &mut value, BLOCK)?;
        Ok(value[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> anyhow::Result<()> {
        self.i2c.write(MAX3010X_ADDR, &[reg, value], BLOCK)?;
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load collar config from NVS: {err:#}");
        CollarConfig::default()
    });
    config.sanitize();

    let credentials = nvs_store.load_credentials().unwrap_or_else(|err| {
        warn!("failed to load wifi credentials from NVS: {err:#}");
        WifiCredentials::default()
    });

    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let mut temperature = TemperatureProbe::new(pins.gpio4.downgrade())
        .context("failed to initialize temperature probe")?;

    let mut pulse = match PulseSensor::new(
        i2c0,
        pins.gpio21.downgrade(),
        pins.gpio22.downgrade(),
    ) {
        Ok(sensor) => Some(sensor),
        Err(err) => {
            warn!("MAX30105 unavailable; heart rate will be simulated: {err:#}");
            None
        }
    };

    let mut heart_rate = HeartRateEngine::new(pulse.is_some(), unsafe {
        esp_idf_svc::sys::esp_random() as u64
    });

    let mut monitor = ConnectivityMonitor::new(credentials.is_configured());

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if monitor.boot_action() == CheckAction::OpenPortal {
        warn!("no stored wifi credentials; starting configuration portal");
        return run_config_portal(&mut wifi, nvs_store);
    }

    if associate(&mut wifi, &credentials)? {
        let internet_ok = probe_internet(&config.probe_url, config.http_timeout_s);
        monitor.association_succeeded(internet_ok);
        if internet_ok {
            info!("internet reachability verified");
        } else {
            warn!("wifi associated but internet unreachable");
        }
    } else {
        monitor.association_failed();
        let _ = wifi.stop();
        warn!("association retries exhausted; starting configuration portal");
        return run_config_portal(&mut wifi, nvs_store);
    }

    disable_wifi_power_save();
    config.identity.mac_address = station_mac();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    info!(
        "collar `{}` monitoring `{}` ({})",
        config.identity.collar_id, config.identity.cow_name, config.identity.mac_address
    );
    if !temperature.is_available() {
        warn!("running without temperature hardware");
    }

    let boot = Instant::now();
    let upload_interval_ms = u64::from(config.upload_interval_s) * 1000;
    let mut last_upload_ms: Option<u64> = None;
    let mut current_temp: Option<f32> = None;

    loop {
        feed_watchdog();
        let now_ms = boot.elapsed().as_millis() as u64;

        // Pulse sampling runs on every tick; the cadences below are much
        // slower than beat detection can tolerate.
        let beat = pulse.as_mut().map(|p| p.sample(now_ms)).unwrap_or(false);
        heart_rate.measure(beat, current_temp, now_ms);

        if monitor.check_due(now_ms) {
            let action = if wifi.is_connected().unwrap_or(false) {
                monitor.probe_result(probe_internet(&config.probe_url, config.http_timeout_s))
            } else {
                warn!("wifi link lost; reattempting association");
                monitor.link_lost()
            };

            match action {
                CheckAction::Reconnect => {
                    if associate(&mut wifi, &credentials)? {
                        let internet_ok =
                            probe_internet(&config.probe_url, config.http_timeout_s);
                        monitor.association_succeeded(internet_ok);
                    } else {
                        monitor.association_failed();
                        let _ = wifi.stop();
                        warn!("reconnection failed; starting configuration portal");
                        return run_config_portal(&mut wifi, nvs_store.clone());
                    }
                }
                CheckAction::OpenPortal => {
                    warn!(
                        "{} consecutive internet failures; tearing down wifi for the portal",
                        monitor.consecutive_failures()
                    );
                    let _ = wifi.disconnect();
                    let _ = wifi.stop();
                    return run_config_portal(&mut wifi, nvs_store.clone());
                }
                CheckAction::None => {}
            }
        }

        let upload_due = last_upload_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= upload_interval_ms);
        if upload_due {
            last_upload_ms = Some(now_ms);

            // Sensor sampling always precedes upload formatting.
            current_temp = temperature.read_celsius();
            let reading = SensorReading {
                temperature_c: current_temp,
                heart_rate_bpm: heart_rate.current_rate(),
                temperature_real: current_temp.is_some(),
                heart_rate_real: !heart_rate.is_simulated(),
            };

            if monitor.is_online() {
                match send_reading(&config, &reading) {
                    Ok(outcome) if outcome.is_success() => info!("upload {outcome}"),
                    Ok(outcome) => warn!("upload {outcome}"),
                    Err(err) => warn!("upload transport failure: {err:#}"),
                }
            } else {
                info!(
                    "connectivity degraded ({:?}); reading dropped, not queued",
                    monitor.state()
                );
            }
        }

        thread::sleep(Duration::from_millis(SAMPLE_PERIOD_MS));
    }
}

/// Bounded station association: 20 attempts, one second apart. Returns
/// false when the window is exhausted without an association.
fn associate(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    credentials: &WifiCredentials,
) -> anyhow::Result<bool> {
    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credentials.ssid);

    for attempt in 1..=ASSOCIATION_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(true);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{ASSOCIATION_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                if attempt < ASSOCIATION_ATTEMPTS {
                    thread::sleep(Duration::from_millis(ASSOCIATION_RETRY_DELAY_MS));
                }
            }
        }
    }

    Ok(false)
}

/// Best-effort reachability probe: only completion of the GET matters,
/// the response status and body are ignored.
fn probe_internet(url: &str, timeout_s: u32) -> bool {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(timeout_s as u64)),
        ..Default::default()
    };
    let mut client = match EspHttpConnection::new(&http_conf) {
        Ok(connection) => HttpClient::wrap(connection),
        Err(err) => {
            warn!("internet probe setup failed: {err:?}");
            return false;
        }
    };

    let request = match client.request(Method::Get, url, &[]) {
        Ok(request) => request,
        Err(err) => {
            warn!("internet probe request failed: {err:?}");
            return false;
        }
    };

    match request.submit() {
        Ok(_) => true,
        Err(err) => {
            warn!("internet probe failed: {err:?}");
            false
        }
    }
}

fn send_reading(config: &CollarConfig, reading: &SensorReading) -> anyhow::Result<UploadOutcome> {
    let payload = serde_json::to_string(&UploadPayload::new(reading, &config.identity))?;
    let authorization = format!("Bearer {}", config.api_key);
    let content_length = payload.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("User-Agent", USER_AGENT),
        ("Authorization", authorization.as_str()),
        ("Content-Length", content_length.as_str()),
    ];

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(config.http_timeout_s as u64)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let mut request = client
        .request(Method::Post, &config.upload_url, &headers)
        .map_err(|err| anyhow!("{err:?}"))?;
    request
        .write_all(payload.as_bytes())
        .map_err(|err| anyhow!("{err:?}"))?;
    let response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    Ok(UploadOutcome::from_status(response.status()))
}

/// Serves the configuration portal until credentials are saved; the only
/// way out is the restart scheduled by the `/save` handler.
fn run_config_portal(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    nvs_store: NvsStore,
) -> anyhow::Result<()> {
    // The radio cannot scan reliably while serving the AP, so the network
    // list is captured first and served from this snapshot.
    let networks = scan_networks(wifi);
    start_portal_ap(wifi)?;

    let _server = create_portal_http_server(nvs_store, networks)?;
    info!(
        "configuration portal up on `{}` (password `{}`)",
        PORTAL_AP_SSID, PORTAL_AP_PASSWORD
    );

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn scan_networks(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> Vec<ScanNetwork> {
    let result = (|| -> anyhow::Result<Vec<ScanNetwork>> {
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        let found = wifi.scan()?;
        let _ = wifi.stop();

        Ok(found
            .into_iter()
            .map(|ap| ScanNetwork {
                ssid: ap.ssid.as_str().to_string(),
                rssi: ap.signal_strength as i32,
                secure: ap.auth_method.map_or(false, |method| method != AuthMethod::None),
            })
            .collect())
    })();

    match result {
        Ok(networks) => {
            info!("captured {} network(s) for the portal", networks.len());
            networks
        }
        Err(err) => {
            warn!("network scan failed: {err:#}");
            Vec::new()
        }
    }
}

fn start_portal_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PORTAL_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("portal AP SSID too long"))?,
        password: PORTAL_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("portal AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    Ok(())
}

fn create_portal_http_server(
    nvs_store: NvsStore,
    networks: Vec<ScanNetwork>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpServerConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(PORTAL_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let scan_response = ScanResponse { networks };
        server.fn_handler::<anyhow::Error, _>("/scan", Method::Get, move |req| {
            let body = serde_json::to_vec(&scan_response)?;
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/json; charset=utf-8")],
            )?
            .write_all(&body)?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let body = String::from_utf8_lossy(&body);

        match parse_save_form(&body) {
            Ok(credentials) => {
                nvs_store.save_credentials(&credentials)?;
                info!(
                    "credentials for `{}` saved; restarting shortly",
                    credentials.ssid
                );
                schedule_restart(RESTART_DELAY_MS);
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(SAVED_HTML.as_bytes())?;
                Ok(())
            }
            Err(err) => {
                warn!("rejected portal save: {err}");
                let message = err.to_string();
                req.into_response(400, None, &[("Content-Type", "text/plain")])?
                    .write_all(message.as_bytes())?;
                Ok(())
            }
        }
    })?;

    // Captive behavior: anything else bounces back to the portal root.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        req.into_response(302, Some("Found"), &[("Location", "/")])?;
        Ok(())
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn schedule_restart(delay_ms: u64) {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

fn station_mac() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_wifi_get_mac(
            esp_idf_svc::sys::wifi_interface_t_WIFI_IF_STA,
            mac.as_mut_ptr(),
        )
    };
    if rc == esp_idf_svc::sys::ESP_OK {
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    } else {
        warn!("failed to read station MAC: esp_err_t={rc}");
        String::new()
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
