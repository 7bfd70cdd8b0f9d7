//! Heart-rate estimation with a degrade-to-synthetic policy.
//!
//! When the optical sensor is present, detected beats feed a four-slot ring
//! buffer of accepted instantaneous rates and the published rate is a
//! smoothed blend. When the sensor is absent, or no beat has been accepted
//! recently, the published rate comes from a bovine physiological model
//! driven by body temperature, so downstream consumers always receive a
//! plausible number.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const RATE_WINDOW: usize = 4;
pub const BLEND_ALPHA: f32 = 0.75;

/// Accepted instantaneous rates must fall strictly inside this band.
pub const MIN_ACCEPTED_BPM: f32 = 20.0;
pub const MAX_ACCEPTED_BPM: f32 = 255.0;

/// With no accepted beat for this long the output switches to simulation.
pub const BEAT_STALENESS_MS: u64 = 5_000;

/// Fallback output before any measurement has happened.
pub const DEFAULT_RATE_BPM: u16 = 60;

/// Body temperature assumed when no reading is available.
pub const NORMAL_BODY_TEMP_C: f32 = 38.6;

/// Baseline pulse for a given body temperature, without jitter.
///
/// Piecewise model for cattle: fever drives tachycardia up to a 120 BPM
/// ceiling, hypothermia drives bradycardia down to a 48 BPM floor. Total
/// over all float inputs; NaN is treated as normal body temperature.
pub fn baseline_rate(temperature: Option<f32>) -> i32 {
    let t = match temperature {
        Some(t) if !t.is_nan() => t,
        _ => NORMAL_BODY_TEMP_C,
    };

    let base = if t >= 40.0 {
        (100.0 + (t - 40.0) * 20.0).min(120.0)
    } else if t >= 39.5 {
        85.0 + (t - 39.5) * 30.0
    } else if t >= 38.0 {
        60.0 + (t - 38.0) * 13.3
    } else if t >= 37.5 {
        55.0 + (t - 37.5) * 10.0
    } else {
        (48.0 + (t - 36.0) * 4.7).max(48.0)
    };

    base as i32
}

fn simulate(temperature: Option<f32>, rng: &mut ChaCha8Rng) -> u16 {
    let jitter: i32 = rng.gen_range(-3..=3);
    (baseline_rate(temperature) + jitter).max(1) as u16
}

/// Blend of the buffer's integer mean with the newest accepted sample.
///
/// The arithmetic is deliberate: integer division for the mean, then a
/// truncating float blend, matching the collar's historical behavior.
fn blended_rate(rates: &[u8; RATE_WINDOW], latest_bpm: f32) -> u16 {
    let mean = rates.iter().map(|&r| r as i32).sum::<i32>() / RATE_WINDOW as i32;
    (BLEND_ALPHA * mean as f32 + (1.0 - BLEND_ALPHA) * latest_bpm) as u16
}

#[derive(Debug)]
pub struct HeartRateEngine {
    available: bool,
    rates: [u8; RATE_WINDOW],
    rate_spot: usize,
    /// Last detected beat, accepted or not; anchors inter-beat intervals.
    last_beat_ms: Option<u64>,
    /// Last accepted beat; anchors the staleness fallback.
    last_accepted_ms: Option<u64>,
    bpm: u16,
    simulated: bool,
    rng: ChaCha8Rng,
}

impl HeartRateEngine {
    pub fn new(available: bool, rng_seed: u64) -> Self {
        Self {
            available,
            rates: [0; RATE_WINDOW],
            rate_spot: 0,
            last_beat_ms: None,
            last_accepted_ms: None,
            bpm: DEFAULT_RATE_BPM,
            simulated: true,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn current_rate(&self) -> u16 {
        self.bpm
    }

    /// True when the current rate came from the simulation model rather
    /// than accepted beats.
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Advances the engine by one tick.
    ///
    /// `beat_detected` reports whether the optical front-end saw a beat at
    /// `now_ms`; `temperature` is the current body temperature, if any,
    /// feeding the simulation model.
    pub fn measure(&mut self, beat_detected: bool, temperature: Option<f32>, now_ms: u64) -> u16 {
        if !self.available {
            self.bpm = simulate(temperature, &mut self.rng);
            self.simulated = true;
            return self.bpm;
        }

        if beat_detected {
            if let Some(last) = self.last_beat_ms {
                let delta_ms = now_ms.saturating_sub(last);
                if delta_ms > 0 {
                    let instant_bpm = 60_000.0 / delta_ms as f32;
                    if instant_bpm > MIN_ACCEPTED_BPM && instant_bpm < MAX_ACCEPTED_BPM {
                        self.push_accepted(instant_bpm, now_ms);
                    }
                }
            }
            self.last_beat_ms = Some(now_ms);
        }

        let stale = match self.last_accepted_ms {
            Some(last) => now_ms.saturating_sub(last) > BEAT_STALENESS_MS,
            None => true,
        };
        if stale || self.bpm == 0 {
            self.bpm = simulate(temperature, &mut self.rng);
            self.simulated = true;
        }

        self.bpm
    }

    fn push_accepted(&mut self, instant_bpm: f32, now_ms: u64) {
        self.rates[self.rate_spot] = instant_bpm as u8;
        self.rate_spot = (self.rate_spot + 1) % RATE_WINDOW;
        self.bpm = blended_rate(&self.rates, instant_bpm);
        self.last_accepted_ms = Some(now_ms);
        self.simulated = false;
    }
}
