//! Beat detection on the raw IR channel of the optical pulse sensor.
//!
//! A slow exponential tracker follows the DC level of the photodiode; a
//! decaying adaptive threshold on the AC residue marks the rising edge of
//! each pulse. A refractory window keeps one pulse from counting twice.

/// Per-sample weight of the DC tracker.
const DC_ALPHA: f32 = 0.05;
/// Per-sample decay applied to the adaptive threshold.
const THRESHOLD_DECAY: f32 = 0.98;
/// Threshold floor, in raw ADC counts on the IR channel.
const MIN_THRESHOLD: f32 = 300.0;
/// Fraction of a detected pulse's amplitude re-armed as the next threshold.
const REARM_FRACTION: f32 = 0.8;
/// Minimum spacing between detections; caps the detector near 240 BPM.
const REFRACTORY_MS: u64 = 250;
/// Below this raw level the sensor has no contact; the IR LED reflects
/// almost nothing without hide or skin against the window.
const MIN_SIGNAL: f32 = 5_000.0;

#[derive(Debug)]
pub struct BeatDetector {
    dc_level: f32,
    threshold: f32,
    above: bool,
    last_beat_ms: u64,
    primed: bool,
}

impl Default for BeatDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BeatDetector {
    pub fn new() -> Self {
        Self {
            dc_level: 0.0,
            threshold: MIN_THRESHOLD,
            above: false,
            last_beat_ms: 0,
            primed: false,
        }
    }

    /// Feeds one raw IR sample; returns true when it completes a beat.
    pub fn update(&mut self, ir_raw: u32, now_ms: u64) -> bool {
        let ir = ir_raw as f32;

        if !self.primed {
            self.dc_level = ir;
            self.primed = true;
            return false;
        }

        if ir < MIN_SIGNAL {
            self.above = false;
            return false;
        }

        self.dc_level += (ir - self.dc_level) * DC_ALPHA;
        let ac = ir - self.dc_level;

        self.threshold = (self.threshold * THRESHOLD_DECAY).max(MIN_THRESHOLD);

        let was_above = self.above;
        self.above = ac > self.threshold;

        if self.above && !was_above && now_ms.saturating_sub(self.last_beat_ms) >= REFRACTORY_MS {
            self.last_beat_ms = now_ms;
            self.threshold = (ac * REARM_FRACTION).max(MIN_THRESHOLD);
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PERIOD_MS: u64 = 20;

    fn feed_waveform(detector: &mut BeatDetector, samples: &[u32]) -> Vec<u64> {
        let mut beats = Vec::new();
        for (i, &ir) in samples.iter().enumerate() {
            let now = i as u64 * SAMPLE_PERIOD_MS;
            if detector.update(ir, now) {
                beats.push(now);
            }
        }
        beats
    }

    /// Flat baseline with a square pulse every `period` samples.
    fn pulse_train(total: usize, period: usize, width: usize, amplitude: u32) -> Vec<u32> {
        (0..total)
            .map(|i| {
                let phase = i % period;
                if i >= period && phase < width {
                    50_000 + amplitude
                } else {
                    50_000
                }
            })
            .collect()
    }

    #[test]
    fn detects_one_beat_per_pulse() {
        // 50 samples/period at 20 ms -> one pulse per second for 6 seconds.
        let samples = pulse_train(350, 50, 5, 3_000);
        let beats = feed_waveform(&mut BeatDetector::new(), &samples);

        assert_eq!(beats.len(), 6);
        for pair in beats.windows(2) {
            assert_eq!(pair[1] - pair[0], 1_000);
        }
    }

    #[test]
    fn flat_signal_yields_no_beats() {
        let samples = vec![50_000; 500];
        let beats = feed_waveform(&mut BeatDetector::new(), &samples);
        assert!(beats.is_empty());
    }

    #[test]
    fn no_contact_yields_no_beats() {
        // Idle IR level with the window uncovered sits far below MIN_SIGNAL.
        let samples = vec![800; 500];
        let beats = feed_waveform(&mut BeatDetector::new(), &samples);
        assert!(beats.is_empty());
    }
}
