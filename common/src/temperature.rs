//! Body-temperature reading validation.
//!
//! The DS18B20 reports -127 when the probe drops off the bus and can return
//! other garbage when wiring is marginal. Anything outside the sensor's
//! physical range is treated as a missing reading for that tick, never as a
//! number to forward.

/// Physical measurement range of the DS18B20.
pub const MIN_VALID_TEMP_C: f32 = -55.0;
pub const MAX_VALID_TEMP_C: f32 = 85.0;

/// Validates raw probe values and remembers the last good one.
///
/// The cached value is observable for diagnostics but is never substituted
/// for a failed reading; a bad tick surfaces as `None`.
#[derive(Debug, Default)]
pub struct TemperatureFilter {
    last_valid: Option<f32>,
}

impl TemperatureFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, raw_c: f32) -> Option<f32> {
        if !raw_c.is_finite() || !(MIN_VALID_TEMP_C..=MAX_VALID_TEMP_C).contains(&raw_c) {
            return None;
        }
        self.last_valid = Some(raw_c);
        Some(raw_c)
    }

    pub fn last_valid(&self) -> Option<f32> {
        self.last_valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_readings_pass_through() {
        let mut filter = TemperatureFilter::new();
        assert_eq!(filter.accept(38.6), Some(38.6));
        assert_eq!(filter.accept(-55.0), Some(-55.0));
        assert_eq!(filter.accept(85.0), Some(85.0));
    }

    #[test]
    fn disconnected_sentinel_is_rejected() {
        let mut filter = TemperatureFilter::new();
        assert_eq!(filter.accept(-127.0), None);
        assert_eq!(filter.last_valid(), None);
    }

    #[test]
    fn out_of_range_and_nan_are_rejected() {
        let mut filter = TemperatureFilter::new();
        assert_eq!(filter.accept(85.1), None);
        assert_eq!(filter.accept(-55.5), None);
        assert_eq!(filter.accept(f32::NAN), None);
        assert_eq!(filter.accept(f32::INFINITY), None);
    }

    #[test]
    fn cache_tracks_last_good_but_is_not_served_for_bad_ticks() {
        let mut filter = TemperatureFilter::new();
        assert_eq!(filter.accept(39.1), Some(39.1));

        // A later bad reading must yield None even though a cached value exists.
        assert_eq!(filter.accept(-127.0), None);
        assert_eq!(filter.last_valid(), Some(39.1));
    }
}
