/// Converts volumes into pump run times for a fixed-rate peristaltic pump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpTiming {
    pub flow_rate_ml_per_sec: f32,
}

impl Default for PumpTiming {
    fn default() -> Self {
        Self {
            flow_rate_ml_per_sec: 10.0,
        }
    }
}

impl PumpTiming {
    pub fn new(flow_rate_ml_per_sec: f32) -> Self {
        Self {
            flow_rate_ml_per_sec,
        }
    }

    pub fn duration_ms(&self, volume_liters: f32) -> u64 {
        self.duration_ms_for_ml(f64::from(volume_liters) * 1000.0)
    }

    pub fn duration_ms_for_ml(&self, volume_ml: f64) -> u64 {
        let rate = f64::from(self.flow_rate_ml_per_sec);
        if !volume_ml.is_finite() || volume_ml <= 0.0 || !rate.is_finite() || rate <= 0.0 {
            return 0;
        }
        (volume_ml / rate * 1000.0).round() as u64
    }
}

pub fn extraction_volume_liters(total_volume_l: f32, extraction_percent: f32) -> f32 {
    if !(total_volume_l > 0.0) || !(extraction_percent > 0.0) {
        return 0.0;
    }
    total_volume_l * extraction_percent / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_liter_at_default_rate() {
        let timing = PumpTiming::default();
        assert_eq!(timing.duration_ms(1.0), 100_000);
        assert_eq!(timing.duration_ms(2.0), 200_000);
        assert_eq!(timing.duration_ms(0.5), 50_000);
    }

    #[test]
    fn degenerate_volumes_yield_zero() {
        let timing = PumpTiming::default();
        assert_eq!(timing.duration_ms(0.0), 0);
        assert_eq!(timing.duration_ms(-3.0), 0);
        assert_eq!(timing.duration_ms(f32::NAN), 0);
        assert_eq!(PumpTiming::new(0.0).duration_ms(1.0), 0);
    }

    #[test]
    fn buffer_millilitres() {
        let timing = PumpTiming::default();
        assert_eq!(timing.duration_ms_for_ml(25.0), 2_500);
    }

    #[test]
    fn extraction_volume_is_percent_of_total() {
        assert_eq!(extraction_volume_liters(100.0, 10.0), 10.0);
        assert_eq!(extraction_volume_liters(0.0, 10.0), 0.0);
        assert_eq!(extraction_volume_liters(100.0, 0.0), 0.0);
        assert_eq!(
            PumpTiming::default().duration_ms(extraction_volume_liters(100.0, 10.0)),
            1_000_000
        );
    }
}
