//! Common Utilities
//!
//! Decibel conversions used by the transmit amplitude stage

/// Convert a linear power ratio to dB
pub fn power_to_db(power: f32) -> f32 {
    10.0 * power.log10()
}

/// Convert a gain in dB to a linear amplitude factor
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversions() {
        assert!((power_to_db(100.0) - 20.0).abs() < 1e-4);
        assert!((power_to_db(0.5) + 3.0103).abs() < 1e-3);
        assert!((db_to_amplitude(-6.0) - 0.501_187).abs() < 1e-4);
        assert!((db_to_amplitude(20.0) - 10.0).abs() < 1e-4);
    }
}
