//! Supply voltage monitoring

use thiserror_no_std::Error;

use crate::config::VoltageFormula;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryError {
    #[error("battery converter not ready")]
    NotReady,
    #[error("battery converter failed")]
    Converter,
}

/// Raw reading of the battery voltage divider.
pub trait BatteryMonitor {
    fn read_raw(&mut self) -> Result<u16, BatteryError>;

    /// The reading converted with `formula`.
    fn volts(&mut self, formula: VoltageFormula) -> Result<f32, BatteryError> {
        self.read_raw().map(formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::divided_adc_volts;

    struct Fixed(u16);

    impl BatteryMonitor for Fixed {
        fn read_raw(&mut self) -> Result<u16, BatteryError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_volts_applies_formula() {
        let volts = Fixed(240).volts(divided_adc_volts).unwrap();
        assert_eq!(volts, divided_adc_volts(240));
    }
}
