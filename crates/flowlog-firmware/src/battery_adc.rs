//! Battery voltage divider on ADC1

use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO1};

use flowlog_core::battery::{BatteryError, BatteryMonitor};

/// Samples summed per reading. The voltage formula divides them back out.
const SAMPLES: u16 = 10;

pub struct AdcBattery {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    pin: AdcPin<GPIO1<'static>, ADC1<'static>>,
}

impl AdcBattery {
    pub fn new(adc: ADC1<'static>, pin: GPIO1<'static>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(pin, Attenuation::_11dB);
        Self {
            adc: Adc::new(adc, config),
            pin,
        }
    }
}

impl BatteryMonitor for AdcBattery {
    fn read_raw(&mut self) -> Result<u16, BatteryError> {
        let mut sum: u16 = 0;
        for _ in 0..SAMPLES {
            let sample = self.adc.read_blocking(&mut self.pin);
            sum = sum.checked_add(sample).ok_or(BatteryError::Converter)?;
        }
        Ok(sum)
    }
}
