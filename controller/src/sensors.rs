//! I2C environmental sensors. Every read is fail-soft: a flaky bus or
//! an unplugged probe yields `None` for that sample and the cycle moves
//! on.

use std::time::Duration;

use rppal::i2c::I2c;
use tracing::{debug, warn};

use fieldstation_common::SensorSampleSet;

const SHT20_ADDRESS: u16 = 0x40;
const SHT20_CMD_TEMPERATURE: u8 = 0xE3;
const SHT20_CMD_HUMIDITY: u8 = 0xE5;
const LUX_ADDRESS: u16 = 0x4A;

/// The two heads sit on different buses: the lux head hangs off the
/// software I2C on bus 0, the SHT20 off the hardware bus 1.
const LUX_BUS: u8 = 0;
const CLIMATE_BUS: u8 = 1;

pub trait EnvironmentSensors {
    fn read_temperature(&mut self) -> Option<f64>;
    fn read_humidity(&mut self) -> Option<f64>;
    fn read_lux(&mut self) -> Option<f64>;
    fn close(&mut self);
}

pub struct I2cSensors {
    climate_bus: Option<I2c>,
    lux_bus: Option<I2c>,
}

impl I2cSensors {
    /// Bus acquisition is fail-soft per bus; a station with only one
    /// head attached still reads the other, and a station with no
    /// sensor board still runs its imaging cycle.
    pub fn new() -> Self {
        Self {
            climate_bus: open_bus(CLIMATE_BUS),
            lux_bus: open_bus(LUX_BUS),
        }
    }

    /// Hold-master measurement: the sensor stretches the clock until the
    /// conversion finishes, then returns MSB, LSB, CRC.
    fn sht20_raw(&mut self, command: u8) -> Option<u16> {
        let bus = self.climate_bus.as_mut()?;
        if let Err(err) = bus.set_slave_address(SHT20_ADDRESS) {
            debug!("sht20 address select failed: {err}");
            return None;
        }
        if let Err(err) = bus.write(&[command]) {
            debug!("sht20 command 0x{command:02X} failed: {err}");
            return None;
        }

        let mut buffer = [0u8; 3];
        if let Err(err) = bus.read(&mut buffer) {
            debug!("sht20 read failed: {err}");
            return None;
        }

        // Low two bits are status flags, not measurement data.
        Some(u16::from_be_bytes([buffer[0], buffer[1]]) & !0x0003)
    }
}

impl EnvironmentSensors for I2cSensors {
    fn read_temperature(&mut self) -> Option<f64> {
        let raw = self.sht20_raw(SHT20_CMD_TEMPERATURE)?;
        Some(f64::from(raw) * 175.72 / 65536.0 - 46.85)
    }

    fn read_humidity(&mut self) -> Option<f64> {
        let raw = self.sht20_raw(SHT20_CMD_HUMIDITY)?;
        Some(f64::from(raw) * 125.0 / 65536.0 - 6.0)
    }

    fn read_lux(&mut self) -> Option<f64> {
        let bus = self.lux_bus.as_mut()?;
        if let Err(err) = bus.set_slave_address(LUX_ADDRESS) {
            debug!("lux address select failed: {err}");
            return None;
        }

        let mut buffer = [0u8; 4];
        if let Err(err) = bus.read(&mut buffer) {
            debug!("lux read failed: {err}");
            return None;
        }
        Some(f64::from(u32::from_le_bytes(buffer)) * 1.4 / 1000.0)
    }

    fn close(&mut self) {
        // Dropping the handles releases both buses.
        self.climate_bus = None;
        self.lux_bus = None;
    }
}

fn open_bus(bus: u8) -> Option<I2c> {
    match I2c::with_bus(bus) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("i2c bus {bus} unavailable: {err}");
            None
        }
    }
}

/// Take `count` samples per channel, spaced `interval` apart. Failed
/// reads are skipped, so the per-channel vectors may be shorter than
/// `count`.
pub async fn collect_samples<S: EnvironmentSensors>(
    sensors: &mut S,
    count: usize,
    interval: Duration,
) -> SensorSampleSet {
    let mut samples = SensorSampleSet::default();

    for index in 0..count {
        if let Some(value) = sensors.read_temperature() {
            samples.temperatures.push(value);
        }
        if let Some(value) = sensors.read_humidity() {
            samples.humidities.push(value);
        }
        if let Some(value) = sensors.read_lux() {
            samples.lux_values.push(value);
        }

        if index + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }

    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSensors {
        temperatures: Vec<Option<f64>>,
        closed: bool,
    }

    impl EnvironmentSensors for FakeSensors {
        fn read_temperature(&mut self) -> Option<f64> {
            self.temperatures.pop().flatten()
        }

        fn read_humidity(&mut self) -> Option<f64> {
            Some(55.0)
        }

        fn read_lux(&mut self) -> Option<f64> {
            None
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn failed_reads_are_skipped_not_recorded() {
        let mut sensors = FakeSensors {
            temperatures: vec![Some(20.1), None, Some(20.3)],
            closed: false,
        };

        let samples = collect_samples(&mut sensors, 3, Duration::ZERO).await;

        assert_eq!(samples.temperatures.len(), 2);
        assert_eq!(samples.humidities.len(), 3);
        assert!(samples.lux_values.is_empty());
    }

    #[test]
    fn sensor_heads_sit_on_their_wired_buses() {
        assert_eq!(LUX_BUS, 0);
        assert_eq!(CLIMATE_BUS, 1);
    }

    #[test]
    fn sht20_conversion_formulas() {
        // Datasheet example raw values.
        let raw_temp = 0x63FC_u16;
        let temperature = f64::from(raw_temp) * 175.72 / 65536.0 - 46.85;
        assert!((temperature - 21.5).abs() < 0.5);

        let raw_humidity = 0x7C80_u16;
        let humidity = f64::from(raw_humidity) * 125.0 / 65536.0 - 6.0;
        assert!((humidity - 54.8).abs() < 0.5);
    }
}
