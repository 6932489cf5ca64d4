use core::fmt::Debug;

use ds18b20::Ds18b20;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use heapless::Vec;
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire, OneWireError, OneWireResult};

use crate::error::SensorFault;
use crate::onewire::{BusDelay, BusPin};
use crate::reading::{DeviceAddress, MAX_DEVICES, Reading, Resolution};

/// READ POWER SUPPLY: parasite-powered devices pull the following read slot low.
const READ_POWER_SUPPLY: u8 = 0xB4;

/// Alarm thresholds written when a device's scratchpad cannot be read first.
const DEFAULT_ALARM_LOW: i8 = -55;
const DEFAULT_ALARM_HIGH: i8 = 125;

pub type DeviceList = Vec<DeviceAddress, MAX_DEVICES>;

/// Outcome of one conversion, in the order of the requested addresses.
pub type Samples = Vec<(DeviceAddress, Result<Reading, SensorFault>), MAX_DEVICES>;

/// Temperature probes sharing one bus.
pub trait SensorSource {
    /// Enumerates attached probes in a stable order.
    fn list_devices(&mut self) -> DeviceList;

    /// Applies `resolution` to one device and returns the resolution the
    /// device reports afterwards.
    fn set_resolution(
        &mut self,
        address: &DeviceAddress,
        resolution: Resolution,
    ) -> Result<Resolution, SensorFault>;

    /// Whether any device on the bus runs from parasite power.
    fn parasite_power(&mut self) -> Result<bool, SensorFault>;

    /// Broadcasts one conversion and reads every address back.
    ///
    /// Blocks for the conversion time of the configured resolution.
    fn read_all(&mut self, addresses: &[DeviceAddress]) -> Samples;
}

/// DS18B20 probes on a one-wire bus.
pub struct Ds18b20Bus<P, D>
where
    P: InputPin + OutputPin,
{
    bus: OneWire<BusPin<P>>,
    delay: BusDelay<D>,
    /// Slowest resolution any configured device reported.
    slowest: Option<Resolution>,
}

impl<P, D> Ds18b20Bus<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    /// Fails with [`SensorFault::Bus`] when the line is not pulled high.
    pub fn new(pin: P, delay: D) -> Result<Self, SensorFault> {
        let bus = OneWire::new(BusPin::new(pin)).map_err(|e| {
            warn!("one-wire bus unusable: {:?}", e);
            bus_fault(&e)
        })?;
        Ok(Self {
            bus,
            delay: BusDelay(delay),
            slowest: None,
        })
    }

    fn probe(&self, address: &DeviceAddress) -> Result<Ds18b20, SensorFault> {
        Ds18b20::new::<<P as ErrorType>::Error>((*address).into()).map_err(|e| bus_fault(&e))
    }

    fn apply_resolution(
        &mut self,
        address: &DeviceAddress,
        resolution: Resolution,
    ) -> Result<Resolution, SensorFault> {
        let sensor = self.probe(address)?;
        // Keep whatever alarm thresholds the device already holds.
        let (low, high) = match sensor.read_data(&mut self.bus, &mut self.delay) {
            Ok(data) => (data.alarm_temp_low, data.alarm_temp_high),
            Err(_) => (DEFAULT_ALARM_LOW, DEFAULT_ALARM_HIGH),
        };
        sensor
            .set_config(low, high, resolution.into(), &mut self.bus, &mut self.delay)
            .map_err(|e| bus_fault(&e))?;
        let data = sensor
            .read_data(&mut self.bus, &mut self.delay)
            .map_err(|e| bus_fault(&e))?;
        Ok(data.resolution.into())
    }

    fn conversion_time_ms(&self) -> u16 {
        conversion_wait_ms(self.slowest)
    }

    fn read_one(&mut self, index: u8, address: &DeviceAddress) -> Result<Reading, SensorFault> {
        let sensor = self.probe(address)?;
        let data = sensor
            .read_data(&mut self.bus, &mut self.delay)
            .map_err(|e| bus_fault(&e))?;
        Reading::from_celsius(index, data.temperature).ok_or(SensorFault::Bus)
    }
}

impl<P, D> SensorSource for Ds18b20Bus<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn list_devices(&mut self) -> DeviceList {
        collect_devices(self.bus.devices(false, &mut self.delay))
    }

    fn set_resolution(
        &mut self,
        address: &DeviceAddress,
        resolution: Resolution,
    ) -> Result<Resolution, SensorFault> {
        let outcome = self.apply_resolution(address, resolution);
        self.slowest = Some(slowest_resolution(self.slowest, &outcome));
        outcome
    }

    fn parasite_power(&mut self) -> Result<bool, SensorFault> {
        self.bus
            .send_command(READ_POWER_SUPPLY, None, &mut self.delay)
            .map_err(|_| SensorFault::ParasitePowerUnsupported)?;
        let externally_powered = self
            .bus
            .read_bit(&mut self.delay)
            .map_err(|_| SensorFault::ParasitePowerUnsupported)?;
        Ok(!externally_powered)
    }

    fn read_all(&mut self, addresses: &[DeviceAddress]) -> Samples {
        let mut samples = Samples::new();
        if addresses.is_empty() {
            return samples;
        }

        if let Err(e) = ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut self.delay)
        {
            warn!("Failed to start temperature conversion: {:?}", e);
            let fault = bus_fault(&e);
            for address in addresses.iter().take(MAX_DEVICES) {
                let _ = samples.push((*address, Err(fault)));
            }
            return samples;
        }
        let wait_ms = self.conversion_time_ms();
        self.delay.0.delay_ms(u32::from(wait_ms));

        for (index, address) in addresses.iter().take(MAX_DEVICES).enumerate() {
            let outcome = self.read_one(index as u8, address);
            let _ = samples.push((*address, outcome));
        }
        samples
    }
}

/// A bus that failed to come up behaves as one with nothing attached.
impl<S: SensorSource> SensorSource for Option<S> {
    fn list_devices(&mut self) -> DeviceList {
        match self {
            Some(sensors) => sensors.list_devices(),
            None => DeviceList::new(),
        }
    }

    fn set_resolution(
        &mut self,
        address: &DeviceAddress,
        resolution: Resolution,
    ) -> Result<Resolution, SensorFault> {
        match self {
            Some(sensors) => sensors.set_resolution(address, resolution),
            None => Err(SensorFault::NotFound),
        }
    }

    fn parasite_power(&mut self) -> Result<bool, SensorFault> {
        match self {
            Some(sensors) => sensors.parasite_power(),
            None => Err(SensorFault::Bus),
        }
    }

    fn read_all(&mut self, addresses: &[DeviceAddress]) -> Samples {
        match self {
            Some(sensors) => sensors.read_all(addresses),
            None => Samples::new(),
        }
    }
}

/// Keeps the DS18B20s of a bus search, in search order.
///
/// Other families are skipped. The search stops at the first error (a ghost
/// device) or once `MAX_DEVICES` probes were found.
fn collect_devices<E: Debug>(
    found: impl Iterator<Item = OneWireResult<Address, E>>,
) -> DeviceList {
    let mut devices = DeviceList::new();
    for (position, found) in found.enumerate() {
        match found {
            Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                let address = DeviceAddress::from(address);
                if devices.push(address).is_err() {
                    warn!("More than {} probes on the bus, ignoring the rest", MAX_DEVICES);
                    break;
                }
                info!("Found device {} with address: {}", devices.len() - 1, address);
            }
            Ok(address) => {
                debug!(
                    "Skipping non-DS18B20 device {} (family 0x{:02X})",
                    DeviceAddress::from(address),
                    address.family_code()
                );
            }
            Err(e) => {
                warn!(
                    "Found ghost device at {} but could not detect address ({:?}). \
                     Check power and cabling",
                    position, e
                );
                break;
            }
        }
    }
    devices
}

/// Folds one resolution outcome into the slowest seen so far.
/// A device that refused the change keeps converting at 12 bits.
fn slowest_resolution(
    slowest: Option<Resolution>,
    outcome: &Result<Resolution, SensorFault>,
) -> Resolution {
    let actual = *outcome.as_ref().unwrap_or(&Resolution::Bits12);
    match slowest {
        Some(slowest) if slowest.conversion_time_ms() >= actual.conversion_time_ms() => slowest,
        _ => actual,
    }
}

/// Unconfigured devices convert at their 12-bit power-on default.
fn conversion_wait_ms(slowest: Option<Resolution>) -> u16 {
    slowest.unwrap_or(Resolution::Bits12).conversion_time_ms()
}

fn bus_fault<E>(error: &OneWireError<E>) -> SensorFault {
    match error {
        // An absent device leaves the bus idle, so its scratchpad reads as
        // all ones and fails the CRC.
        OneWireError::CrcMismatch => SensorFault::NotFound,
        OneWireError::FamilyCodeMismatch => SensorFault::NotFound,
        _ => SensorFault::Bus,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fault_mapping() {
        assert_eq!(
            bus_fault::<()>(&OneWireError::CrcMismatch),
            SensorFault::NotFound
        );
        assert_eq!(bus_fault::<()>(&OneWireError::BusNotHigh), SensorFault::Bus);
        assert_eq!(bus_fault(&OneWireError::PinError(())), SensorFault::Bus);
    }

    #[test]
    fn test_mock_reports_in_request_order() {
        let mut sensors = mock::MockSensors::new(&[Ok(2150), Err(SensorFault::NotFound)]);
        let devices = sensors.list_devices();
        let samples = sensors.read_all(&devices);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], (devices[0], Ok(Reading::new(0, 2150))));
        assert_eq!(samples[1], (devices[1], Err(SensorFault::NotFound)));
    }

    #[test]
    fn test_missing_bus_has_no_devices() {
        let mut sensors: Option<mock::MockSensors> = None;
        assert!(sensors.list_devices().is_empty());
        assert_eq!(sensors.parasite_power(), Err(SensorFault::Bus));
        assert!(sensors.read_all(&[]).is_empty());

        let mut sensors = Some(mock::MockSensors::new(&[Ok(100)]));
        assert_eq!(sensors.list_devices().len(), 1);
    }

    fn probe_address(family: u8, serial: u8) -> Address {
        Address(u64::from_le_bytes([family, serial, 0, 0, 0, 0, 0, 0]))
    }

    #[test]
    fn test_search_keeps_only_ds18b20() {
        let found: [OneWireResult<Address, ()>; 3] = [
            Ok(probe_address(0x28, 1)),
            Ok(probe_address(0x10, 2)),
            Ok(probe_address(0x28, 3)),
        ];
        let devices = collect_devices(found.into_iter());
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], DeviceAddress([0x28, 1, 0, 0, 0, 0, 0, 0]));
        assert_eq!(devices[1], DeviceAddress([0x28, 3, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_search_stops_at_ghost_device() {
        let found: [OneWireResult<Address, ()>; 3] = [
            Ok(probe_address(0x28, 1)),
            Err(OneWireError::CrcMismatch),
            Ok(probe_address(0x28, 3)),
        ];
        let devices = collect_devices(found.into_iter());
        assert_eq!(devices.as_slice(), &[DeviceAddress([0x28, 1, 0, 0, 0, 0, 0, 0])]);
    }

    #[test]
    fn test_search_is_capped() {
        let found = (0..20u8).map(|i| Ok::<_, OneWireError<()>>(probe_address(0x28, i)));
        let devices = collect_devices(found);
        assert_eq!(devices.len(), MAX_DEVICES);
        assert_eq!(devices[MAX_DEVICES - 1].0[1], (MAX_DEVICES - 1) as u8);
    }

    #[test]
    fn test_conversion_wait_follows_slowest_device() {
        assert_eq!(conversion_wait_ms(None), 750);

        let mut slowest = None;
        slowest = Some(slowest_resolution(slowest, &Ok(Resolution::Bits9)));
        assert_eq!(conversion_wait_ms(slowest), 94);
        slowest = Some(slowest_resolution(slowest, &Ok(Resolution::Bits11)));
        assert_eq!(conversion_wait_ms(slowest), 375);
        slowest = Some(slowest_resolution(slowest, &Ok(Resolution::Bits10)));
        assert_eq!(conversion_wait_ms(slowest), 375);
        slowest = Some(slowest_resolution(slowest, &Err(SensorFault::NotFound)));
        assert_eq!(conversion_wait_ms(slowest), 750);
    }
}
