// Data carried between the probes, the radio and the display

use core::fmt;

/// Maximum number of probes tracked on one bus.
pub const MAX_DEVICES: usize = 8;

/// 64-bit ROM code of a one-wire device, in bus order (family code first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub [u8; 8]);

impl DeviceAddress {
    pub fn family_code(&self) -> u8 {
        self.0[0]
    }
}

impl From<one_wire_bus::Address> for DeviceAddress {
    fn from(address: one_wire_bus::Address) -> Self {
        // The driver keeps the ROM code as a little-endian u64, so the first
        // byte on the wire is the least significant one.
        Self(address.0.to_le_bytes())
    }
}

impl From<DeviceAddress> for one_wire_bus::Address {
    fn from(address: DeviceAddress) -> Self {
        one_wire_bus::Address(u64::from_le_bytes(address.0))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// One temperature sample, stored as hundredths of a degree Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Position of the device in the enumeration order.
    pub index: u8,
    pub centi_celsius: i32,
}

impl Reading {
    pub const fn new(index: u8, centi_celsius: i32) -> Self {
        Self {
            index,
            centi_celsius,
        }
    }

    /// Rounds to the nearest 0.01 °C. Returns `None` for NaN or infinite input.
    pub fn from_celsius(index: u8, celsius: f32) -> Option<Self> {
        if !celsius.is_finite() {
            return None;
        }
        let scaled = celsius * 100.0;
        // no_std has no f32::round
        let rounded = if scaled >= 0.0 {
            scaled + 0.5
        } else {
            scaled - 0.5
        };
        if rounded >= i32::MAX as f32 || rounded <= i32::MIN as f32 {
            return None;
        }
        Some(Self::new(index, rounded as i32))
    }

    pub fn celsius(&self) -> f32 {
        self.centi_celsius as f32 / 100.0
    }
}

/// Conversion resolution of a DS18B20, trading precision for conversion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl Resolution {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            9 => Some(Resolution::Bits9),
            10 => Some(Resolution::Bits10),
            11 => Some(Resolution::Bits11),
            12 => Some(Resolution::Bits12),
            _ => None,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Resolution::Bits9 => 9,
            Resolution::Bits10 => 10,
            Resolution::Bits11 => 11,
            Resolution::Bits12 => 12,
        }
    }

    /// Upper bound of one conversion, rounded up to whole milliseconds.
    pub fn conversion_time_ms(&self) -> u16 {
        match self {
            Resolution::Bits9 => 94,
            Resolution::Bits10 => 188,
            Resolution::Bits11 => 375,
            Resolution::Bits12 => 750,
        }
    }
}

impl From<Resolution> for ds18b20::Resolution {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Bits9 => ds18b20::Resolution::Bits9,
            Resolution::Bits10 => ds18b20::Resolution::Bits10,
            Resolution::Bits11 => ds18b20::Resolution::Bits11,
            Resolution::Bits12 => ds18b20::Resolution::Bits12,
        }
    }
}

impl From<ds18b20::Resolution> for Resolution {
    fn from(resolution: ds18b20::Resolution) -> Self {
        match resolution {
            ds18b20::Resolution::Bits9 => Resolution::Bits9,
            ds18b20::Resolution::Bits10 => Resolution::Bits10,
            ds18b20::Resolution::Bits11 => Resolution::Bits11,
            ds18b20::Resolution::Bits12 => Resolution::Bits12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_address_prints_bus_order() {
        let address = DeviceAddress([0x28, 0xFF, 0x0A, 0x64, 0x1E, 0x0F, 0x00, 0x9C]);
        assert_eq!(address.to_string(), "28FF0A641E0F009C");
        assert_eq!(address.family_code(), 0x28);
    }

    #[test]
    fn test_address_driver_conversion() {
        let address = DeviceAddress([0x28, 1, 2, 3, 4, 5, 6, 7]);
        let raw: one_wire_bus::Address = address.into();
        assert_eq!(raw.family_code(), 0x28);
        assert_eq!(DeviceAddress::from(raw), address);
    }

    #[test]
    fn test_from_celsius_rounds_to_hundredths() {
        assert_eq!(Reading::from_celsius(0, 21.5), Some(Reading::new(0, 2150)));
        assert_eq!(Reading::from_celsius(1, 21.0625), Some(Reading::new(1, 2106)));
        assert_eq!(Reading::from_celsius(0, -10.125), Some(Reading::new(0, -1013)));
        assert_eq!(Reading::from_celsius(0, f32::NAN), None);
        assert_eq!(Reading::from_celsius(0, f32::INFINITY), None);
    }

    #[test]
    fn test_resolution_bits() {
        for bits in 9..=12 {
            assert_eq!(Resolution::from_bits(bits).map(|r| r.bits()), Some(bits));
        }
        assert_eq!(Resolution::from_bits(8), None);
        assert!(Resolution::Bits9.conversion_time_ms() < Resolution::Bits12.conversion_time_ms());
    }
}
