#![cfg_attr(not(test), no_std)]

/// Build-time node configuration.
pub mod config;
/// Row-based text output on the OLED.
pub mod display;
pub mod error;
/// Point-to-point LoRa link.
pub mod lora;
pub mod onewire;
/// Text records exchanged over the air.
pub mod protocol;
pub mod reading;
/// DS18B20 probes on a one-wire bus.
pub mod sensor;
pub mod telemetry;
