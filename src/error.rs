//! Fault taxonomy shared by the telemetry components.
//!
//! Only [`InitFault`] stops the node. Every other fault is absorbed where it
//! happens and reported through a log line.

use thiserror::Error;

/// Radio bring-up failure. Fatal: the telemetry loop halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitFault {
    #[error("radio did not come up")]
    Radio,
    #[error("radio rejected the modulation parameters")]
    Modulation,
}

/// Per-device probe failure. The device is skipped for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorFault {
    /// The address did not answer (scratchpad failed its CRC).
    #[error("device not answering on the bus")]
    NotFound,
    /// The bus could not report how its devices are powered.
    #[error("parasite power query unsupported")]
    ParasitePowerUnsupported,
    /// Bus held low, pin error or timeout.
    #[error("one-wire bus error")]
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFault {
    #[error("malformed telemetry record")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeFault {
    /// The record does not fit in a single LoRa payload.
    #[error("telemetry record exceeds the packet size")]
    TooLong,
    /// More readings than one record may carry.
    #[error("too many readings for one telemetry record")]
    TooMany,
}

/// Transmission failure. Not retried within the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendFault {
    #[error("link is down")]
    LinkDown,
    #[error("radio transmission failed")]
    Radio,
    #[error("channel is not configured as sender")]
    WrongRole,
}
