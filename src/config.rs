//! Build-time configuration.
//!
//! Values come from environment variables captured with `option_env!` when
//! the firmware is compiled (see `.cargo/config.toml`). Each value is
//! range-checked at startup; missing or invalid values fall back to a logged
//! default so a bad setting never stops the node from booting.

use core::fmt;
use core::str::FromStr;

use log::{info, warn};

use crate::reading::Resolution;

pub const DEFAULT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RESOLUTION_BITS: u8 = 9;
pub const DEFAULT_FREQUENCY_HZ: u32 = 868_000_000;
pub const DEFAULT_TX_POWER_DBM: i32 = 14;
pub const DEFAULT_SPREADING_FACTOR: u8 = 7;
pub const DEFAULT_POLL_WINDOW_MS: u64 = 100;

/// Fixed designation of a node for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

impl FromStr for LinkRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("sender") {
            Ok(LinkRole::Sender)
        } else if s.eq_ignore_ascii_case("receiver") {
            Ok(LinkRole::Receiver)
        } else {
            Err(())
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Sender => f.write_str("sender"),
            LinkRole::Receiver => f.write_str("receiver"),
        }
    }
}

/// Radio settings. Bandwidth, coding rate and preamble are fixed to the
/// Arduino LoRa library defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioConfig {
    pub frequency_hz: u32,
    pub tx_power_dbm: i32,
    pub spreading_factor: u8,
    pub poll_window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub role: LinkRole,
    /// Period of one sender cycle.
    pub interval_ms: u64,
    pub resolution: Resolution,
    pub radio: RadioConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: LinkRole::Sender,
            interval_ms: DEFAULT_INTERVAL_MS,
            resolution: Resolution::Bits9,
            radio: RadioConfig {
                frequency_hz: DEFAULT_FREQUENCY_HZ,
                tx_power_dbm: DEFAULT_TX_POWER_DBM,
                spreading_factor: DEFAULT_SPREADING_FACTOR,
                poll_window_ms: DEFAULT_POLL_WINDOW_MS,
            },
        }
    }
}

/// Raw values as captured at build time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOverrides<'a> {
    pub role: Option<&'a str>,
    pub interval_ms: Option<&'a str>,
    pub resolution_bits: Option<&'a str>,
    pub frequency_hz: Option<&'a str>,
    pub tx_power_dbm: Option<&'a str>,
    pub spreading_factor: Option<&'a str>,
    pub poll_window_ms: Option<&'a str>,
}

impl EnvOverrides<'static> {
    /// Values baked in from the build environment.
    pub fn from_build_env() -> Self {
        Self {
            role: option_env!("TELEMETRY_ROLE"),
            interval_ms: option_env!("TELEMETRY_INTERVAL_MS"),
            resolution_bits: option_env!("PROBE_RESOLUTION_BITS"),
            frequency_hz: option_env!("LORA_FREQUENCY_HZ"),
            tx_power_dbm: option_env!("LORA_TX_POWER_DBM"),
            spreading_factor: option_env!("LORA_SPREADING_FACTOR"),
            poll_window_ms: option_env!("LORA_POLL_WINDOW_MS"),
        }
    }
}

impl Config {
    pub fn resolve(env: &EnvOverrides<'_>) -> Self {
        let defaults = Config::default();

        let role = setting("TELEMETRY_ROLE", env.role, defaults.role, |_| true);
        let interval_ms = setting(
            "TELEMETRY_INTERVAL_MS",
            env.interval_ms,
            defaults.interval_ms,
            |v| (100..=3_600_000).contains(v),
        );
        let resolution_bits = setting(
            "PROBE_RESOLUTION_BITS",
            env.resolution_bits,
            DEFAULT_RESOLUTION_BITS,
            |v| (9..=12).contains(v),
        );
        // Valid ISM bands: 433.05-434.79 MHz (worldwide), 863-870 MHz (EU), 902-928 MHz (US)
        let frequency_hz = setting(
            "LORA_FREQUENCY_HZ",
            env.frequency_hz,
            defaults.radio.frequency_hz,
            |v| {
                (433_050_000..=434_790_000).contains(v)
                    || (863_000_000..=870_000_000).contains(v)
                    || (902_000_000..=928_000_000).contains(v)
            },
        );
        // SX1276 supports -4 dBm to +20 dBm on PA_BOOST pin
        let tx_power_dbm = setting(
            "LORA_TX_POWER_DBM",
            env.tx_power_dbm,
            defaults.radio.tx_power_dbm,
            |v| (-4..=20).contains(v),
        );
        let spreading_factor = setting(
            "LORA_SPREADING_FACTOR",
            env.spreading_factor,
            defaults.radio.spreading_factor,
            |v| (7..=12).contains(v),
        );
        let poll_window_ms = setting(
            "LORA_POLL_WINDOW_MS",
            env.poll_window_ms,
            defaults.radio.poll_window_ms,
            |v| (10..=10_000).contains(v),
        );

        Self {
            role,
            interval_ms,
            resolution: Resolution::from_bits(resolution_bits).unwrap_or(defaults.resolution),
            radio: RadioConfig {
                frequency_hz,
                tx_power_dbm,
                spreading_factor,
                poll_window_ms,
            },
        }
    }
}

/// Parses one value, falling back to `default` when it is missing,
/// unparsable or rejected by `valid`.
fn setting<T>(name: &str, raw: Option<&str>, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + fmt::Debug + Copy,
{
    let Some(raw) = raw else {
        info!("{} not configured, using default {:?}", name, default);
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => {
            info!("Using {} from config: {:?}", name, v);
            v
        }
        Ok(v) => {
            warn!("{} {:?} out of range, using default {:?}", name, v, default);
            default
        }
        Err(_) => {
            warn!("Invalid {} value '{}', using default {:?}", name, raw, default);
            default
        }
    }
}
