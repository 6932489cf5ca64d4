//! Firmware for a TTGO LoRa32 board (ESP32 + SX1276 + SSD1306).
//!
//! One image serves both ends of the link; the role is picked with
//! `TELEMETRY_ROLE` at build time.
//! - sender: reads the DS18B20 probes on GPIO23 and transmits each reading
//! - receiver: listens for readings and shows them on the OLED

#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use embassy_embedded_hal::shared_bus::asynch::spi::SpiDevice;
use embassy_executor::Spawner;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use embassy_time::{Delay, Duration, Timer};
use esp_backtrace as _;
use esp_hal::{
    Async, Blocking,
    clock::CpuClock,
    gpio::{AnyPin, DriveMode, Flex, Input, InputConfig, Level, Output, OutputConfig, Pull},
    i2c::master::{Config as I2cConfig, I2c},
    peripherals::SPI2,
    spi::master::{Config as SpiConfig, Spi},
    time::Rate,
    timer::timg::TimerGroup,
};
use log::{error, info, warn};
use lora_phy::{
    iv::GenericSx127xInterfaceVariant,
    sx127x::{self, Sx127x, Sx1276},
};
use ssd1306::{I2CDisplayInterface, prelude::*};
use static_cell::StaticCell;

use thermo_link::config::{Config, EnvOverrides};
use thermo_link::display::{FrameDisplay, Ssd1306Panel};
use thermo_link::error::InitFault;
use thermo_link::lora::LoraLink;
use thermo_link::sensor::Ds18b20Bus;
use thermo_link::telemetry::TelemetryLoop;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

type OledPanel = Ssd1306Panel<I2CInterface<I2c<'static, Blocking>>, DisplaySize128x64>;

type LoraRadio = LoraLink<
    Sx127x<
        SpiDevice<'static, CriticalSectionRawMutex, Spi<'static, Async>, Output<'static>>,
        GenericSx127xInterfaceVariant<Output<'static>, Input<'static>>,
        Sx1276,
    >,
    Delay,
>;

static SPI_BUS: StaticCell<Mutex<CriticalSectionRawMutex, Spi<'static, Async>>> =
    StaticCell::new();

/// SX1276 wiring
struct LoraGpios<'a> {
    cs: AnyPin<'a>,
    reset: AnyPin<'a>,
    dio0: AnyPin<'a>,
    sck: AnyPin<'a>,
    miso: AnyPin<'a>,
    mosi: AnyPin<'a>,
}

#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();
    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let config = Config::resolve(&EnvOverrides::from_build_env());
    info!("Telemetry node starting as {}", config.role);

    // The OLED controller only answers after a reset pulse.
    let mut oled_reset = Output::new(peripherals.GPIO16, Level::Low, OutputConfig::default());
    Timer::after(Duration::from_millis(20)).await;
    oled_reset.set_high();

    let display = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    ) {
        Ok(i2c) => {
            let i2c = i2c.with_sda(peripherals.GPIO4).with_scl(peripherals.GPIO15);
            match OledPanel::new(I2CDisplayInterface::new(i2c), DisplaySize128x64) {
                Ok(panel) => FrameDisplay::new(panel),
                Err(e) => {
                    warn!("OLED not available ({}), continuing without display", e);
                    FrameDisplay::absent()
                }
            }
        }
        Err(e) => {
            warn!("I2C setup failed ({:?}), continuing without display", e);
            FrameDisplay::absent()
        }
    };

    // One-wire data line: open drain with the internal pull-up as a backup
    // to the external 4.7k resistor.
    let mut one_wire = Flex::new(peripherals.GPIO23);
    one_wire.apply_output_config(
        &OutputConfig::default()
            .with_drive_mode(DriveMode::OpenDrain)
            .with_pull(Pull::Up),
    );
    one_wire.set_input_enable(true);
    one_wire.set_output_enable(true);
    one_wire.set_high();
    let sensors = match Ds18b20Bus::new(one_wire, esp_hal::delay::Delay::new()) {
        Ok(bus) => Some(bus),
        Err(e) => {
            warn!("One-wire bus unusable ({}), continuing without probes", e);
            None
        }
    };

    let led = Output::new(peripherals.GPIO25, Level::Low, OutputConfig::default());

    let gpios = LoraGpios {
        cs: peripherals.GPIO18.into(),
        reset: peripherals.GPIO14.into(),
        dio0: peripherals.GPIO26.into(),
        sck: peripherals.GPIO5.into(),
        miso: peripherals.GPIO19.into(),
        mosi: peripherals.GPIO27.into(),
    };

    TelemetryLoop::init(
        config,
        display,
        sensors,
        led,
        bring_up_radio(peripherals.SPI2, gpios, &config),
    )
    .await
    .run()
    .await
}

async fn bring_up_radio(
    spi_peripheral: SPI2<'static>,
    gpios: LoraGpios<'static>,
    config: &Config,
) -> Result<LoraRadio, InitFault> {
    let spi = Spi::new(
        spi_peripheral,
        SpiConfig::default().with_frequency(Rate::from_mhz(1)),
    )
    .map_err(|e| {
        error!("Failed to configure SPI: {:?}", e);
        InitFault::Radio
    })?
    .with_sck(gpios.sck)
    .with_mosi(gpios.mosi)
    .with_miso(gpios.miso)
    .into_async();

    let spi_bus = SPI_BUS.init(Mutex::new(spi));
    let cs = Output::new(gpios.cs, Level::High, OutputConfig::default());
    let spi_device = SpiDevice::new(spi_bus, cs);

    let reset = Output::new(gpios.reset, Level::High, OutputConfig::default());
    let dio0 = Input::new(gpios.dio0, InputConfig::default());
    let iv = GenericSx127xInterfaceVariant::new(reset, dio0, None, None).map_err(|e| {
        error!("Failed to create LoRa interface: {:?}", e);
        InitFault::Radio
    })?;

    let radio = Sx127x::new(
        spi_device,
        iv,
        sx127x::Config {
            chip: Sx1276,
            tcxo_used: false,
            tx_boost: true,
            rx_boost: false,
        },
    );
    LoraLink::bring_up(radio, Delay, config.role, &config.radio).await
}
