//! Periodic acquisition and relay loop.
//!
//! ```text
//! Init -> Ready -> { SenderCycle | ReceiverCycle }*
//!   \-> Halted  (radio bring-up failed, terminal)
//! ```
//!
//! The role is fixed at `Init`. All state the loop needs between iterations
//! (cycle counter, heartbeat level, packet count) lives in the loop itself.

use core::fmt::Write;
use core::future::Future;

use embassy_time::{Duration, Ticker, Timer};
use embedded_hal::digital::{OutputPin, PinState};
use heapless::String;
use log::{debug, error, info, warn};

use crate::config::{Config, LinkRole};
use crate::display::{DisplaySink, LINE_LEN, Slot};
use crate::error::InitFault;
use crate::lora::DeliveryChannel;
use crate::protocol;
use crate::reading::DeviceAddress;
use crate::sensor::{DeviceList, SensorSource};

/// How long a halted node sleeps between idle wake-ups.
const HALT_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Ready(LinkRole),
    Halted,
}

/// What one call to [`TelemetryLoop::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sender cycle finished: `sent` packets went out, `faults` devices
    /// were skipped or failed to send.
    Sent { sent: usize, faults: usize },
    /// Receiver decoded a packet carrying `readings` readings.
    Received { readings: usize },
    /// Receiver got a packet it could not decode.
    Rejected,
    /// Receiver found nothing pending.
    Idle,
    Halted,
}

/// Liveness LED, toggled after every productive iteration.
struct Heartbeat<L> {
    led: L,
    lit: bool,
}

impl<L: OutputPin> Heartbeat<L> {
    fn toggle(&mut self) {
        self.lit = !self.lit;
        if let Err(e) = self.led.set_state(PinState::from(self.lit)) {
            warn!("Heartbeat LED error: {:?}", e);
        }
    }
}

pub struct TelemetryLoop<D, S, L, C> {
    config: Config,
    state: LoopState,
    display: D,
    sensors: S,
    heartbeat: Heartbeat<L>,
    link: Option<C>,
    devices: DeviceList,
    cycle: u32,
    received: u32,
}

impl<D, S, L, C> TelemetryLoop<D, S, L, C>
where
    D: DisplaySink,
    S: SensorSource,
    L: OutputPin,
    C: DeliveryChannel,
{
    /// Brings up the display, the probes and then the radio, in that order.
    ///
    /// A failed radio bring-up leaves the loop in [`LoopState::Halted`];
    /// it never touches the link afterwards.
    pub async fn init<F>(
        config: Config,
        mut display: D,
        mut sensors: S,
        led: L,
        bring_up: F,
    ) -> Self
    where
        F: Future<Output = Result<C, InitFault>>,
    {
        info!("Starting telemetry node as {}", config.role);
        display.show(&[("Starting...", Slot::STATUS)]);
        display.commit();

        let devices = sensors.list_devices();
        info!("Found {} devices.", devices.len());

        match sensors.parasite_power() {
            Ok(parasite) => info!("Parasite power is: {}", if parasite { "ON" } else { "OFF" }),
            Err(e) => info!("Parasite power unknown: {}", e),
        }

        for (index, address) in devices.iter().enumerate() {
            info!(
                "Setting resolution of device {} ({}) to {}",
                index,
                address,
                config.resolution.bits()
            );
            match sensors.set_resolution(address, config.resolution) {
                Ok(actual) if actual == config.resolution => {
                    info!("Resolution actually set to: {}", actual.bits())
                }
                Ok(actual) => warn!(
                    "Device {} kept resolution {} instead of {}",
                    index,
                    actual.bits(),
                    config.resolution.bits()
                ),
                Err(e) => warn!(
                    "Could not set resolution of device {}: {}, reading at default",
                    index, e
                ),
            }
        }

        let mut telemetry = Self {
            config,
            state: LoopState::Init,
            display,
            sensors,
            heartbeat: Heartbeat { led, lit: false },
            link: None,
            devices,
            cycle: 0,
            received: 0,
        };

        match bring_up.await {
            Ok(link) => {
                telemetry.link = Some(link);
                telemetry.state = LoopState::Ready(config.role);
                let status = telemetry.status_line();
                telemetry.display.show(&[(status.as_str(), Slot::STATUS)]);
            }
            Err(e) => {
                error!("Radio bring-up failed: {}. Halting.", e);
                telemetry.state = LoopState::Halted;
                telemetry.display.show(&[("Radio failed", Slot::STATUS)]);
            }
        }
        telemetry.display.commit();
        telemetry
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn devices(&self) -> &[DeviceAddress] {
        &self.devices
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Runs one iteration for the configured role.
    pub async fn step(&mut self) -> CycleOutcome {
        match self.state {
            LoopState::Ready(LinkRole::Sender) => self.sender_cycle().await,
            LoopState::Ready(LinkRole::Receiver) => self.receiver_cycle().await,
            LoopState::Init | LoopState::Halted => CycleOutcome::Halted,
        }
    }

    /// Runs forever. Sender cycles are paced by the configured interval;
    /// receiver polls run back to back, each bounded by the poll window.
    pub async fn run(mut self) -> ! {
        let mut ticker = Ticker::every(Duration::from_millis(self.config.interval_ms));
        loop {
            match self.step().await {
                CycleOutcome::Halted => Timer::after(HALT_IDLE).await,
                CycleOutcome::Sent { .. } => ticker.next().await,
                _ => {}
            }
        }
    }

    async fn sender_cycle(&mut self) -> CycleOutcome {
        let Some(link) = self.link.as_mut() else {
            return CycleOutcome::Halted;
        };
        self.cycle = self.cycle.wrapping_add(1);
        debug!("Cycle {}: requesting temperatures...", self.cycle);

        let samples = self.sensors.read_all(&self.devices);
        let mut sent = 0;
        let mut faults = 0;

        for (address, outcome) in samples.iter() {
            let reading = match outcome {
                Ok(reading) => reading,
                Err(e) => {
                    warn!("Cycle {}: device {} skipped: {}", self.cycle, address, e);
                    faults += 1;
                    continue;
                }
            };

            let record = match protocol::encode(core::slice::from_ref(reading)) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Cycle {}: device {} not encoded: {}", self.cycle, address, e);
                    faults += 1;
                    continue;
                }
            };

            match link.send(&record).await {
                Ok(()) => {
                    sent += 1;
                    info!(
                        "Cycle {}: sent device {} at {:.2} C",
                        self.cycle,
                        reading.index,
                        reading.celsius()
                    );
                }
                // Not retried; the next cycle sends a fresh reading.
                Err(e) => {
                    warn!("Cycle {}: send for device {} failed: {}", self.cycle, reading.index, e);
                    faults += 1;
                }
            }

            if let Some(slot) = Slot::reading(reading.index) {
                let line: String<LINE_LEN> = protocol::format_line(reading);
                self.display.show(&[(line.as_str(), slot)]);
            }
        }

        let status = self.status_line();
        self.display.show(&[(status.as_str(), Slot::STATUS)]);
        self.display.commit();

        if sent > 0 {
            self.heartbeat.toggle();
        }
        CycleOutcome::Sent { sent, faults }
    }

    async fn receiver_cycle(&mut self) -> CycleOutcome {
        let Some(link) = self.link.as_mut() else {
            return CycleOutcome::Halted;
        };
        let Some(packet) = link.poll_incoming().await else {
            return CycleOutcome::Idle;
        };

        let readings = match protocol::decode(&packet) {
            Ok(readings) => readings,
            Err(e) => {
                // Keep showing the last good frame.
                warn!("Dropping packet of {} bytes: {}", packet.len(), e);
                return CycleOutcome::Rejected;
            }
        };
        self.received = self.received.wrapping_add(1);

        for reading in readings.iter() {
            info!(
                "Packet {}: device {} at {:.2} C",
                self.received,
                reading.index,
                reading.celsius()
            );
            match Slot::reading(reading.index) {
                Some(slot) => {
                    let line: String<LINE_LEN> = protocol::format_line(reading);
                    self.display.show(&[(line.as_str(), slot)]);
                }
                None => debug!("No display row for device {}", reading.index),
            }
        }

        let status = self.status_line();
        self.display.show(&[(status.as_str(), Slot::STATUS)]);
        self.display.commit();
        self.heartbeat.toggle();
        CycleOutcome::Received {
            readings: readings.len(),
        }
    }

    fn status_line(&self) -> String<LINE_LEN> {
        let mut line = String::new();
        let _ = match self.config.role {
            LinkRole::Sender => write!(line, "Devices: {}", self.devices.len()),
            LinkRole::Receiver => write!(line, "Received: {}", self.received),
        };
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::mock::MockPanel;
    use crate::display::{Frame, FrameDisplay};
    use crate::error::SensorFault;
    use crate::lora::mock::MockLink;
    use crate::reading::Reading;
    use crate::sensor::mock::MockSensors;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use embedded_hal::digital::ErrorType;

    #[derive(Default)]
    struct Led {
        toggles: u32,
        high: bool,
    }

    impl ErrorType for Led {
        type Error = Infallible;
    }

    impl OutputPin for Led {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            self.toggles += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            self.toggles += 1;
            Ok(())
        }
    }

    type TestLoop = TelemetryLoop<FrameDisplay<MockPanel>, MockSensors, Led, MockLink>;

    fn config(role: LinkRole) -> Config {
        Config {
            role,
            ..Config::default()
        }
    }

    fn start(role: LinkRole, sensors: MockSensors, link: Result<MockLink, InitFault>) -> TestLoop {
        block_on(TelemetryLoop::init(
            config(role),
            FrameDisplay::new(MockPanel::default()),
            sensors,
            Led::default(),
            async { link },
        ))
    }

    fn shown(telemetry: &TestLoop) -> Frame {
        telemetry.display().frame().cloned().unwrap()
    }

    #[test]
    fn test_init_configures_every_device() {
        let telemetry = start(
            LinkRole::Sender,
            MockSensors::new(&[Ok(2150), Ok(2275)]),
            Ok(MockLink::new()),
        );
        assert_eq!(telemetry.state(), LoopState::Ready(LinkRole::Sender));
        assert_eq!(telemetry.devices().len(), 2);
        assert_eq!(telemetry.sensors.resolution_calls, 2);
        assert_eq!(shown(&telemetry).row(Slot::STATUS), "Devices: 2");
    }

    #[test]
    fn test_resolution_failure_is_not_fatal() {
        let mut sensors = MockSensors::new(&[Ok(2150)]);
        sensors.reject_resolution = true;
        sensors.parasite = Err(SensorFault::ParasitePowerUnsupported);
        let mut telemetry = start(LinkRole::Sender, sensors, Ok(MockLink::new()));
        assert_eq!(telemetry.state(), LoopState::Ready(LinkRole::Sender));
        assert_eq!(
            block_on(telemetry.step()),
            CycleOutcome::Sent { sent: 1, faults: 0 }
        );
    }

    #[test]
    fn test_sender_sends_one_packet_per_device() {
        let mut telemetry = start(
            LinkRole::Sender,
            MockSensors::new(&[Ok(2150), Ok(2275)]),
            Ok(MockLink::new()),
        );
        let outcome = block_on(telemetry.step());
        assert_eq!(outcome, CycleOutcome::Sent { sent: 2, faults: 0 });

        let link = telemetry.link.as_ref().unwrap();
        assert_eq!(link.sent.len(), 2);
        assert_eq!(link.sent[0].as_slice(), b"Temp 1: 21.50 C");
        assert_eq!(link.sent[1].as_slice(), b"Temp 2: 22.75 C");

        let frame = shown(&telemetry);
        assert_eq!(frame.row(Slot::STATUS), "Devices: 2");
        assert_eq!(frame.row(Slot::reading(0).unwrap()), "Temp 1: 21.50 C");
        assert_eq!(frame.row(Slot::reading(1).unwrap()), "Temp 2: 22.75 C");
        assert_eq!(telemetry.heartbeat.led.toggles, 1);
        assert!(telemetry.heartbeat.led.high);
    }

    #[test]
    fn test_sender_tolerates_partial_failure() {
        let mut telemetry = start(
            LinkRole::Sender,
            MockSensors::new(&[Err(SensorFault::NotFound), Ok(1900), Err(SensorFault::Bus)]),
            Ok(MockLink::new()),
        );
        for _ in 0..3 {
            let outcome = block_on(telemetry.step());
            assert_eq!(outcome, CycleOutcome::Sent { sent: 1, faults: 2 });
        }
        let link = telemetry.link.as_ref().unwrap();
        assert_eq!(link.sent.len(), 3);
        assert!(link.sent.iter().all(|p| p.as_slice() == b"Temp 2: 19.00 C"));
        assert_eq!(telemetry.sensors.conversions, 3);
        assert_eq!(shown(&telemetry).row(Slot::reading(0).unwrap()), "");
    }

    #[test]
    fn test_send_failures_do_not_stop_the_cycle() {
        let mut link = MockLink::new();
        link.fail_sends = true;
        let mut telemetry = start(
            LinkRole::Sender,
            MockSensors::new(&[Ok(100), Ok(200)]),
            Ok(link),
        );
        let outcome = block_on(telemetry.step());
        assert_eq!(outcome, CycleOutcome::Sent { sent: 0, faults: 2 });
        assert_eq!(telemetry.heartbeat.led.toggles, 0);
        // The reading is still shown even though it did not go out.
        assert_eq!(shown(&telemetry).row(Slot::reading(1).unwrap()), "Temp 2: 2.00 C");
    }

    #[test]
    fn test_sender_with_no_devices() {
        let mut telemetry = start(LinkRole::Sender, MockSensors::new(&[]), Ok(MockLink::new()));
        assert_eq!(
            block_on(telemetry.step()),
            CycleOutcome::Sent { sent: 0, faults: 0 }
        );
        assert_eq!(shown(&telemetry).row(Slot::STATUS), "Devices: 0");
    }

    #[test]
    fn test_failed_bring_up_halts_for_good() {
        let mut telemetry = start(
            LinkRole::Sender,
            MockSensors::new(&[Ok(2150)]),
            Err(InitFault::Radio),
        );
        assert_eq!(telemetry.state(), LoopState::Halted);
        assert!(telemetry.link.is_none());
        for _ in 0..5 {
            assert_eq!(block_on(telemetry.step()), CycleOutcome::Halted);
        }
        assert_eq!(telemetry.sensors.conversions, 0);
        assert_eq!(telemetry.heartbeat.led.toggles, 0);
        assert_eq!(shown(&telemetry).row(Slot::STATUS), "Radio failed");
    }

    #[test]
    fn test_receiver_halts_on_failed_bring_up() {
        let mut telemetry = start(
            LinkRole::Receiver,
            MockSensors::new(&[]),
            Err(InitFault::Modulation),
        );
        assert_eq!(block_on(telemetry.step()), CycleOutcome::Halted);
    }

    #[test]
    fn test_receiver_places_readings_by_device() {
        let mut link = MockLink::new();
        link.queue(b"Temp 2: 22.75 C");
        link.queue(b"Temp 1: 21.50 C");
        let mut telemetry = start(LinkRole::Receiver, MockSensors::new(&[]), Ok(link));

        assert_eq!(
            block_on(telemetry.step()),
            CycleOutcome::Received { readings: 1 }
        );
        assert_eq!(
            block_on(telemetry.step()),
            CycleOutcome::Received { readings: 1 }
        );

        let frame = shown(&telemetry);
        assert_eq!(frame.row(Slot::STATUS), "Received: 2");
        assert_eq!(frame.row(Slot::reading(0).unwrap()), "Temp 1: 21.50 C");
        assert_eq!(frame.row(Slot::reading(1).unwrap()), "Temp 2: 22.75 C");
        assert_eq!(telemetry.heartbeat.led.toggles, 2);
        assert!(!telemetry.heartbeat.led.high);
    }

    #[test]
    fn test_receiver_decodes_batched_record() {
        let mut link = MockLink::new();
        link.queue(b"Temp 1: 21.50 C\nTemp 2: 22.75 C");
        let mut telemetry = start(LinkRole::Receiver, MockSensors::new(&[]), Ok(link));
        assert_eq!(
            block_on(telemetry.step()),
            CycleOutcome::Received { readings: 2 }
        );
        let frame = shown(&telemetry);
        assert_eq!(frame.row(Slot::reading(1).unwrap()), "Temp 2: 22.75 C");
    }

    #[test]
    fn test_receiver_keeps_last_frame_on_garbage() {
        let mut link = MockLink::new();
        link.queue(b"Temp 1: 21.50 C");
        link.queue(b"Temp 1: 99 F");
        let mut telemetry = start(LinkRole::Receiver, MockSensors::new(&[]), Ok(link));

        block_on(telemetry.step());
        let before = shown(&telemetry);
        assert_eq!(block_on(telemetry.step()), CycleOutcome::Rejected);
        assert_eq!(shown(&telemetry), before);
        assert_eq!(telemetry.heartbeat.led.toggles, 1);
    }

    #[test]
    fn test_receiver_idle_polls_leave_frame_unchanged() {
        let mut link = MockLink::new();
        link.queue(b"Temp 1: 21.50 C");
        let mut telemetry = start(LinkRole::Receiver, MockSensors::new(&[]), Ok(link));
        block_on(telemetry.step());
        let before = shown(&telemetry);

        for _ in 0..10 {
            assert_eq!(block_on(telemetry.step()), CycleOutcome::Idle);
            assert_eq!(shown(&telemetry), before);
        }
        assert_eq!(telemetry.link.as_ref().unwrap().polls, 11);
        assert_eq!(telemetry.sensors.conversions, 0);
    }

    #[test]
    fn test_end_to_end_sender_to_receiver() {
        let mut sender = start(
            LinkRole::Sender,
            MockSensors::new(&[Ok(2150), Ok(2275)]),
            Ok(MockLink::new()),
        );
        block_on(sender.step());

        let mut air = MockLink::new();
        for packet in sender.link.as_ref().unwrap().sent.iter() {
            air.queue(packet);
        }
        let mut receiver = start(LinkRole::Receiver, MockSensors::new(&[]), Ok(air));
        block_on(receiver.step());
        block_on(receiver.step());

        let sent = shown(&sender);
        let got = shown(&receiver);
        for index in 0..2 {
            let slot = Slot::reading(index).unwrap();
            assert_eq!(sent.row(slot), got.row(slot));
        }
        assert_eq!(
            protocol::decode(&sender.link.as_ref().unwrap().sent[1]).unwrap()[0],
            Reading::new(1, 2275)
        );
    }
}
