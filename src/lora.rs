use embassy_time::{Duration, with_timeout};
use embedded_hal_async::delay::DelayNs;
use heapless::Vec;
use log::{debug, error, info, warn};
use lora_phy::mod_params::*;
use lora_phy::mod_traits::RadioKind;
use lora_phy::{LoRa, RxMode};

use crate::config::{LinkRole, RadioConfig};
use crate::error::{InitFault, SendFault};
use crate::protocol::MAX_RECORD_LEN;

/// Preamble length used by the Arduino LoRa library.
const PREAMBLE_LEN: u16 = 8;

/// One payload as it came off the air.
pub type Packet = Vec<u8, MAX_RECORD_LEN>;

/// Half-duplex packet link. A node only ever uses the half matching its role.
#[allow(async_fn_in_trait)]
pub trait DeliveryChannel {
    /// Best-effort blocking send. No acknowledgement, no retransmission.
    async fn send(&mut self, payload: &[u8]) -> Result<(), SendFault>;

    /// Returns the next pending packet, or `None` if nothing arrived within
    /// the link's poll window.
    async fn poll_incoming(&mut self) -> Option<Packet>;
}

/// LoRa radio bound to one link role.
pub struct LoraLink<RK, DLY>
where
    RK: RadioKind,
    DLY: DelayNs,
{
    lora: LoRa<RK, DLY>,
    role: LinkRole,
    modulation_params: ModulationParams,
    tx_packet_params: PacketParams,
    rx_packet_params: PacketParams,
    output_power: i32,
    poll_window: Duration,
}

impl<RK, DLY> LoraLink<RK, DLY>
where
    RK: RadioKind,
    DLY: DelayNs,
{
    /// Brings the radio up for `role`. A receiver is left listening in
    /// continuous RX mode.
    pub async fn bring_up(
        radio: RK,
        delay: DLY,
        role: LinkRole,
        config: &RadioConfig,
    ) -> Result<Self, InitFault> {
        info!("Initializing LoRa radio as {}", role);

        // Private sync word, to talk to nodes running the Arduino LoRa library
        let mut lora = LoRa::new(radio, false, delay).await.map_err(|e| {
            error!("Failed to create LoRa radio: {:?}", e);
            InitFault::Radio
        })?;

        let modulation_params = lora
            .create_modulation_params(
                spreading_factor(config.spreading_factor),
                Bandwidth::_125KHz,
                CodingRate::_4_5,
                config.frequency_hz,
            )
            .map_err(|e| {
                error!("Failed to create LoRa modulation parameters: {:?}", e);
                InitFault::Modulation
            })?;

        let tx_packet_params = lora
            .create_tx_packet_params(PREAMBLE_LEN, false, true, false, &modulation_params)
            .map_err(|e| {
                error!("Failed to create LoRa TX packet parameters: {:?}", e);
                InitFault::Modulation
            })?;

        let rx_packet_params = lora
            .create_rx_packet_params(
                PREAMBLE_LEN,
                false,
                MAX_RECORD_LEN as u8,
                true,
                false,
                &modulation_params,
            )
            .map_err(|e| {
                error!("Failed to create LoRa RX packet parameters: {:?}", e);
                InitFault::Modulation
            })?;

        if role == LinkRole::Receiver {
            lora.prepare_for_rx(RxMode::Continuous, &modulation_params, &rx_packet_params)
                .await
                .map_err(|e| {
                    error!("Failed to prepare LoRa for RX: {:?}", e);
                    InitFault::Radio
                })?;
        }

        info!(
            "LoRa radio ready at {} Hz ({:.2} MHz)",
            config.frequency_hz,
            config.frequency_hz as f32 / 1_000_000.0
        );

        Ok(Self {
            lora,
            role,
            modulation_params,
            tx_packet_params,
            rx_packet_params,
            output_power: config.tx_power_dbm,
            poll_window: Duration::from_millis(config.poll_window_ms),
        })
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }
}

impl<RK, DLY> DeliveryChannel for LoraLink<RK, DLY>
where
    RK: RadioKind,
    DLY: DelayNs,
{
    async fn send(&mut self, payload: &[u8]) -> Result<(), SendFault> {
        if self.role != LinkRole::Sender {
            return Err(SendFault::WrongRole);
        }

        self.lora
            .prepare_for_tx(
                &self.modulation_params,
                &mut self.tx_packet_params,
                self.output_power,
                payload,
            )
            .await
            .map_err(|e| {
                error!("LoRa prepare_for_tx failed: {:?}", e);
                SendFault::Radio
            })?;

        self.lora.tx().await.map_err(|e| {
            error!("LoRa TX failed: {:?}", e);
            SendFault::Radio
        })?;
        debug!("LoRa TX successful ({} bytes)", payload.len());

        // Nothing to listen for between cycles
        if let Err(e) = self.lora.sleep(false).await {
            warn!("Failed to put LoRa radio to sleep: {:?}", e);
        }
        Ok(())
    }

    async fn poll_incoming(&mut self) -> Option<Packet> {
        if self.role != LinkRole::Receiver {
            warn!("Polling a LoRa link configured as {}", self.role);
            return None;
        }

        let mut rx_buffer = [0u8; MAX_RECORD_LEN];
        let received = with_timeout(
            self.poll_window,
            self.lora.rx(&self.rx_packet_params, &mut rx_buffer),
        )
        .await;

        match received {
            Ok(Ok((len, status))) => {
                info!(
                    "LoRa RX: received {} bytes, RSSI: {:?}, SNR: {:?}",
                    len, status.rssi, status.snr
                );
                Vec::from_slice(&rx_buffer[..len as usize]).ok()
            }
            Ok(Err(e)) => {
                warn!("LoRa RX error: {:?}", e);
                None
            }
            // Nothing pending
            Err(_) => None,
        }
    }
}

fn spreading_factor(sf: u8) -> SpreadingFactor {
    match sf {
        8 => SpreadingFactor::_8,
        9 => SpreadingFactor::_9,
        10 => SpreadingFactor::_10,
        11 => SpreadingFactor::_11,
        12 => SpreadingFactor::_12,
        _ => SpreadingFactor::_7,
    }
}
