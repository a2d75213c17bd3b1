//! Radio configuration and driver selection
//!
//! The default profile targets the single supported regulatory region:
//! 868.1 MHz, SF9, 125 kHz bandwidth, 4/8 coding rate, 14 dBm, 16-symbol
//! preamble, sync word 0x2B.

use driftmesh_core::errors::{MeshError, RadioError, Result};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Radio Config
// ----------------------------------------------------------------------------

/// RF parameters pushed to the radio on `configure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Carrier frequency in Hz
    pub frequency_hz: u32,
    /// Spreading factor, 7..=12
    pub spreading_factor: u8,
    /// Channel bandwidth in Hz
    pub bandwidth_hz: u32,
    /// Coding-rate denominator, 5..=8 (4/5 .. 4/8)
    pub coding_rate: u8,
    /// Transmit power in dBm
    pub tx_power_dbm: i8,
    /// Preamble length in symbols
    pub preamble_length: u16,
    /// Sync word distinguishing this network
    pub sync_word: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 868_100_000,
            spreading_factor: 9,
            bandwidth_hz: 125_000,
            coding_rate: 8,
            tx_power_dbm: 14,
            preamble_length: 16,
            sync_word: 0x2B,
        }
    }
}

impl RadioConfig {
    /// Validate parameter ranges before they reach hardware
    pub fn validate(&self) -> Result<()> {
        if !(7..=12).contains(&self.spreading_factor) {
            return Err(MeshError::Radio(RadioError::InvalidConfig {
                reason: format!("spreading factor {} out of range", self.spreading_factor),
            }));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(MeshError::Radio(RadioError::InvalidConfig {
                reason: format!("coding rate denominator {} out of range", self.coding_rate),
            }));
        }
        if self.bandwidth_hz == 0 {
            return Err(MeshError::Radio(RadioError::InvalidConfig {
                reason: "zero bandwidth".into(),
            }));
        }
        Ok(())
    }

    /// Nominal bitrate for the (SF, BW) pair
    ///
    /// The table is anchored at 125 kHz and scales linearly with
    /// bandwidth.
    pub fn bitrate_bps(&self) -> u64 {
        let at_125k: u64 = match self.spreading_factor {
            7 => 5_470,
            8 => 3_125,
            9 => 1_760,
            10 => 980,
            11 => 440,
            _ => 290,
        };
        at_125k * u64::from(self.bandwidth_hz) / 125_000
    }
}

// ----------------------------------------------------------------------------
// Driver Selection
// ----------------------------------------------------------------------------

/// USB vendor/product pair of an attached serial radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// Framing family spoken by the attached firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    /// Framed command/response binary protocol
    Native,
    /// KISS TNC framing for FMP-capable firmware
    Kiss,
}

/// USB ids known to carry the native firmware
const NATIVE_USB_IDS: &[UsbId] = &[
    UsbId { vendor: 0x10C4, product: 0xEA60 },
    UsbId { vendor: 0x1A86, product: 0x7523 },
    UsbId { vendor: 0x2886, product: 0x802F },
    UsbId { vendor: 0x0403, product: 0x6001 },
];

impl FramingKind {
    /// Select a driver family for a device
    ///
    /// Recognised USB ids get the native binary protocol; anything else
    /// falls back to KISS, which is what the firmware probe selects.
    pub fn for_device(usb_id: Option<UsbId>) -> Self {
        match usb_id {
            Some(id) if NATIVE_USB_IDS.contains(&id) => FramingKind::Native,
            _ => FramingKind::Kiss,
        }
    }
}

// ----------------------------------------------------------------------------
// Long-Range Transport Config
// ----------------------------------------------------------------------------

/// Tunables for queueing, CSMA, and fragmentation pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongRangeConfig {
    /// Effective MTU for a single radio write
    pub mtu: usize,
    /// CAD attempts before the channel counts as busy
    pub cad_attempts: u32,
    /// Delay between CAD attempts in milliseconds
    pub cad_interval_ms: u64,
    /// Receive level above which the channel is busy, dBm
    pub cad_threshold_dbm: i16,
    /// Extra gap after each fragment's airtime, milliseconds
    pub fragment_gap_ms: u64,
    /// Delay before retrying a failed queued packet
    pub retry_delay_ms: u64,
    /// Retries before a queued packet is dropped
    pub max_retries: u32,
    /// Assumed delivery probability for path metrics
    pub nominal_reliability: f64,
}

impl Default for LongRangeConfig {
    fn default() -> Self {
        Self {
            mtu: 200,
            cad_attempts: 10,
            cad_interval_ms: 100,
            cad_threshold_dbm: -120,
            fragment_gap_ms: 50,
            retry_delay_ms: 5_000,
            max_retries: 3,
            nominal_reliability: 0.75,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_region() {
        let config = RadioConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frequency_hz, 868_100_000);
        assert_eq!(config.spreading_factor, 9);
        assert_eq!(config.sync_word, 0x2B);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut config = RadioConfig::default();
        config.spreading_factor = 6;
        assert!(config.validate().is_err());

        let mut config = RadioConfig::default();
        config.coding_rate = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bitrate_table() {
        let mut config = RadioConfig::default();
        config.spreading_factor = 7;
        assert_eq!(config.bitrate_bps(), 5_470);
        config.spreading_factor = 9;
        assert_eq!(config.bitrate_bps(), 1_760);
        config.spreading_factor = 12;
        assert_eq!(config.bitrate_bps(), 290);
        // Doubling the bandwidth doubles the rate
        config.bandwidth_hz = 250_000;
        assert_eq!(config.bitrate_bps(), 580);
    }

    #[test]
    fn usb_id_selection() {
        assert_eq!(
            FramingKind::for_device(Some(UsbId { vendor: 0x10C4, product: 0xEA60 })),
            FramingKind::Native
        );
        assert_eq!(
            FramingKind::for_device(Some(UsbId { vendor: 0x1234, product: 0x5678 })),
            FramingKind::Kiss
        );
        assert_eq!(FramingKind::for_device(None), FramingKind::Kiss);
    }
}
