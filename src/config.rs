//! Board configuration.
//!
//! The platform layer that discovers board parameters (device tree, board
//! files) is outside this crate; it hands over a [`ChargerConfig`], typically
//! deserialized from a JSON board file.

use serde::Deserialize;

use crate::registers::FOD_LEN_MAX;
use crate::types::Error;

/// Default alignment current scalar (Hz offset per filtered mA).
pub const DEFAULT_ALIGN_SCALAR: u32 = 4;
/// Default alignment hysteresis in Hz.
pub const DEFAULT_ALIGN_HYSTERESIS_HZ: u32 = 5_000;
/// Default BPP ramp delay before raising the input-current-limit vote.
pub const DEFAULT_ICL_RAMP_DELAY_MS: u64 = 4_000;
/// Default BPP ramp target in microamps.
pub const DEFAULT_ICL_RAMP_UA: u32 = 900_000;
/// Default output-voltage ceiling in millivolts.
pub const DEFAULT_MAX_VOUT_MV: u32 = 10_000;
/// Manufacturer code of the transmitters that support alignment scoring.
pub const DEFAULT_ACCEPTED_TX_MFG: u16 = 0x0072;
/// Transmitter manufacturer codes that misreport EPP and must be demoted to
/// BPP by the post-confirmation recheck.
pub const DEFAULT_BPP_QUIRK_TX_CODES: [u16; 1] = [0x1912];

/// Settable output-voltage range accepted across chip generations, mV.
const VOUT_SET_RANGE_MV: std::ops::RangeInclusive<u32> = 3_500..=19_500;

/// When to ask the external power-path owner for an input reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerPathResetMode {
    #[default]
    Never,
    /// Evaluate on mode-changed interrupts (and spurious empty interrupts).
    OnModeChanged,
    /// Evaluate on output-voltage-changed interrupts.
    OnVoutChanged,
}

/// Static board parameters for one supervisor instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChargerConfig {
    /// Chip id assumed when the identification probe fails.
    pub chip_id_default: u16,
    /// BPP foreign-object-detection table; empty disables BPP FOD.
    pub fod_bpp: Vec<u8>,
    /// EPP foreign-object-detection table; empty disables EPP FOD.
    pub fod_epp: Vec<u8>,
    /// Alignment bucket boundaries in Hz, strictly increasing. Empty
    /// disables alignment estimation; otherwise at least 3 boundaries are
    /// required so every bucket maps to a distinct score.
    pub alignment_freq_hz: Vec<u32>,
    /// Hz offset applied per filtered mA of output current.
    pub alignment_scalar: u32,
    /// Hysteresis margin above a bucket's lower boundary for score increases.
    pub alignment_hysteresis_hz: u32,
    /// BPP input-current ramp delay; `None` disables the ramp.
    pub icl_ramp_delay_ms: Option<u64>,
    /// BPP input-current ramp target, microamps.
    pub icl_ramp_ua: u32,
    /// Input-current-limit override for BPP sessions, microamps.
    pub dc_icl_bpp_ua: Option<u32>,
    /// Input-current-limit override for EPP sessions, microamps.
    pub dc_icl_epp_ua: Option<u32>,
    /// EPP resonance Q-factor calibration written at confirmation.
    pub epp_q_factor: Option<u8>,
    /// Power value (half-watt units) to renegotiate at confirmation.
    pub epp_renegotiate_power: Option<u8>,
    /// Run the post-confirmation mode recheck (field workaround for
    /// transmitters whose early-session mode reporting is unreliable).
    pub recheck_mode_after_confirm: bool,
    /// Transmitter manufacturer codes demoted to BPP by the recheck.
    pub bpp_quirk_tx_codes: Vec<u16>,
    /// Treat every session as EPP regardless of chip reporting (test rigs).
    pub force_epp_test: bool,
    /// Level driven on the BPP/EPP profile-select strap at startup.
    pub profile_select_high: bool,
    /// Output-voltage ceiling, mV.
    pub max_vout_mv: u32,
    /// Strategy for requesting external power-path resets.
    pub power_path_reset: PowerPathResetMode,
    /// Manufacturer code accepted for alignment scoring.
    pub accepted_tx_mfg: u16,
    /// Serial id broadcast to attached receivers while transmitting.
    pub tx_serial_id: u32,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            chip_id_default: crate::chip::CHIP_ID_GEN_RX,
            fod_bpp: Vec::new(),
            fod_epp: Vec::new(),
            alignment_freq_hz: Vec::new(),
            alignment_scalar: DEFAULT_ALIGN_SCALAR,
            alignment_hysteresis_hz: DEFAULT_ALIGN_HYSTERESIS_HZ,
            icl_ramp_delay_ms: Some(DEFAULT_ICL_RAMP_DELAY_MS),
            icl_ramp_ua: DEFAULT_ICL_RAMP_UA,
            dc_icl_bpp_ua: None,
            dc_icl_epp_ua: None,
            epp_q_factor: None,
            epp_renegotiate_power: None,
            recheck_mode_after_confirm: false,
            bpp_quirk_tx_codes: DEFAULT_BPP_QUIRK_TX_CODES.to_vec(),
            force_epp_test: false,
            profile_select_high: false,
            max_vout_mv: DEFAULT_MAX_VOUT_MV,
            power_path_reset: PowerPathResetMode::Never,
            accepted_tx_mfg: DEFAULT_ACCEPTED_TX_MFG,
            tx_serial_id: 0,
        }
    }
}

impl ChargerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let cfg: ChargerConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.fod_bpp.len() > FOD_LEN_MAX {
            return Err(Error::InvalidConfig(format!(
                "fod_bpp has {} bytes, max {FOD_LEN_MAX}",
                self.fod_bpp.len()
            )));
        }
        if self.fod_epp.len() > FOD_LEN_MAX {
            return Err(Error::InvalidConfig(format!(
                "fod_epp has {} bytes, max {FOD_LEN_MAX}",
                self.fod_epp.len()
            )));
        }
        if !self.alignment_freq_hz.is_empty() {
            // Scores divide by (buckets - 1); two boundaries would make that
            // zero, so a usable table needs at least three.
            if self.alignment_freq_hz.len() < 3 {
                return Err(Error::InvalidConfig(
                    "alignment_freq_hz needs at least 3 boundaries".into(),
                ));
            }
            if !self.alignment_freq_hz.windows(2).all(|w| w[0] < w[1]) {
                return Err(Error::InvalidConfig(
                    "alignment_freq_hz must be strictly increasing".into(),
                ));
            }
        }
        if !VOUT_SET_RANGE_MV.contains(&self.max_vout_mv) {
            return Err(Error::InvalidConfig(format!(
                "max_vout_mv {} outside {:?}",
                self.max_vout_mv, VOUT_SET_RANGE_MV
            )));
        }
        Ok(())
    }

    /// Whether alignment estimation is configured at all.
    pub fn alignment_enabled(&self) -> bool {
        !self.alignment_freq_hz.is_empty()
    }
}
