//! Core types for the wireless-power supervisor.

use serde::{Deserialize, Serialize};

use crate::bus::BusError;

/// Negotiated power-transfer profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    /// Baseline power profile (5 W class).
    Bpp,
    /// Extended power profile.
    Epp,
}

impl std::fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargeMode::Bpp => write!(f, "bpp"),
            ChargeMode::Epp => write!(f, "epp"),
        }
    }
}

/// Coil-alignment feedback code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignCode {
    /// Field seen, waiting for confirmation.
    Checking,
    /// Coil detected but not coupling; the user should move the device.
    Move,
    /// Coupled; the alignment score is meaningful.
    Centered,
    /// No usable alignment information.
    Error,
}

impl AlignCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignCode::Checking => "checking",
            AlignCode::Move => "move",
            AlignCode::Centered => "centered",
            AlignCode::Error => "error",
        }
    }
}

/// Whether this transmitter qualifies for alignment scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignCapability {
    Checking,
    Passed,
    Failed,
}

/// End-of-power reason codes sent to the transmitter before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfPowerReason {
    ChargeComplete,
    InternalFault,
    OverTemperature,
    OverVoltage,
    OverCurrent,
}

impl EndOfPowerReason {
    /// Wire code written to the end-of-power register.
    pub fn code(&self) -> u8 {
        match self {
            EndOfPowerReason::ChargeComplete => 0x01,
            EndOfPowerReason::InternalFault => 0x02,
            EndOfPowerReason::OverTemperature => 0x03,
            EndOfPowerReason::OverVoltage => 0x04,
            EndOfPowerReason::OverCurrent => 0x05,
        }
    }
}

/// Reverse-transmit power-path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtxPath {
    /// All transmit lines released.
    Disabled,
    /// Enable line asserted without the boost/switch path (chip powered for
    /// register access only).
    Armed,
    /// Full transmit power path asserted.
    On,
}

/// Last reverse-transmit fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtxError {
    None,
    /// Thermal policy voted the transmit limit to zero.
    OverTemp,
    /// Another transmitter was detected in range.
    TxConflict,
    /// The chip rejected the enter-transmit command.
    EnterFailed,
}

/// Decoded system operating mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SysMode {
    Idle,
    WpcBasic,
    WpcExtended,
    Proprietary,
    Transmit,
    Unknown(u8),
}

impl SysMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => SysMode::Idle,
            0x01 => SysMode::WpcBasic,
            0x02 => SysMode::WpcExtended,
            0x03 => SysMode::Proprietary,
            0x04 => SysMode::Transmit,
            other => SysMode::Unknown(other),
        }
    }

    /// True for any mode in which the chip is receiving extended-profile power.
    pub fn is_extended(&self) -> bool {
        matches!(self, SysMode::WpcExtended | SysMode::Proprietary)
    }

    /// True for any valid receive-role mode.
    pub fn is_receiving(&self) -> bool {
        matches!(
            self,
            SysMode::WpcBasic | SysMode::WpcExtended | SysMode::Proprietary
        )
    }
}

/// Events published to external observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A charging session was confirmed.
    Online { mode: ChargeMode },
    /// The charging session ended.
    Offline,
    /// A protection fault terminated the session. Sampled output currents
    /// (microamps) are included for diagnostics when the fault was
    /// current-related.
    SessionEnded {
        reason: EndOfPowerReason,
        samples_ua: Vec<u32>,
    },
    /// Alignment feedback changed.
    Alignment {
        code: AlignCode,
        score: Option<u8>,
    },
    /// Reverse-transmit state changed.
    RtxState { path: RtxPath, error: RtxError },
    /// A receiver attached to or detached from our transmit field.
    RtxReceiver { attached: bool },
    /// The attached receiver reported a charge level.
    RtxReceiverLevel { level: u8 },
    /// Application data arrived from the transmitter.
    DataReceived { len: usize },
    /// A pending transmit completed (or timed out when `ok` is false).
    SendComplete { ok: bool },
    /// The chip left a valid receive mode; the external power-path owner
    /// should reset the input path.
    PowerPathResetRequested,
}

/// Point-in-time view of the supervisor state, for the host property surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub present: bool,
    pub enabled: bool,
    pub online: bool,
    pub mode: Option<ChargeMode>,
    pub align_code: AlignCode,
    pub align_score: Option<u8>,
    pub capacity: Option<u8>,
    pub chip_id: u16,
    pub tx_id: Option<String>,
    pub effective_icl_ua: Option<u32>,
    pub rtx_path: RtxPath,
    pub rtx_error: RtxError,
    pub rtx_attached: bool,
    pub rtx_receiver_level: u8,
}

/// Live measurements sampled from the chip. Fields read `None` when the
/// chip is unpowered or a read fails.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    pub vout_mv: Option<u32>,
    pub vrect_mv: Option<u32>,
    pub iout_ma: Option<u32>,
    pub die_temp_c: Option<i32>,
    pub op_freq_hz: Option<u32>,
}

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("register transport: {0}")]
    Bus(#[from] BusError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("config file: {0}")]
    ConfigIo(#[from] std::io::Error),
    #[error("config parse: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("link is not online")]
    NotOnline,
    #[error("transmit channel is busy")]
    Busy,
    #[error("not supported by this chip generation")]
    Unsupported,
    #[error("request rejected: {0}")]
    Rejected(&'static str),
    #[error("supervisor task is gone")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eop_reason_codes() {
        assert_eq!(EndOfPowerReason::OverTemperature.code(), 0x03);
        assert_eq!(EndOfPowerReason::OverVoltage.code(), 0x04);
        assert_eq!(EndOfPowerReason::OverCurrent.code(), 0x05);
    }

    #[test]
    fn sys_mode_decoding() {
        assert_eq!(SysMode::from_raw(0x02), SysMode::WpcExtended);
        assert_eq!(SysMode::from_raw(0x04), SysMode::Transmit);
        assert_eq!(SysMode::from_raw(0x7f), SysMode::Unknown(0x7f));
        assert!(SysMode::WpcExtended.is_extended());
        assert!(SysMode::Proprietary.is_extended());
        assert!(!SysMode::WpcBasic.is_extended());
        assert!(SysMode::WpcBasic.is_receiving());
        assert!(!SysMode::Transmit.is_receiving());
    }

    #[test]
    fn notification_serializes_with_tag() {
        let n = Notification::Online {
            mode: ChargeMode::Epp,
        };
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("\"event\":\"online\""));
        assert!(json.contains("\"mode\":\"epp\""));
    }
}
