//! Register map, interrupt/status word and unit conversions.
//!
//! Registers are 16-bit addressed; multi-byte values are little-endian in
//! register order. The interrupt word and the status word share one layout:
//! the interrupt register latches the transitions, the status register holds
//! the current level.

use bitflags::bitflags;

/// Chip identification word.
pub const CHIP_ID_REG: u16 = 0x0000;
/// Silicon revision byte.
pub const CHIP_REV_REG: u16 = 0x0002;
/// Customer/board id byte.
pub const CUSTOMER_ID_REG: u16 = 0x0003;

/// Live status word.
pub const STATUS_REG: u16 = 0x0034;
/// Latched interrupt word.
pub const INT_REG: u16 = 0x0036;
/// Interrupt enable mask.
pub const INT_ENABLE_REG: u16 = 0x0038;
/// Write-1-to-clear interrupt latch (takes effect with [`CommandBits::CLEAR_INT`]).
pub const INT_CLEAR_REG: u16 = 0x003A;

/// Charge-status byte sent to the transmitter (capacity 0-100).
pub const CHARGE_STAT_REG: u16 = 0x003E;
/// End-of-power reason byte, sent with [`CommandBits::SEND_EOP`].
pub const EPT_REG: u16 = 0x003F;

/// Measured output voltage, mV.
pub const VOUT_ADC_REG: u16 = 0x0040;
/// Output voltage setpoint, mV.
pub const VOUT_SET_REG: u16 = 0x0042;
/// Rectified coil voltage, mV.
pub const VRECT_ADC_REG: u16 = 0x0044;
/// Measured output current, mA.
pub const IOUT_ADC_REG: u16 = 0x0046;
/// Die temperature, degrees C.
pub const DIE_TEMP_REG: u16 = 0x0048;
/// Operating frequency, kHz.
pub const OP_FREQ_REG: u16 = 0x004A;
/// System operating mode byte, see [`crate::types::SysMode`].
pub const SYS_MODE_REG: u16 = 0x004C;
/// Command word; bits self-clear once the chip acts on them.
pub const COM_REG: u16 = 0x004E;

/// Receive-side output current limit setpoint, mA.
pub const RX_ILIM_REG: u16 = 0x0050;
/// Transmit-side current limit setpoint, mA (transmit-capable parts only).
pub const TX_ILIM_REG: u16 = 0x0052;
/// EPP resonance Q-factor calibration byte.
pub const EPP_Q_FACTOR_REG: u16 = 0x0054;
/// Requested power byte for EPP renegotiation, half-watt units.
pub const EPP_REQ_POWER_REG: u16 = 0x0055;
/// Negotiated power byte, half-watt units.
pub const EPP_NEG_POWER_REG: u16 = 0x0056;
/// Transmitter manufacturer code word.
pub const TX_MFG_CODE_REG: u16 = 0x005A;
/// Transmitter id (EPP), 4 bytes.
pub const TX_ID_REG: u16 = 0x005C;

/// Foreign-object-detection calibration table.
pub const FOD_REG: u16 = 0x0068;
/// Maximum FOD table length in bytes.
pub const FOD_LEN_MAX: usize = 16;

/// Receiver charge-status byte reported while transmitting.
pub const RX_LEVEL_REG: u16 = 0x00E4;

/// Proprietary-packet type byte for application data exchange.
pub const PP_TYPE_REG: u16 = 0x0100;
/// Application data window (current parts).
pub const DATA_BUF_REG: u16 = 0x0104;
/// Application data window (first-generation parts).
pub const DATA_BUF_LEGACY_REG: u16 = 0x0058;
/// Communication-channel send length byte.
pub const CC_SEND_SIZE_REG: u16 = 0x0102;
/// Communication-channel received length byte.
pub const CC_RECV_SIZE_REG: u16 = 0x0103;

/// Application data window size in bytes.
pub const DATA_BUF_LEN: usize = 256;
/// Proprietary-packet capture length in bytes.
pub const PP_BUF_LEN: usize = 5;

bitflags! {
    /// Interrupt/status word layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u16 {
        const OVER_CURRENT  = 1 << 0;
        const OVER_VOLTAGE  = 1 << 1;
        const OVER_TEMP     = 1 << 2;
        const UNDER_VOLTAGE = 1 << 3;
        const VRECT_ON      = 1 << 4;
        const VOUT_ON       = 1 << 5;
        const MODE_CHANGED  = 1 << 6;
        const VOUT_CHANGED  = 1 << 7;
        const DATA_RECEIVED = 1 << 8;
        const SEND_BUSY     = 1 << 9;
        const PP_RECEIVED   = 1 << 10;
        const CC_RESET_DONE = 1 << 11;
        const RX_CONNECTED  = 1 << 12;
        const TX_CONFLICT   = 1 << 13;
        const CSP_RECEIVED  = 1 << 14;
    }
}

impl StatusFlags {
    /// Protection-limit bits handled by the protection monitor.
    pub const LIMIT_MASK: StatusFlags = StatusFlags::OVER_CURRENT
        .union(StatusFlags::OVER_VOLTAGE)
        .union(StatusFlags::OVER_TEMP)
        .union(StatusFlags::UNDER_VOLTAGE);

    /// Communication-channel bits (data exchange with the transmitter).
    pub const CC_MASK: StatusFlags = StatusFlags::DATA_RECEIVED
        .union(StatusFlags::SEND_BUSY)
        .union(StatusFlags::PP_RECEIVED)
        .union(StatusFlags::CC_RESET_DONE);

    /// Bits serviced while operating as a transmitter.
    pub const RTX_MASK: StatusFlags = StatusFlags::MODE_CHANGED
        .union(StatusFlags::RX_CONNECTED)
        .union(StatusFlags::TX_CONFLICT)
        .union(StatusFlags::CSP_RECEIVED)
        .union(StatusFlags::VRECT_ON);
}

bitflags! {
    /// Command word bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandBits: u16 {
        /// Apply the interrupt-clear latch written to `INT_CLEAR_REG`.
        const CLEAR_INT   = 1 << 0;
        /// Send the charge-status byte in `CHARGE_STAT_REG`.
        const SEND_CSP    = 1 << 1;
        /// Send the end-of-power reason in `EPT_REG`.
        const SEND_EOP    = 1 << 2;
        /// Transmit the loaded communication-channel buffer.
        const CC_ACTIVATE = 1 << 3;
        /// Reset the communication channel.
        const CC_RESET    = 1 << 4;
        /// Enter transmit mode (transmit-capable parts only).
        const TX_MODE_EN  = 1 << 8;
        /// Leave transmit mode.
        const TX_MODE_DIS = 1 << 9;
    }
}

/// kHz as read from `OP_FREQ_REG` to Hz.
pub fn khz_to_hz(khz: u32) -> u32 {
    khz * 1000
}

/// Milliamps as read from the ADC registers to microamps.
pub fn ma_to_ua(ma: u32) -> u32 {
    ma * 1000
}

/// Microamps (arbitration domain) to milliamps (register domain).
pub fn ua_to_ma(ua: u32) -> u32 {
    ua / 1000
}

/// Millivolts to microvolts.
pub fn mv_to_uv(mv: u32) -> u32 {
    mv * 1000
}
