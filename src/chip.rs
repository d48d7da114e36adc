//! Per-generation chip capability interface.
//!
//! Register layout and feature set differ between chip generations. One
//! [`ChipOps`] implementation exists per family; it is selected once from the
//! probed chip id at initialization and held as an immutable reference for
//! the lifetime of the supervisor, never re-selected at runtime.

use crate::bus::ChipIo;
use crate::registers::{
    CommandBits, CC_RECV_SIZE_REG, CC_SEND_SIZE_REG, COM_REG, DATA_BUF_LEGACY_REG, DATA_BUF_REG,
    DIE_TEMP_REG, EPP_NEG_POWER_REG, EPP_REQ_POWER_REG, IOUT_ADC_REG, OP_FREQ_REG, RX_ILIM_REG,
    RX_LEVEL_REG, SYS_MODE_REG, TX_ID_REG, TX_ILIM_REG, TX_MFG_CODE_REG, VOUT_ADC_REG,
    VOUT_SET_REG, VRECT_ADC_REG,
};
use crate::types::{Error, SysMode};

/// First-generation receive-only parts.
pub const CHIP_ID_GEN_RX: u16 = 0x6220;
/// Transmit-capable parts.
pub const CHIP_ID_GEN_RTX: u16 = 0x6320;
/// Extended parts (transmit plus power renegotiation).
pub const CHIP_ID_GEN_EXT: u16 = 0x6410;

/// Chip family, derived from the chip id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Generation {
    Rx,
    Rtx,
    Ext,
}

impl Generation {
    pub fn supports_tx(&self) -> bool {
        *self != Generation::Rx
    }
}

/// Typed chip accessors over the raw register transport.
pub trait ChipOps: Send + Sync {
    fn generation(&self) -> Generation;

    /// Base of the application data window.
    fn data_buf_base(&self) -> u16 {
        DATA_BUF_REG
    }

    fn vout_mv(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u16(VOUT_ADC_REG)? as u32)
    }

    fn vout_set_mv(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u16(VOUT_SET_REG)? as u32)
    }

    fn set_vout_mv(&self, io: &ChipIo, mv: u32) -> Result<(), Error> {
        Ok(io.write_u16(VOUT_SET_REG, mv as u16)?)
    }

    fn vrect_mv(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u16(VRECT_ADC_REG)? as u32)
    }

    fn iout_ma(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u16(IOUT_ADC_REG)? as u32)
    }

    fn die_temp_c(&self, io: &ChipIo) -> Result<i32, Error> {
        Ok(io.read_u16(DIE_TEMP_REG)? as i16 as i32)
    }

    fn op_freq_khz(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u16(OP_FREQ_REG)? as u32)
    }

    fn sys_mode(&self, io: &ChipIo) -> Result<SysMode, Error> {
        Ok(SysMode::from_raw(io.read_u8(SYS_MODE_REG)?))
    }

    fn tx_mfg_code(&self, io: &ChipIo) -> Result<u16, Error> {
        Ok(io.read_u16(TX_MFG_CODE_REG)?)
    }

    fn tx_id(&self, io: &ChipIo) -> Result<u32, Error> {
        Ok(io.read_u32(TX_ID_REG)?)
    }

    fn negotiated_power(&self, io: &ChipIo) -> Result<u8, Error> {
        Ok(io.read_u8(EPP_NEG_POWER_REG)?)
    }

    fn send_command(&self, io: &ChipIo, bits: CommandBits) -> Result<(), Error> {
        Ok(io.write_u16(COM_REG, bits.bits())?)
    }

    fn set_rx_ilim_ma(&self, io: &ChipIo, ma: u32) -> Result<(), Error> {
        Ok(io.write_u16(RX_ILIM_REG, ma as u16)?)
    }

    fn set_tx_ilim_ma(&self, io: &ChipIo, ma: u32) -> Result<(), Error> {
        if !self.generation().supports_tx() {
            return Err(Error::Unsupported);
        }
        Ok(io.write_u16(TX_ILIM_REG, ma as u16)?)
    }

    fn enable_tx_mode(&self, io: &ChipIo, on: bool) -> Result<(), Error> {
        if !self.generation().supports_tx() {
            return Err(Error::Unsupported);
        }
        let bits = if on {
            CommandBits::TX_MODE_EN
        } else {
            CommandBits::TX_MODE_DIS
        };
        self.send_command(io, bits)
    }

    /// Receiver-reported charge level while transmitting.
    fn rx_level(&self, io: &ChipIo) -> Result<u8, Error> {
        if !self.generation().supports_tx() {
            return Err(Error::Unsupported);
        }
        Ok(io.read_u8(RX_LEVEL_REG)?)
    }

    /// Request renegotiation of the EPP power contract.
    fn renegotiate_power(&self, _io: &ChipIo, _half_watts: u8) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn write_data_buf(&self, io: &ChipIo, data: &[u8]) -> Result<(), Error> {
        Ok(io.write_n(self.data_buf_base(), data)?)
    }

    fn read_data_buf(&self, io: &ChipIo, buf: &mut [u8]) -> Result<(), Error> {
        Ok(io.read_n(self.data_buf_base(), buf)?)
    }

    fn set_send_size(&self, io: &ChipIo, len: usize) -> Result<(), Error> {
        Ok(io.write_u8(CC_SEND_SIZE_REG, len as u8)?)
    }

    fn recv_size(&self, io: &ChipIo) -> Result<usize, Error> {
        Ok(io.read_u8(CC_RECV_SIZE_REG)? as usize)
    }
}

/// Receive-only family.
pub struct GenRx;

impl ChipOps for GenRx {
    fn generation(&self) -> Generation {
        Generation::Rx
    }

    fn data_buf_base(&self) -> u16 {
        DATA_BUF_LEGACY_REG
    }
}

/// Transmit-capable family.
pub struct GenRtx;

impl ChipOps for GenRtx {
    fn generation(&self) -> Generation {
        Generation::Rtx
    }
}

/// Extended family.
pub struct GenExt;

impl ChipOps for GenExt {
    fn generation(&self) -> Generation {
        Generation::Ext
    }

    fn renegotiate_power(&self, io: &ChipIo, half_watts: u8) -> Result<(), Error> {
        io.write_u8(EPP_REQ_POWER_REG, half_watts)?;
        // The request is picked up on the next negotiation window; there is
        // no command strobe for it.
        Ok(())
    }
}

static GEN_RX: GenRx = GenRx;
static GEN_RTX: GenRtx = GenRtx;
static GEN_EXT: GenExt = GenExt;

/// Select the capability implementation for a probed chip id.
pub fn ops_for_chip_id(chip_id: u16) -> &'static dyn ChipOps {
    if chip_id >= CHIP_ID_GEN_EXT {
        &GEN_EXT
    } else if chip_id >= CHIP_ID_GEN_RTX {
        &GEN_RTX
    } else {
        &GEN_RX
    }
}
