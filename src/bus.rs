//! Hardware I/O boundary: register transport and GPIO line control.
//!
//! The actual transports (I2C adapter, simulator, remote bridge) live outside
//! this crate and are injected at construction. Register access is serialized
//! behind [`ChipIo`]'s own lock, distinct from the supervisor state, so
//! diagnostic readers can issue raw accesses concurrently with protocol
//! logic. Multi-register command sequences additionally hold the command
//! lock so a diagnostic write cannot interleave with one.

use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

/// Register transport error.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The device did not respond at all. Treated as a disconnect so that
    /// steady-state polling does not spam the log with transfer errors.
    #[error("device not present")]
    Absent,
    /// Any other transfer failure.
    #[error("bus i/o: {0}")]
    Io(String),
}

impl BusError {
    pub fn is_absent(&self) -> bool {
        matches!(self, BusError::Absent)
    }
}

/// Byte-level register transport with 16-bit register addresses.
pub trait RegisterBus: Send {
    fn read(&mut self, reg: u16, buf: &mut [u8]) -> Result<(), BusError>;
    fn write(&mut self, reg: u16, data: &[u8]) -> Result<(), BusError>;
}

/// GPIO lines owned by this supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
    /// Chip enable, active low at the chip.
    Enable,
    /// BPP/EPP profile select strap.
    ProfileSelect,
    /// Transmit boost enable.
    BoostEnable,
    /// Transmit switch enable.
    SwitchEnable,
    /// Transmit charging-level boost (optional on some boards).
    BoostLevel,
}

/// Board GPIO access. Lines a board does not wire up report
/// `supports() == false` and are skipped.
pub trait PinControl: Send + Sync {
    fn supports(&self, pin: Pin) -> bool;
    fn set(&self, pin: Pin, high: bool);
    fn get(&self, pin: Pin) -> bool;
}

/// Locked register access shared between the supervisor and diagnostics.
pub struct ChipIo {
    bus: Mutex<Box<dyn RegisterBus>>,
    cmd: Mutex<()>,
}

impl ChipIo {
    pub fn new(bus: Box<dyn RegisterBus>) -> Self {
        Self {
            bus: Mutex::new(bus),
            cmd: Mutex::new(()),
        }
    }

    /// Serialize a multi-register command sequence against other commands.
    pub(crate) fn command_lock(&self) -> MutexGuard<'_, ()> {
        self.cmd.lock().unwrap()
    }

    pub fn read_n(&self, reg: u16, buf: &mut [u8]) -> Result<(), BusError> {
        self.bus.lock().unwrap().read(reg, buf)
    }

    pub fn write_n(&self, reg: u16, data: &[u8]) -> Result<(), BusError> {
        self.bus.lock().unwrap().write(reg, data)
    }

    pub fn read_u8(&self, reg: u16) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read_n(reg, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, reg: u16) -> Result<u16, BusError> {
        let mut buf = [0u8; 2];
        self.read_n(reg, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, reg: u16) -> Result<u32, BusError> {
        let mut buf = [0u8; 4];
        self.read_n(reg, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u8(&self, reg: u16, val: u8) -> Result<(), BusError> {
        self.write_n(reg, &[val])
    }

    pub fn write_u16(&self, reg: u16, val: u16) -> Result<(), BusError> {
        self.write_n(reg, &val.to_le_bytes())
    }
}

/// Render register data for logs: `"4f 12 12 12 02"`.
pub(crate) fn hex_str(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}
