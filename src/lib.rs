//! Wireless-Power Front-End Supervisor
//!
//! Host-side supervisory control for a Qi wireless power receiver/transmitter
//! chip: charging-session lifecycle, BPP/EPP negotiation, protection backoff,
//! coil-alignment estimation, input-current-limit arbitration and reverse
//! power-transmit (RTX) mode.
//!
//! All session state is owned by a single [`Supervisor`] actor driven by a
//! totally ordered mailbox of interrupt, timer and command events. Register
//! transport and GPIO line control are injected at construction.

pub mod align;
pub mod bus;
pub mod chip;
pub mod config;
pub mod negotiate;
pub mod protection;
pub mod registers;
pub mod rtx;
pub mod supervisor;
pub mod timer;
pub mod types;
pub mod votes;

pub use bus::{BusError, ChipIo, Pin, PinControl, RegisterBus};
pub use config::ChargerConfig;
pub use supervisor::{Services, Supervisor, SupervisorHandle};
pub use types::{
    AlignCapability, AlignCode, ChargeMode, EndOfPowerReason, Error, Notification, RtxError,
    RtxPath, StatusSnapshot, SysMode, Telemetry,
};
pub use votes::Votable;
