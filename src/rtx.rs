//! Reverse power-transmit control.
//!
//! Entering transmit mode is mutually exclusive with receiving: the session
//! must be offline and the shared transmit-limit resolution must be nonzero.
//! While transmitting, the interrupt dispatcher routes every interrupt here
//! exclusively. A conflict (another transmitter in range, or a rectified
//! voltage appearing in our own field) forces an unconditional exit without
//! re-issuing the disable command, since the chip has already dropped out.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bus::{hex_str, Pin};
use crate::registers::{ma_to_ua, ua_to_ma, CommandBits, StatusFlags, PP_TYPE_REG};
use crate::supervisor::{Event, Supervisor};
use crate::types::{Error, Notification, RtxError, RtxPath};
use crate::votes::{THERMAL_VOTER, WLC_VOTER};

/// Header byte marking a fast-serial proprietary packet.
pub(crate) const FAST_SERIAL_HEADER: u8 = 0x4F;
/// Fast-serial frame length: header, 24-bit serial, accessory type.
const FAST_SERIAL_LEN: usize = 5;
/// Accessory-type field mask in the last frame byte.
pub(crate) const ACCESSORY_TYPE_MASK: u8 = 0x07;
/// Accessory type reported by phones.
pub(crate) const ACCESSORY_TYPE_PHONE: u8 = 0x02;
/// Proprietary-packet type for the fast-serial exchange.
const PP_TYPE_PROPRIETARY: u8 = 0x18;

/// Chip default transmit current limit, mA.
pub(crate) const RTX_TX_ICL_MAX_MA: u32 = 1_350;
/// Settle time between asserting the power path and the mode command.
const RTX_SETTLE: Duration = Duration::from_millis(10);
/// Delay between a receiver attach and the serial-id broadcast.
const SERIAL_SEND_DELAY: Duration = Duration::from_millis(600);

impl Supervisor {
    /// Drive the transmit power path lines. Returns false when the board
    /// has no transmit path at all.
    pub(crate) fn rtx_power(&self, on: bool) -> bool {
        for pin in [Pin::BoostEnable, Pin::SwitchEnable, Pin::BoostLevel] {
            if self.pins.supports(pin) {
                self.pins.set(pin, on);
            }
        }
        self.pins.supports(Pin::BoostEnable) || self.pins.supports(Pin::SwitchEnable)
    }

    pub(crate) fn set_rtx_path(&mut self, path: RtxPath) {
        info!("rtx: path {:?} -> {:?}", self.rtx_path, path);
        match path {
            RtxPath::Disabled => {
                if self.rtx_path == RtxPath::On {
                    self.rtx_power(false);
                } else if self.pins.supports(Pin::BoostEnable) {
                    self.pins.set(Pin::BoostEnable, false);
                }
            }
            RtxPath::Armed => {
                if self.pins.supports(Pin::BoostEnable) {
                    self.pins.set(Pin::BoostEnable, true);
                }
            }
            RtxPath::On => {
                self.rtx_power(true);
            }
        }
        self.rtx_path = path;
    }

    /// Enter or leave transmit mode.
    pub(crate) async fn set_rtx(&mut self, enable: bool) -> Result<(), Error> {
        if !enable {
            info!("rtx: disable");
            // After a conflict the chip has already left transmit mode on
            // its own; sending the command again would just fail.
            if self.rtx_err != RtxError::TxConflict {
                if let Err(e) = self.chip.enable_tx_mode(&self.io, false) {
                    warn!("rtx: disable command failed: {e}");
                }
            }
            self.set_rtx_path(RtxPath::Disabled);
            self.rtx_attached = false;
            self.serial_timer.cancel();
            if let Some(disable_input) = &self.disable_input {
                disable_input.withdraw(WLC_VOTER);
            }
            self.notify_rtx();
            return Ok(());
        }

        info!("rtx: enable");
        if !self.chip.generation().supports_tx() {
            return Err(Error::Unsupported);
        }
        if let Some(tx_icl) = &self.tx_icl {
            if tx_icl.effective() == Some(0) {
                warn!("rtx: transmit limit voted to zero, refusing");
                return Err(Error::Rejected("transmit limit is zero"));
            }
        }
        if self.online {
            error!("rtx: not allowed while receiving power");
            return Err(Error::Rejected("link is online"));
        }

        // Stop drawing input current before we start sourcing it.
        if let Some(disable_input) = &self.disable_input {
            disable_input.vote(WLC_VOTER, 0);
        }

        self.rtx_level = 0;
        self.rtx_err = RtxError::None;
        self.rtx_attached = false;
        self.set_rtx_path(RtxPath::On);
        sleep(RTX_SETTLE).await;

        if let Err(e) = self.chip.enable_tx_mode(&self.io, true) {
            error!("rtx: cannot enter transmit mode: {e}");
            self.rtx_err = RtxError::EnterFailed;
            self.set_rtx_path(RtxPath::Disabled);
            if let Some(disable_input) = &self.disable_input {
                disable_input.withdraw(WLC_VOTER);
            }
            self.notify_rtx();
            return Err(e);
        }

        if let Err(e) = self.enable_interrupts() {
            error!("rtx: could not enable interrupts: {e}");
        }

        // Push the resolved transmit limit when it differs from the chip
        // default.
        if let Some(tx_icl) = &self.tx_icl {
            if let Some(ua) = tx_icl.effective() {
                if ua > 0 && ua != ma_to_ua(RTX_TX_ICL_MAX_MA) {
                    match self.chip.set_tx_ilim_ma(&self.io, ua_to_ma(ua)) {
                        Ok(()) => info!("rtx: transmit limit {ua} uA"),
                        Err(e) => error!("rtx: could not set transmit limit: {e}"),
                    }
                }
            }
        }

        self.notify_rtx();
        Ok(())
    }

    /// Transmit-role interrupt handling; exclusive while transmitting.
    pub(crate) async fn handle_rtx_irq(&mut self, flags: StatusFlags) {
        debug!("rtx: irq {flags:?}");

        if flags.contains(StatusFlags::MODE_CHANGED) {
            match self.chip.sys_mode(&self.io) {
                Ok(mode) => info!("rtx: system mode {mode:?}"),
                Err(e) => {
                    error!("rtx: failed to read system mode: {e}");
                    return;
                }
            }
        }

        let status = match self.io.read_u16(crate::registers::STATUS_REG) {
            Ok(raw) => StatusFlags::from_bits_truncate(raw),
            Err(e) => {
                error!("rtx: failed to read status: {e}");
                return;
            }
        };

        // Another field in range while we transmit, whether the chip calls
        // it a conflict or we see the rectified voltage ourselves.
        if flags.intersects(StatusFlags::TX_CONFLICT | StatusFlags::VRECT_ON) {
            warn!("rtx: transmitter conflict, status {status:?}");
            self.rtx_err = RtxError::TxConflict;
            let _ = self.set_rtx(false).await;
            return;
        }

        if flags.contains(StatusFlags::RX_CONNECTED) {
            let attached = status.contains(StatusFlags::RX_CONNECTED);
            self.rtx_attached = attached;
            info!(
                "rtx: receiver {}",
                if attached { "attached" } else { "detached" }
            );
            self.notify(Notification::RtxReceiver { attached });
            if attached {
                self.serial_timer
                    .arm(&self.events_tx, SERIAL_SEND_DELAY, Event::SendSerialId);
            } else {
                self.serial_timer.cancel();
                self.rtx_level = 0;
            }
        }

        if flags.contains(StatusFlags::CSP_RECEIVED) && status.contains(StatusFlags::CSP_RECEIVED)
        {
            match self.chip.rx_level(&self.io) {
                Ok(level) => {
                    self.rtx_level = level;
                    self.notify(Notification::RtxReceiverLevel { level });
                }
                Err(e) => warn!("rtx: failed to read receiver level: {e}"),
            }
        }
    }

    /// Broadcast the fast-serial id to the attached receiver.
    pub(crate) fn send_fast_serial(&mut self) {
        if self.rtx_path != RtxPath::On {
            return;
        }
        let mut frame = [0u8; FAST_SERIAL_LEN];
        frame[0] = FAST_SERIAL_HEADER;
        frame[1..4].copy_from_slice(&self.cfg.tx_serial_id.to_le_bytes()[..3]);
        frame[FAST_SERIAL_LEN - 1] = ACCESSORY_TYPE_PHONE;

        let sent = (|| {
            let _cmd = self.io.command_lock();
            self.io.write_u8(PP_TYPE_REG, PP_TYPE_PROPRIETARY)?;
            self.chip.write_data_buf(&self.io, &frame)?;
            self.chip.set_send_size(&self.io, FAST_SERIAL_LEN)?;
            self.chip.send_command(&self.io, CommandBits::CC_ACTIVATE)
        })();
        match sent {
            Ok(()) => info!("rtx: fast serial sent ({})", hex_str(&frame)),
            Err(e) => error!("rtx: failed to send fast serial: {e}"),
        }
    }

    /// The shared transmit-limit resolution changed.
    pub(crate) async fn handle_tx_limit_changed(&mut self) {
        if self.rtx_path == RtxPath::Disabled {
            return;
        }
        let Some(tx_icl) = self.tx_icl.clone() else {
            return;
        };
        match tx_icl.effective() {
            Some(0) => {
                if tx_icl.client_vote(THERMAL_VOTER) == Some(0) {
                    warn!("rtx: thermal shutdown");
                    self.rtx_err = RtxError::OverTemp;
                }
                let _ = self.set_rtx(false).await;
            }
            Some(ua) => match self.chip.set_tx_ilim_ma(&self.io, ua_to_ma(ua)) {
                Ok(()) => info!("rtx: transmit limit {ua} uA"),
                Err(e) => error!("rtx: could not set transmit limit: {e}"),
            },
            None => {}
        }
    }

    fn notify_rtx(&self) {
        self.notify(Notification::RtxState {
            path: self.rtx_path,
            error: self.rtx_err,
        });
    }
}
