//! The supervisor actor: link lifecycle, interrupt dispatch and the host
//! property surface.
//!
//! One task owns all session state and processes a totally ordered mailbox
//! of interrupt, timer-expiry, arbiter-change and external-command events.
//! The protection monitor, mode negotiator, alignment estimator and RTX
//! controller are methods on this state (see the sibling modules); nothing
//! mutates a session outside the mailbox loop. Register access goes through
//! [`ChipIo`]'s own lock so diagnostics can read registers concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::align::AlignmentEstimator;
use crate::bus::{hex_str, BusError, ChipIo, Pin, PinControl, RegisterBus};
use crate::chip::{ops_for_chip_id, ChipOps};
use crate::config::{ChargerConfig, PowerPathResetMode};
use crate::registers::{
    khz_to_hz, ma_to_ua, ua_to_ma, CommandBits, StatusFlags, CHARGE_STAT_REG, CHIP_ID_REG,
    CUSTOMER_ID_REG, DATA_BUF_LEN, EPT_REG, INT_CLEAR_REG, INT_ENABLE_REG, INT_REG, PP_BUF_LEN,
    STATUS_REG,
};
use crate::rtx::{ACCESSORY_TYPE_MASK, ACCESSORY_TYPE_PHONE, FAST_SERIAL_HEADER, RTX_TX_ICL_MAX_MA};
use crate::timer::DeferredTimer;
use crate::types::{
    ChargeMode, EndOfPowerReason, Error, Notification, RtxError, RtxPath, StatusSnapshot,
    Telemetry,
};
use crate::votes::{Votable, OCP_VOTER, RAMP_VOTER, RTX_DEFAULT_VOTER, USER_VOTER, WLC_VOTER};

/// Default input-current-limit vote for BPP sessions, microamps.
pub(crate) const DC_ICL_BPP_UA: u32 = 700_000;
/// Default input-current-limit vote for EPP sessions, microamps.
pub(crate) const DC_ICL_EPP_UA: u32 = 1_100_000;
/// Reduced EPP limit for low-power contracts, microamps.
pub(crate) const DC_ICL_EPP_REDUCED_UA: u32 = 1_000_000;
/// Receive-side hardware current limit programmed while online, microamps.
const RX_ILIM_MAX_UA: u32 = 1_600_000;

/// Detect edge to rectified-voltage confirmation window.
const DETECT_CONFIRM_TIMEOUT: Duration = Duration::from_millis(800);
/// Coupling window after the confirmation timeout before alignment gives up.
const ALIGNMENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle delay between the rectified-voltage interrupt and the
/// confirmation sequence; early-session registers are unreliable.
const CONFIRM_SETTLE_DELAY: Duration = Duration::from_millis(100);
/// Presence-poll period while online.
const PRESENCE_POLL_PERIOD: Duration = Duration::from_secs(1);
/// Alignment estimation period.
const ALIGN_TICK_PERIOD: Duration = Duration::from_millis(100);
/// Enable-line settle delay when pulsing the chip through a reset.
const REENABLE_DELAY: Duration = Duration::from_millis(500);
/// Deadline for a send-complete interrupt after a data send.
const TX_TIMEOUT: Duration = Duration::from_secs(2);

/// Mailbox events, totally ordered per supervisor.
pub(crate) enum Event {
    /// Main interrupt line fired.
    Irq,
    /// Coil-detect line edge.
    DetectIrq,
    /// Settle delay after a rectified-voltage interrupt elapsed.
    ConfirmSettled,
    /// No rectified voltage within the confirmation window.
    DetectTimeout,
    /// No coupling within the alignment window.
    AlignmentTimeout,
    AlignTick,
    PresencePoll,
    RampAlarm,
    TxTimeout,
    SendSerialId,
    ReenablePower,
    TxLimitChanged,
    Command(Command),
}

/// External requests from the property surface.
pub(crate) enum Command {
    SetEnabled(bool),
    SetCapacity(u8),
    SetCurrentLimit {
        ua: u32,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    SetVoutMax {
        mv: u32,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    SetRtx {
        on: bool,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    SendData {
        data: Vec<u8>,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    TakeReceived {
        resp: oneshot::Sender<Option<Vec<u8>>>,
    },
    Snapshot {
        resp: oneshot::Sender<StatusSnapshot>,
    },
    ReadTelemetry {
        resp: oneshot::Sender<Telemetry>,
    },
}

/// Shared arbitration resolutions this supervisor votes on. Any of them may
/// be absent on a given system; the supervisor then degrades to local
/// defaults.
#[derive(Default, Clone)]
pub struct Services {
    pub dc_icl: Option<Arc<Votable>>,
    pub disable_input: Option<Arc<Votable>>,
    pub tx_icl: Option<Arc<Votable>>,
}

/// The supervisor actor. Construct with [`Supervisor::new`], then drive it
/// by awaiting [`Supervisor::run`] on its own task and talking to it through
/// the [`SupervisorHandle`].
pub struct Supervisor {
    pub(crate) cfg: ChargerConfig,
    pub(crate) io: Arc<ChipIo>,
    pub(crate) pins: Arc<dyn PinControl>,
    pub(crate) chip: &'static dyn ChipOps,
    pub(crate) chip_id: u16,

    pub(crate) dc_icl: Option<Arc<Votable>>,
    pub(crate) disable_input: Option<Arc<Votable>>,
    pub(crate) tx_icl: Option<Arc<Votable>>,

    pub(crate) events_tx: mpsc::Sender<Event>,
    pub(crate) events_rx: Option<mpsc::Receiver<Event>>,
    notify_tx: broadcast::Sender<Notification>,

    pub(crate) enabled: bool,
    pub(crate) online: bool,
    pub(crate) mode: Option<ChargeMode>,
    pub(crate) force_bpp: bool,
    pub(crate) mfg: u16,
    pub(crate) mfg_accepted: bool,
    pub(crate) chg_on_rtx: bool,
    pub(crate) epp_neg_icl_ua: u32,
    last_capacity: Option<u8>,

    icl_ramp: bool,

    pub(crate) align: AlignmentEstimator,

    tx_busy: bool,
    tx_done: bool,
    rx_buf: Vec<u8>,
    rx_done: bool,
    pp_buf: [u8; PP_BUF_LEN],
    pp_valid: bool,

    pub(crate) rtx_path: RtxPath,
    pub(crate) rtx_err: RtxError,
    pub(crate) rtx_attached: bool,
    pub(crate) rtx_level: u8,

    pub(crate) settle_timer: DeferredTimer,
    pub(crate) confirm_timer: DeferredTimer,
    pub(crate) align_fault_timer: DeferredTimer,
    pub(crate) align_tick: DeferredTimer,
    pub(crate) presence_timer: DeferredTimer,
    pub(crate) ramp_timer: DeferredTimer,
    pub(crate) tx_timer: DeferredTimer,
    pub(crate) serial_timer: DeferredTimer,
    reenable_timer: DeferredTimer,
}

impl Supervisor {
    pub fn new(
        cfg: ChargerConfig,
        bus: Box<dyn RegisterBus>,
        pins: Arc<dyn PinControl>,
        services: Services,
    ) -> Result<(Self, SupervisorHandle), Error> {
        cfg.validate()?;
        let io = Arc::new(ChipIo::new(bus));
        let (events_tx, events_rx) = mpsc::channel(64);
        let (notify_tx, _) = broadcast::channel(64);
        let handle = SupervisorHandle {
            events: events_tx.clone(),
            notify: notify_tx.clone(),
            io: io.clone(),
        };
        let chip_id = cfg.chip_id_default;
        let sup = Supervisor {
            cfg,
            io,
            pins,
            chip: ops_for_chip_id(chip_id),
            chip_id,
            dc_icl: services.dc_icl,
            disable_input: services.disable_input,
            tx_icl: services.tx_icl,
            events_tx,
            events_rx: Some(events_rx),
            notify_tx,
            enabled: true,
            online: false,
            mode: None,
            force_bpp: false,
            mfg: 0,
            mfg_accepted: false,
            chg_on_rtx: false,
            epp_neg_icl_ua: DC_ICL_EPP_UA,
            last_capacity: None,
            icl_ramp: false,
            align: AlignmentEstimator::new(),
            tx_busy: false,
            tx_done: true,
            rx_buf: Vec::new(),
            rx_done: false,
            pp_buf: [0; PP_BUF_LEN],
            pp_valid: false,
            rtx_path: RtxPath::Disabled,
            rtx_err: RtxError::None,
            rtx_attached: false,
            rtx_level: 0,
            settle_timer: DeferredTimer::new(),
            confirm_timer: DeferredTimer::new(),
            align_fault_timer: DeferredTimer::new(),
            align_tick: DeferredTimer::new(),
            presence_timer: DeferredTimer::new(),
            ramp_timer: DeferredTimer::new(),
            tx_timer: DeferredTimer::new(),
            serial_timer: DeferredTimer::new(),
            reenable_timer: DeferredTimer::new(),
        };
        Ok((sup, handle))
    }

    /// Run the mailbox loop until every handle is dropped.
    pub async fn run(mut self) {
        self.initialize().await;
        let Some(mut rx) = self.events_rx.take() else {
            return;
        };
        while let Some(ev) = rx.recv().await {
            self.handle_event(ev).await;
        }
        info!("link: supervisor shutting down");
    }

    /// Startup: drive the straps, identify the chip, place standing votes
    /// and pick up a session that is already in the field.
    pub(crate) async fn initialize(&mut self) {
        if self.pins.supports(Pin::ProfileSelect) {
            self.pins.set(Pin::ProfileSelect, self.cfg.profile_select_high);
        }
        if self.pins.supports(Pin::Enable) {
            // Active low: run enabled.
            self.pins.set(Pin::Enable, false);
        }

        let (chip_id, powered) = self.probe_chip_id();
        self.chip_id = chip_id;
        self.chip = ops_for_chip_id(chip_id);
        info!(
            "chip: id {:#06x}, generation {:?}, powered {powered}",
            chip_id,
            self.chip.generation()
        );

        if let Some(tx_icl) = &self.tx_icl {
            tx_icl.vote(RTX_DEFAULT_VOTER, ma_to_ua(RTX_TX_ICL_MAX_MA));
            let mut sub = tx_icl.subscribe();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                while sub.changed().await.is_ok() {
                    if tx.send(Event::TxLimitChanged).await.is_err() {
                        break;
                    }
                }
            });
        }

        if powered {
            // Already in field; the first rectified-voltage interrupt after
            // this is absorbed by the online check.
            self.handle_confirm().await;
        } else {
            self.vote_defaults();
        }
    }

    /// Read the chip id; when the chip is unpowered, pulse the transmit
    /// power path to power the die for the read. Returns (id, in-field).
    fn probe_chip_id(&mut self) -> (u16, bool) {
        match self.io.read_u16(CHIP_ID_REG) {
            Ok(id) => (id, true),
            Err(_) => {
                if self.rtx_power(true) {
                    let read = self.io.read_u16(CHIP_ID_REG);
                    self.rtx_power(false);
                    if let Ok(id) = read {
                        return (id, false);
                    }
                }
                info!(
                    "chip: probe failed, assuming {:#06x}",
                    self.cfg.chip_id_default
                );
                (self.cfg.chip_id_default, false)
            }
        }
    }

    pub(crate) async fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Irq => self.handle_irq().await,
            Event::DetectIrq => self.handle_detect_irq(),
            Event::ConfirmSettled => self.handle_confirm().await,
            Event::DetectTimeout => self.handle_detect_timeout(),
            Event::AlignmentTimeout => {
                info!("align: timeout, no coupling");
                if self.align.note_alignment_timeout() {
                    self.notify_alignment();
                }
            }
            Event::AlignTick => self.handle_align_tick(),
            Event::PresencePoll => self.handle_presence_poll().await,
            Event::RampAlarm => self.handle_ramp_alarm(),
            Event::TxTimeout => self.handle_tx_timeout(),
            Event::SendSerialId => self.send_fast_serial(),
            Event::ReenablePower => self.handle_reenable(),
            Event::TxLimitChanged => self.handle_tx_limit_changed().await,
            Event::Command(cmd) => self.handle_command(cmd).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetEnabled(on) => self.set_enabled(on),
            Command::SetCapacity(c) => self.set_capacity(c),
            Command::SetCurrentLimit { ua, resp } => {
                let _ = resp.send(self.user_current_limit(ua));
            }
            Command::SetVoutMax { mv, resp } => {
                let _ = resp.send(self.set_vout_max(mv));
            }
            Command::SetRtx { on, resp } => {
                let r = self.set_rtx(on).await;
                let _ = resp.send(r);
            }
            Command::SendData { data, resp } => {
                let _ = resp.send(self.send_data(data));
            }
            Command::TakeReceived { resp } => {
                let _ = resp.send(self.take_received());
            }
            Command::Snapshot { resp } => {
                let _ = resp.send(self.snapshot());
            }
            Command::ReadTelemetry { resp } => {
                let _ = resp.send(self.telemetry());
            }
        }
    }

    // ---- interrupt dispatch ----

    /// Single entry point per hardware interrupt: read the latched word
    /// once, clear it at the chip, then route in fixed order.
    async fn handle_irq(&mut self) {
        let flags = match self.io.read_u16(INT_REG) {
            Ok(raw) => StatusFlags::from_bits_truncate(raw),
            Err(e) => {
                if !e.is_absent() {
                    error!("irq: failed to read interrupt register: {e}");
                }
                return;
            }
        };
        if self.rtx_path == RtxPath::Disabled {
            debug!("irq: {flags:?} online={}", self.online);
        }
        if flags.is_empty() {
            return;
        }
        if let Err(e) = self.clear_interrupts(flags) {
            error!("irq: failed to clear interrupts: {e}");
            return;
        }

        // Transmit role is exclusive: no receive-side component sees the
        // interrupt while we are a transmitter.
        if self.rtx_path != RtxPath::Disabled {
            self.handle_rtx_irq(flags).await;
            return;
        }

        if flags.contains(StatusFlags::VRECT_ON) && !self.online {
            info!("irq: rectified voltage, arming confirmation");
            self.settle_timer
                .arm(&self.events_tx, CONFIRM_SETTLE_DELAY, Event::ConfirmSettled);
        }

        self.check_power_path_reset(flags);

        if flags.intersects(StatusFlags::LIMIT_MASK) {
            self.handle_limit_flags(flags).await;
        }
        if flags.contains(StatusFlags::DATA_RECEIVED) {
            self.capture_received();
        }
        if flags.contains(StatusFlags::SEND_BUSY) {
            self.tx_busy = false;
            self.tx_done = true;
            self.tx_timer.cancel();
            self.notify(Notification::SendComplete { ok: true });
        }
        if flags.contains(StatusFlags::PP_RECEIVED) {
            self.capture_proprietary();
        }
        if flags.contains(StatusFlags::CC_RESET_DONE) {
            self.abort_transfers();
        }
    }

    /// Write-1-to-clear the given bits and strobe the clear command.
    pub(crate) fn clear_interrupts(&self, mask: StatusFlags) -> Result<(), Error> {
        let _cmd = self.io.command_lock();
        self.io.write_u16(INT_CLEAR_REG, mask.bits())?;
        self.chip.send_command(&self.io, CommandBits::CLEAR_INT)
    }

    /// Program the interrupt mask for the current operating role.
    pub(crate) fn enable_interrupts(&self) -> Result<(), Error> {
        let mask = if self.rtx_path != RtxPath::Disabled {
            StatusFlags::RTX_MASK
        } else {
            let mut m = StatusFlags::LIMIT_MASK | StatusFlags::CC_MASK | StatusFlags::VRECT_ON;
            match self.cfg.power_path_reset {
                PowerPathResetMode::OnModeChanged => m |= StatusFlags::MODE_CHANGED,
                PowerPathResetMode::OnVoutChanged => m |= StatusFlags::VOUT_CHANGED,
                PowerPathResetMode::Never => {}
            }
            m
        };
        if let Err(e) = self.clear_interrupts(mask) {
            warn!("irq: could not clear before masking: {e}");
        }
        Ok(self.io.write_u16(INT_ENABLE_REG, mask.bits())?)
    }

    // ---- link lifecycle ----

    /// Coil-detect line edge: pre-online alignment feedback plus the
    /// confirmation window for the rectified-voltage signal.
    fn handle_detect_irq(&mut self) {
        if self.online || self.rtx_path != RtxPath::Disabled {
            debug!("detect: ignored, online={} rtx={:?}", self.online, self.rtx_path);
            return;
        }
        if self.align.note_detect_edge() {
            self.notify_alignment();
        }
        self.align_fault_timer.cancel();
        self.confirm_timer
            .arm(&self.events_tx, DETECT_CONFIRM_TIMEOUT, Event::DetectTimeout);
    }

    fn handle_detect_timeout(&mut self) {
        info!("link: no rectified voltage, online={}", self.online);
        if self.align.note_confirm_timeout() {
            self.notify_alignment();
        }
        self.align_fault_timer
            .arm(&self.events_tx, ALIGNMENT_TIMEOUT, Event::AlignmentTimeout);
    }

    /// Confirmation sequence after the rectified-voltage settle delay:
    /// negotiate, program, then promote to online.
    pub(crate) async fn handle_confirm(&mut self) {
        if self.rtx_path != RtxPath::Disabled {
            return;
        }
        self.confirm_timer.cancel();
        self.apply_board_calibration();
        if self.cfg.recheck_mode_after_confirm {
            self.recheck_mode_after_confirm().await;
        }
        self.check_epp_negotiated_current();
        self.set_dc_icl();
        self.write_fod().await;
        if self.cfg.dc_icl_bpp_ua.is_none() {
            self.start_icl_ramp();
        }
        if !self.online {
            self.set_online().await;
        }
    }

    pub(crate) async fn set_online(&mut self) {
        info!("link: online");
        self.online = true;
        self.tx_busy = false;
        self.tx_done = true;
        self.rx_done = false;
        self.rx_buf.clear();
        self.last_capacity = None;

        match self.io.read_u8(CUSTOMER_ID_REG) {
            Ok(cid) => debug!("link: customer id {cid:#04x}"),
            Err(e) => warn!("link: could not read customer id: {e}"),
        }
        if let Err(e) = self.enable_interrupts() {
            error!("link: could not enable interrupts: {e}");
        }

        self.reenable_timer.cancel();
        self.confirm_timer.cancel();
        self.align_fault_timer.cancel();

        self.align.begin_session();
        self.notify_alignment();
        if self.cfg.alignment_enabled() {
            self.align_tick
                .arm(&self.events_tx, ALIGN_TICK_PERIOD, Event::AlignTick);
        }
        self.presence_timer
            .arm(&self.events_tx, PRESENCE_POLL_PERIOD, Event::PresencePoll);

        self.notify(Notification::Online {
            mode: self.mode.unwrap_or(ChargeMode::Bpp),
        });
    }

    /// Tear the session down. Safe to call repeatedly: every cancellation
    /// and vote restoration below is idempotent.
    pub(crate) async fn set_offline(&mut self) {
        info!("link: offline");
        let was_online = self.online;
        self.online = false;
        self.force_bpp = false;
        self.chg_on_rtx = false;
        self.mode = None;
        self.mfg = 0;
        self.mfg_accepted = false;
        self.epp_neg_icl_ua = DC_ICL_EPP_UA;

        // A fresh serial number is read on the next session.
        self.pp_valid = false;
        self.pp_buf = [0; PP_BUF_LEN];

        self.abort_transfers();
        self.presence_timer.cancel();
        self.settle_timer.cancel();
        self.confirm_timer.cancel();

        self.align_tick.cancel();
        self.align_fault_timer.cancel();
        self.align.reset_offline();
        self.notify_alignment();

        self.reset_icl_ramp();
        self.vote_defaults();

        if self.enabled && self.pins.supports(Pin::Enable) {
            // Pulse the enable line so the chip goes through a full reset.
            self.pins.set(Pin::Enable, true);
            self.reenable_timer
                .arm(&self.events_tx, REENABLE_DELAY, Event::ReenablePower);
        }

        if was_online {
            self.notify(Notification::Offline);
        }
    }

    fn handle_reenable(&mut self) {
        if self.enabled && self.pins.supports(Pin::Enable) {
            self.pins.set(Pin::Enable, false);
        }
    }

    /// Periodic presence check while online; one failed status read within
    /// a poll interval is link loss.
    async fn handle_presence_poll(&mut self) {
        if !self.online {
            return;
        }
        match self.io.read_u16(STATUS_REG) {
            Ok(status) => {
                debug!("link: presence ok, status {status:#06x}");
                self.presence_timer
                    .arm(&self.events_tx, PRESENCE_POLL_PERIOD, Event::PresencePoll);
            }
            Err(e) => {
                info!("link: presence poll failed ({e}), link lost");
                self.set_offline().await;
            }
        }
    }

    // ---- input current limit ----

    /// Restore the safe default votes. Unconditional and idempotent; runs
    /// on every teardown.
    pub(crate) fn vote_defaults(&mut self) {
        let Some(dc_icl) = &self.dc_icl else {
            warn!("icl: arbitration service absent, nothing to vote");
            return;
        };
        dc_icl.vote(WLC_VOTER, DC_ICL_BPP_UA);
        let ocp_reset = self.cfg.dc_icl_epp_ua.unwrap_or(DC_ICL_EPP_UA);
        dc_icl.vote(OCP_VOTER, ocp_reset);
    }

    /// Place the session vote for the negotiated profile.
    pub(crate) fn set_dc_icl(&mut self) {
        let epp = self.is_epp();
        let Some(dc_icl) = self.dc_icl.clone() else {
            warn!("icl: arbitration service absent, using chip limit only");
            if let Err(e) = self.chip.set_rx_ilim_ma(&self.io, ua_to_ma(RX_ILIM_MAX_UA)) {
                warn!("icl: could not raise receive current limit: {e}");
            }
            return;
        };

        let mut icl = DC_ICL_BPP_UA;
        if self.icl_ramp {
            icl = self.cfg.icl_ramp_ua;
        }
        if let Some(bpp) = self.cfg.dc_icl_bpp_ua {
            icl = bpp;
        }
        if epp {
            icl = self.epp_neg_icl_ua;
            if let Some(over) = self.cfg.dc_icl_epp_ua {
                icl = over;
            }
        }

        info!("icl: voting {icl} uA (ramp={})", self.icl_ramp);
        if self.icl_ramp {
            dc_icl.vote(RAMP_VOTER, icl);
        }
        dc_icl.vote(WLC_VOTER, icl);

        if let Err(e) = self.chip.set_rx_ilim_ma(&self.io, ua_to_ma(RX_ILIM_MAX_UA)) {
            warn!("icl: could not raise receive current limit: {e}");
        }
    }

    /// Arm the BPP ramp alarm. EPP sessions get their full limit at once.
    fn start_icl_ramp(&mut self) {
        let Some(delay_ms) = self.cfg.icl_ramp_delay_ms else {
            return;
        };
        if self.cfg.icl_ramp_ua == 0 || self.is_epp() {
            return;
        }
        self.reset_icl_ramp();
        info!("icl: ramp alarm in {delay_ms} ms");
        self.ramp_timer.arm(
            &self.events_tx,
            Duration::from_millis(delay_ms),
            Event::RampAlarm,
        );
    }

    fn handle_ramp_alarm(&mut self) {
        if self.chg_on_rtx {
            debug!("icl: charging from a phone, ramp skipped");
            return;
        }
        if !self.online {
            return;
        }
        info!("icl: ramp");
        self.icl_ramp = true;
        self.set_dc_icl();
    }

    fn reset_icl_ramp(&mut self) {
        self.icl_ramp = false;
        self.ramp_timer.cancel();
        if let Some(dc_icl) = &self.dc_icl {
            dc_icl.withdraw(RAMP_VOTER);
        }
    }

    fn user_current_limit(&mut self, ua: u32) -> Result<(), Error> {
        let Some(dc_icl) = &self.dc_icl else {
            return Err(Error::Rejected("arbitration service absent"));
        };
        dc_icl.vote(USER_VOTER, ua);
        Ok(())
    }

    // ---- power path reset ----

    fn power_path_reset_needed(&self, flags: StatusFlags) -> bool {
        match self.cfg.power_path_reset {
            PowerPathResetMode::Never => false,
            PowerPathResetMode::OnModeChanged => {
                if !flags.contains(StatusFlags::MODE_CHANGED) {
                    return false;
                }
                match self.chip.sys_mode(&self.io) {
                    Ok(mode) => !mode.is_receiving(),
                    Err(Error::Bus(e)) => e.is_absent(),
                    Err(_) => false,
                }
            }
            PowerPathResetMode::OnVoutChanged => {
                if !flags.contains(StatusFlags::VOUT_CHANGED) {
                    return false;
                }
                match self.io.read_u16(STATUS_REG) {
                    Ok(s) => !StatusFlags::from_bits_truncate(s).contains(StatusFlags::VOUT_ON),
                    Err(e) => e.is_absent(),
                }
            }
        }
    }

    fn check_power_path_reset(&mut self, flags: StatusFlags) {
        if self.power_path_reset_needed(flags) {
            warn!("link: chip left receive mode, requesting power-path reset");
            self.notify(Notification::PowerPathResetRequested);
        }
    }

    // ---- transmitter data exchange ----

    pub(crate) fn send_csp(&self, capacity: u8) -> Result<(), Error> {
        info!("csp: sending capacity {capacity}");
        let _cmd = self.io.command_lock();
        self.io.write_u8(CHARGE_STAT_REG, capacity)?;
        self.chip.send_command(&self.io, CommandBits::SEND_CSP)
    }

    pub(crate) fn send_eop(&self, reason: EndOfPowerReason) -> Result<(), Error> {
        info!("eop: sending reason {reason:?}");
        let _cmd = self.io.command_lock();
        self.io.write_u8(EPT_REG, reason.code())?;
        self.chip.send_command(&self.io, CommandBits::SEND_EOP)
    }

    fn send_data(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if !self.online {
            return Err(Error::NotOnline);
        }
        if self.tx_busy {
            return Err(Error::Busy);
        }
        if data.is_empty() || data.len() > DATA_BUF_LEN {
            return Err(Error::Rejected("payload size"));
        }
        self.tx_busy = true;
        self.tx_done = false;
        let loaded = (|| {
            let _cmd = self.io.command_lock();
            self.chip.write_data_buf(&self.io, &data)?;
            self.chip.set_send_size(&self.io, data.len())?;
            self.chip.send_command(&self.io, CommandBits::CC_ACTIVATE)
        })();
        match loaded {
            Ok(()) => {
                self.tx_timer
                    .arm(&self.events_tx, TX_TIMEOUT, Event::TxTimeout);
                Ok(())
            }
            Err(e) => {
                self.tx_busy = false;
                self.tx_done = true;
                error!("cc: failed to load send buffer: {e}");
                Err(e)
            }
        }
    }

    fn handle_tx_timeout(&mut self) {
        info!("cc: timeout waiting for send complete");
        self.tx_busy = false;
        self.tx_done = true;
        self.notify(Notification::SendComplete { ok: false });
    }

    fn capture_received(&mut self) {
        let len = match self.chip.recv_size(&self.io) {
            Ok(len) => len.min(DATA_BUF_LEN),
            Err(e) => {
                error!("cc: failed to read receive length: {e}");
                return;
            }
        };
        if len == 0 {
            return;
        }
        let mut buf = vec![0u8; len];
        if let Err(e) = self.chip.read_data_buf(&self.io, &mut buf) {
            error!("cc: failed to read receive buffer: {e}");
            return;
        }
        self.rx_buf = buf;
        self.rx_done = true;
        self.notify(Notification::DataReceived { len });
    }

    fn capture_proprietary(&mut self) {
        let mut buf = [0u8; PP_BUF_LEN];
        if let Err(e) = self.chip.read_data_buf(&self.io, &mut buf) {
            error!("pp: failed to read packet: {e}");
            return;
        }
        self.pp_buf = buf;
        self.pp_valid = buf[0] == FAST_SERIAL_HEADER;
        info!("pp: received {}", hex_str(&buf));

        let accessory = buf[PP_BUF_LEN - 1] & ACCESSORY_TYPE_MASK;
        self.chg_on_rtx = accessory == ACCESSORY_TYPE_PHONE;
        if self.chg_on_rtx {
            info!("pp: transmitter is a phone");
        }
    }

    fn abort_transfers(&mut self) {
        self.tx_timer.cancel();
        let had_pending = self.tx_busy;
        self.tx_busy = false;
        self.tx_done = true;
        self.rx_done = false;
        self.rx_buf.clear();
        if had_pending {
            self.notify(Notification::SendComplete { ok: false });
        }
    }

    fn take_received(&mut self) -> Option<Vec<u8>> {
        if !self.rx_done {
            return None;
        }
        self.rx_done = false;
        Some(std::mem::take(&mut self.rx_buf))
    }

    // ---- alignment ----

    fn handle_align_tick(&mut self) {
        if !self.cfg.alignment_enabled() || !self.online {
            return;
        }
        if self.align.should_reschedule() {
            self.align_tick
                .arm(&self.events_tx, ALIGN_TICK_PERIOD, Event::AlignTick);
        }

        if self.align.capability() == crate::types::AlignCapability::Checking {
            self.align.record_mfg_check();
            match self.chip.tx_mfg_code(&self.io) {
                Err(e) => {
                    error!("align: cannot read manufacturer code: {e}");
                    return;
                }
                // Not latched yet; check again next tick.
                Ok(0) => return,
                Ok(mfg) => {
                    self.mfg = mfg;
                    self.mfg_accepted = mfg == self.cfg.accepted_tx_mfg;
                    if !self.mfg_accepted || !self.is_epp() {
                        info!("align: transmitter not capable (mfg {mfg:#06x})");
                        self.align_tick.cancel();
                        self.align.capability_failed();
                        return;
                    }
                    self.align.capability_passed();
                }
            }
        }

        let iout_ma = if self.cfg.alignment_scalar != 0 {
            match self.chip.iout_ma(&self.io) {
                Ok(ma) => ma,
                Err(_) => {
                    warn!("align: failed to read output current");
                    0
                }
            }
        } else {
            0
        };
        let freq_hz = match self.chip.op_freq_khz(&self.io) {
            Ok(khz) => khz_to_hz(khz),
            Err(_) => {
                warn!("align: failed to read operating frequency");
                return;
            }
        };
        if let Some(score) = self.align.evaluate(
            &self.cfg.alignment_freq_hz,
            self.cfg.alignment_scalar,
            self.cfg.alignment_hysteresis_hz,
            iout_ma,
            freq_hz,
        ) {
            info!("align: score {score} (freq {freq_hz} Hz)");
            self.notify_alignment();
        }
    }

    pub(crate) fn notify_alignment(&self) {
        self.notify(Notification::Alignment {
            code: self.align.code(),
            score: self.align.score(),
        });
    }

    // ---- property surface ----

    fn set_enabled(&mut self, on: bool) {
        if self.enabled == on {
            return;
        }
        self.enabled = on;
        // The field state follows the line: asserting while in field brings
        // the session up, deasserting drops it.
        warn!("link: {}", if on { "enabled" } else { "disabled" });
        if self.pins.supports(Pin::Enable) {
            self.pins.set(Pin::Enable, !on);
        }
    }

    fn set_capacity(&mut self, capacity: u8) {
        if self.last_capacity == Some(capacity) {
            return;
        }
        self.last_capacity = Some(capacity);
        if !self.online {
            return;
        }
        if let Err(e) = self.send_csp(capacity) {
            error!("csp: failed to send: {e}");
        }
    }

    fn set_vout_max(&mut self, mv: u32) -> Result<(), Error> {
        if mv > self.cfg.max_vout_mv {
            return Err(Error::Rejected("voltage above board ceiling"));
        }
        self.chip.set_vout_mv(&self.io, mv)
    }

    fn tx_id_string(&mut self) -> Option<String> {
        if !self.online {
            return None;
        }
        if self.is_epp() {
            match self.chip.tx_id(&self.io) {
                Ok(id) => Some(format!("{id:08x}")),
                Err(e) => {
                    warn!("link: failed to read transmitter id: {e}");
                    None
                }
            }
        } else if self.pp_valid {
            let mut id = [0u8; 4];
            id.copy_from_slice(&self.pp_buf[1..5]);
            Some(format!("{:08x}", u32::from_le_bytes(id)))
        } else {
            None
        }
    }

    fn snapshot(&mut self) -> StatusSnapshot {
        StatusSnapshot {
            present: true,
            enabled: self.enabled,
            online: self.online,
            mode: self.mode,
            align_code: self.align.code(),
            align_score: self.align.score(),
            capacity: self.last_capacity,
            chip_id: self.chip_id,
            tx_id: self.tx_id_string(),
            effective_icl_ua: self.dc_icl.as_ref().and_then(|v| v.effective()),
            rtx_path: self.rtx_path,
            rtx_error: self.rtx_err,
            rtx_attached: self.rtx_attached,
            rtx_receiver_level: self.rtx_level,
        }
    }

    fn telemetry(&self) -> Telemetry {
        if !self.online && self.rtx_path == RtxPath::Disabled {
            return Telemetry::default();
        }
        Telemetry {
            vout_mv: self.chip.vout_mv(&self.io).ok(),
            vrect_mv: self.chip.vrect_mv(&self.io).ok(),
            iout_ma: self.chip.iout_ma(&self.io).ok(),
            die_temp_c: self.chip.die_temp_c(&self.io).ok(),
            op_freq_hz: self.chip.op_freq_khz(&self.io).ok().map(khz_to_hz),
        }
    }

    pub(crate) fn notify(&self, n: Notification) {
        let _ = self.notify_tx.send(n);
    }
}

/// Cloneable access to a running supervisor.
///
/// Interrupt notifications, property reads/writes and observer subscription
/// go through here. Raw register reads bypass the actor via the shared
/// register lock, so diagnostics work even while the mailbox is busy.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: mpsc::Sender<Event>,
    notify: broadcast::Sender<Notification>,
    io: Arc<ChipIo>,
}

impl SupervisorHandle {
    /// The main interrupt line fired.
    pub async fn interrupt(&self) -> Result<(), Error> {
        self.send(Event::Irq).await
    }

    /// The coil-detect line saw an edge.
    pub async fn coil_detect(&self) -> Result<(), Error> {
        self.send(Event::DetectIrq).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::Snapshot { resp: tx })).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn set_enabled(&self, on: bool) -> Result<(), Error> {
        self.send(Event::Command(Command::SetEnabled(on))).await
    }

    /// Battery-capacity passthrough; triggers a charge-status send to the
    /// transmitter while online.
    pub async fn set_capacity(&self, capacity: u8) -> Result<(), Error> {
        self.send(Event::Command(Command::SetCapacity(capacity))).await
    }

    pub async fn set_current_limit_ua(&self, ua: u32) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::SetCurrentLimit { ua, resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn set_max_voltage_mv(&self, mv: u32) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::SetVoutMax { mv, resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Enter or leave reverse-transmit mode.
    pub async fn set_rtx(&self, on: bool) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::SetRtx { on, resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Send an application packet to the transmitter.
    pub async fn send_data(&self, data: Vec<u8>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::SendData { data, resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Sample live measurements (voltage, current, temperature, frequency).
    pub async fn telemetry(&self) -> Result<Telemetry, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::ReadTelemetry { resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Take the last received application packet, if one is pending.
    pub async fn take_received(&self) -> Result<Option<Vec<u8>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Command(Command::TakeReceived { resp: tx }))
            .await?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Raw diagnostic register read, serialized only against other register
    /// access.
    pub fn raw_read(&self, reg: u16, len: usize) -> Result<Vec<u8>, BusError> {
        let mut buf = vec![0u8; len];
        self.io.read_n(reg, &mut buf)?;
        Ok(buf)
    }

    /// Raw diagnostic register write.
    pub fn raw_write(&self, reg: u16, data: &[u8]) -> Result<(), BusError> {
        self.io.write_n(reg, data)
    }

    async fn send(&self, ev: Event) -> Result<(), Error> {
        self.events.send(ev).await.map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Shared fixture for supervisor-level tests across modules.

    use super::*;
    use crate::bus::mock::{FakePins, MockBus};
    use crate::chip::CHIP_ID_GEN_EXT;
    use crate::votes::{DC_ICL_VOTABLE, DISABLE_INPUT_VOTABLE, TX_ICL_VOTABLE};

    pub(crate) struct Rig {
        pub sup: Supervisor,
        pub handle: SupervisorHandle,
        pub bus: MockBus,
        pub pins: Arc<FakePins>,
        pub dc_icl: Arc<Votable>,
        pub disable_input: Arc<Votable>,
        pub tx_icl: Arc<Votable>,
        pub events: mpsc::Receiver<Event>,
        pub notes: broadcast::Receiver<Notification>,
    }

    impl Rig {
        /// Collect the notifications emitted so far.
        pub fn drain_notes(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.notes.try_recv() {
                out.push(n);
            }
            out
        }
    }

    pub(crate) fn rig_with(cfg: ChargerConfig) -> Rig {
        let bus = MockBus::new();
        bus.set_u16(CHIP_ID_REG, CHIP_ID_GEN_EXT);
        let pins = FakePins::new();
        let dc_icl = Arc::new(Votable::new(DC_ICL_VOTABLE));
        let disable_input = Arc::new(Votable::new(DISABLE_INPUT_VOTABLE));
        let tx_icl = Arc::new(Votable::new(TX_ICL_VOTABLE));
        let services = Services {
            dc_icl: Some(dc_icl.clone()),
            disable_input: Some(disable_input.clone()),
            tx_icl: Some(tx_icl.clone()),
        };
        let (mut sup, handle) =
            Supervisor::new(cfg, Box::new(bus.clone()), pins.clone(), services).unwrap();
        let events = sup.events_rx.take().unwrap();
        let notes = handle.subscribe();
        sup.chip_id = CHIP_ID_GEN_EXT;
        sup.chip = ops_for_chip_id(CHIP_ID_GEN_EXT);
        Rig {
            sup,
            handle,
            bus,
            pins,
            dc_icl,
            disable_input,
            tx_icl,
            events,
            notes,
        }
    }

    pub(crate) fn rig() -> Rig {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        rig_with(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::{rig, rig_with};
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::chip::CHIP_ID_GEN_EXT;
    use crate::registers::{
        COM_REG, EPP_NEG_POWER_REG, FOD_REG, OP_FREQ_REG, SYS_MODE_REG, TX_MFG_CODE_REG,
        VOUT_ADC_REG,
    };

    fn status_bits(flags: StatusFlags) -> u16 {
        flags.bits()
    }

    #[tokio::test(start_paused = true)]
    async fn detect_edge_walks_alignment_feedback_through_timeouts() {
        let mut r = rig();
        r.sup.handle_event(Event::DetectIrq).await;
        assert_eq!(r.sup.align.code(), crate::types::AlignCode::Checking);
        assert!(r.sup.confirm_timer.is_armed());

        // No rectified voltage: the confirmation window elapses.
        let ev = r.events.recv().await.unwrap();
        assert!(matches!(ev, Event::DetectTimeout));
        r.sup.handle_event(ev).await;
        assert_eq!(r.sup.align.code(), crate::types::AlignCode::Move);
        assert!(r.sup.align_fault_timer.is_armed());

        // And then the alignment window.
        let ev = r.events.recv().await.unwrap();
        assert!(matches!(ev, Event::AlignmentTimeout));
        r.sup.handle_event(ev).await;
        assert_eq!(r.sup.align.code(), crate::types::AlignCode::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn epp_session_confirms_programs_and_goes_online() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        cfg.fod_epp = vec![0xAA; 8];
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x02); // extended mode
        r.bus.set_u8(EPP_NEG_POWER_REG, 24); // 12 W contract
        r.bus.push_read_u16(INT_REG, status_bits(StatusFlags::VRECT_ON));

        r.sup.handle_event(Event::Irq).await;
        assert!(r.sup.settle_timer.is_armed());

        let ev = r.events.recv().await.unwrap();
        assert!(matches!(ev, Event::ConfirmSettled));
        r.sup.handle_event(ev).await;

        assert!(r.sup.online);
        assert_eq!(r.sup.mode, Some(ChargeMode::Epp));
        assert_eq!(r.dc_icl.client_vote(WLC_VOTER), Some(DC_ICL_EPP_UA));
        assert_eq!(r.bus.writes_to(FOD_REG).len(), 1);
        assert_eq!(r.bus.mem_slice(FOD_REG, 8), vec![0xAA; 8]);
        assert!(r.sup.presence_timer.is_armed());
        // EPP sessions do not ramp.
        assert!(!r.sup.ramp_timer.is_armed());

        let notes = r.drain_notes();
        assert!(notes
            .iter()
            .any(|n| matches!(n, Notification::Online { mode: ChargeMode::Epp })));
    }

    #[tokio::test(start_paused = true)]
    async fn over_voltage_interrupt_ends_the_epp_session() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        cfg.fod_epp = vec![0xAA; 8];
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x02);
        r.bus.set_u8(EPP_NEG_POWER_REG, 24);
        r.bus.push_read_u16(INT_REG, status_bits(StatusFlags::VRECT_ON));
        r.sup.handle_event(Event::Irq).await;
        let ev = r.events.recv().await.unwrap();
        r.sup.handle_event(ev).await;
        assert!(r.sup.online);
        r.drain_notes();

        r.bus
            .push_read_u16(INT_REG, status_bits(StatusFlags::OVER_VOLTAGE));
        r.sup.handle_event(Event::Irq).await;

        assert!(!r.sup.online);
        assert_eq!(r.bus.mem_u8(EPT_REG), EndOfPowerReason::OverVoltage.code());
        // Session vote is back at the BPP default and the ramp vote is gone.
        assert_eq!(r.dc_icl.client_vote(WLC_VOTER), Some(DC_ICL_BPP_UA));
        assert_eq!(r.dc_icl.client_vote(RAMP_VOTER), None);
        assert!(!r.sup.presence_timer.is_armed());
        assert!(!r.sup.align_tick.is_armed());
        let notes = r.drain_notes();
        assert!(notes.iter().any(|n| matches!(
            n,
            Notification::SessionEnded {
                reason: EndOfPowerReason::OverVoltage,
                ..
            }
        )));
        assert!(notes.iter().any(|n| matches!(n, Notification::Offline)));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_transition_is_idempotent() {
        let mut r = rig();
        r.sup.set_online().await;
        r.dc_icl.vote(RAMP_VOTER, 900_000);

        r.sup.set_offline().await;
        let first_votes = (
            r.dc_icl.client_vote(WLC_VOTER),
            r.dc_icl.client_vote(OCP_VOTER),
            r.dc_icl.client_vote(RAMP_VOTER),
        );
        r.sup.set_offline().await;

        assert!(!r.sup.online);
        assert_eq!(
            first_votes,
            (Some(DC_ICL_BPP_UA), Some(DC_ICL_EPP_UA), None)
        );
        assert_eq!(r.dc_icl.client_vote(WLC_VOTER), Some(DC_ICL_BPP_UA));
        assert_eq!(r.dc_icl.client_vote(RAMP_VOTER), None);
        assert_eq!(r.sup.align.code(), crate::types::AlignCode::Error);
        assert!(!r.sup.presence_timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_poll_failure_drops_the_link() {
        let mut r = rig();
        r.sup.set_online().await;
        assert!(r.sup.presence_timer.is_armed());

        r.bus.set_absent(true);
        r.sup.handle_event(Event::PresencePoll).await;
        assert!(!r.sup.online);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_poll_reschedules_while_healthy() {
        let mut r = rig();
        r.sup.set_online().await;
        r.sup.handle_event(Event::PresencePoll).await;
        assert!(r.sup.online);
        assert!(r.sup.presence_timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_passthrough_sends_charge_status_while_online() {
        let mut r = rig();
        r.sup.set_online().await;
        r.sup
            .handle_event(Event::Command(Command::SetCapacity(88)))
            .await;
        assert_eq!(r.bus.mem_u8(CHARGE_STAT_REG), 88);
        let com = r.bus.writes_to(COM_REG);
        let last = com.last().unwrap();
        assert_eq!(
            u16::from_le_bytes([last[0], last[1]]),
            CommandBits::SEND_CSP.bits()
        );

        // Same value again: no second send.
        let sends = com.len();
        r.sup
            .handle_event(Event::Command(Command::SetCapacity(88)))
            .await;
        assert_eq!(r.bus.writes_to(COM_REG).len(), sends);
    }

    #[tokio::test(start_paused = true)]
    async fn bpp_ramp_alarm_raises_the_session_vote() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x01); // basic mode -> BPP
        r.bus.push_read_u16(INT_REG, status_bits(StatusFlags::VRECT_ON));
        r.sup.handle_event(Event::Irq).await;
        let ev = r.events.recv().await.unwrap();
        r.sup.handle_event(ev).await;
        assert_eq!(r.sup.mode, Some(ChargeMode::Bpp));
        assert_eq!(r.dc_icl.client_vote(WLC_VOTER), Some(DC_ICL_BPP_UA));
        assert!(r.sup.ramp_timer.is_armed());

        // Drain until the ramp alarm fires (presence polls come first).
        loop {
            let ev = r.events.recv().await.unwrap();
            let is_ramp = matches!(ev, Event::RampAlarm);
            r.sup.handle_event(ev).await;
            if is_ramp {
                break;
            }
        }
        assert_eq!(
            r.dc_icl.client_vote(WLC_VOTER),
            Some(ChargerConfig::default().icl_ramp_ua)
        );
        assert_eq!(
            r.dc_icl.client_vote(RAMP_VOTER),
            Some(ChargerConfig::default().icl_ramp_ua)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn alignment_capability_and_scoring_over_ticks() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        cfg.alignment_freq_hz = vec![100_000, 110_000, 120_000, 130_000];
        cfg.alignment_scalar = 0;
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x02);
        r.bus.set_u16(TX_MFG_CODE_REG, 0x0072);
        r.bus.set_u16(OP_FREQ_REG, 126); // 126 kHz -> top bucket past hysteresis

        r.sup.set_online().await;
        assert!(r.sup.align_tick.is_armed());
        r.drain_notes();

        // First tick passes the capability check and scores.
        r.sup.handle_event(Event::AlignTick).await;
        assert_eq!(r.sup.align.capability(), crate::types::AlignCapability::Passed);
        assert_eq!(r.sup.align.score(), Some(100));
        let notes = r.drain_notes();
        assert!(notes.iter().any(|n| matches!(
            n,
            Notification::Alignment {
                score: Some(100),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_manufacturer_disables_alignment() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        cfg.alignment_freq_hz = vec![100_000, 110_000, 120_000, 130_000];
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x02);
        r.bus.set_u16(TX_MFG_CODE_REG, 0x0011);

        r.sup.set_online().await;
        r.sup.handle_event(Event::AlignTick).await;
        assert_eq!(r.sup.align.capability(), crate::types::AlignCapability::Failed);
        assert!(!r.sup.align_tick.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn power_path_reset_requested_when_chip_leaves_receive_mode() {
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        cfg.power_path_reset = PowerPathResetMode::OnModeChanged;
        let mut r = rig_with(cfg);
        r.bus.set_u8(SYS_MODE_REG, 0x00); // idle: not receiving
        r.bus
            .push_read_u16(INT_REG, status_bits(StatusFlags::MODE_CHANGED));

        r.sup.handle_event(Event::Irq).await;
        let notes = r.drain_notes();
        assert!(notes
            .iter()
            .any(|n| matches!(n, Notification::PowerPathResetRequested)));
    }

    #[tokio::test(start_paused = true)]
    async fn received_data_is_captured_and_taken_once() {
        let mut r = rig();
        r.sup.set_online().await;
        r.bus.set_u8(crate::registers::CC_RECV_SIZE_REG, 4);
        r.bus
            .set_mem(r.sup.chip.data_buf_base(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        r.bus
            .push_read_u16(INT_REG, status_bits(StatusFlags::DATA_RECEIVED));

        r.sup.handle_event(Event::Irq).await;
        assert_eq!(r.sup.take_received(), Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(r.sup.take_received(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_reads_live_values_only_while_powered() {
        let mut r = rig();
        r.bus.set_u16(VOUT_ADC_REG, 9_000);
        r.bus.set_u16(crate::registers::IOUT_ADC_REG, 850);
        r.bus.set_u16(crate::registers::DIE_TEMP_REG, 41);
        r.bus.set_u16(OP_FREQ_REG, 128);

        // Offline and not transmitting: nothing is sampled.
        let t = r.sup.telemetry();
        assert!(t.vout_mv.is_none());

        r.sup.set_online().await;
        let t = r.sup.telemetry();
        assert_eq!(t.vout_mv, Some(9_000));
        assert_eq!(t.iout_ma, Some(850));
        assert_eq!(t.die_temp_c, Some(41));
        assert_eq!(t.op_freq_hz, Some(128_000));
    }

    #[tokio::test(start_paused = true)]
    async fn spurious_interrupt_is_ignored() {
        let mut r = rig();
        r.bus.push_read_u16(INT_REG, 0);
        r.sup.handle_event(Event::Irq).await;
        // No clear command was issued.
        assert!(r.bus.writes_to(COM_REG).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chip_probe_falls_back_to_configured_id() {
        let bus = MockBus::new();
        bus.set_absent(true);
        let pins = crate::bus::mock::FakePins::without(vec![
            Pin::BoostEnable,
            Pin::SwitchEnable,
            Pin::BoostLevel,
        ]);
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = crate::chip::CHIP_ID_GEN_RTX;
        let (mut sup, _handle) =
            Supervisor::new(cfg, Box::new(bus.clone()), pins, Services::default()).unwrap();
        sup.initialize().await;
        assert_eq!(sup.chip_id, crate::chip::CHIP_ID_GEN_RTX);
        assert!(!sup.online);
    }

    #[tokio::test(start_paused = true)]
    async fn chip_probe_powers_the_die_through_the_transmit_path() {
        let bus = MockBus::new();
        // Unpowered on the first read, identifiable once the path is up.
        bus.push_read_error(CHIP_ID_REG, crate::bus::BusError::Absent);
        bus.set_u16(CHIP_ID_REG, crate::chip::CHIP_ID_GEN_RTX);
        let pins = crate::bus::mock::FakePins::new();
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        let (mut sup, _handle) =
            Supervisor::new(cfg, Box::new(bus.clone()), pins.clone(), Services::default())
                .unwrap();
        sup.initialize().await;
        assert_eq!(sup.chip_id, crate::chip::CHIP_ID_GEN_RTX);
        // Not in field: probing must not leave a session behind, nor the
        // transmit path asserted.
        assert!(!sup.online);
        assert!(!pins.level(Pin::BoostEnable));
        assert!(!pins.level(Pin::SwitchEnable));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_roundtrip_through_running_actor() {
        let bus = MockBus::new();
        bus.set_u16(CHIP_ID_REG, CHIP_ID_GEN_EXT);
        bus.set_u16(VOUT_ADC_REG, 5_000);
        let pins = crate::bus::mock::FakePins::new();
        let mut cfg = ChargerConfig::default();
        cfg.chip_id_default = CHIP_ID_GEN_EXT;
        let (sup, handle) =
            Supervisor::new(cfg, Box::new(bus.clone()), pins, Services::default()).unwrap();
        tokio::spawn(sup.run());

        // Probe found the chip powered, so the actor confirmed a session.
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.online);
        assert_eq!(snap.chip_id, CHIP_ID_GEN_EXT);

        // Raw diagnostic access bypasses the mailbox.
        let raw = handle.raw_read(CHIP_ID_REG, 2).unwrap();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), CHIP_ID_GEN_EXT);
    }
}
