//! Power-profile negotiation, FOD programming and the post-confirmation
//! mode recheck.
//!
//! The negotiated mode is resolved once per session and cached: test
//! override, forced BPP, the chip's reported operating mode, then a
//! voltage-threshold fallback. Early in a session the reported mode is not
//! reliable; boards that need it enable the post-confirmation recheck, which
//! re-derives the real profile from the negotiated-power register and the
//! output-voltage ramp and can demote the session to BPP.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bus::hex_str;
use crate::chip::Generation;
use crate::registers::{mv_to_uv, StatusFlags, EPP_Q_FACTOR_REG, FOD_REG, STATUS_REG};
use crate::supervisor::{Supervisor, DC_ICL_BPP_UA, DC_ICL_EPP_REDUCED_UA, DC_ICL_EPP_UA};
use crate::types::{ChargeMode, Error};

/// Output voltage above which the fallback mode detection assumes EPP.
pub(crate) const EPP_THRESHOLD_UV: u32 = 7_000_000;
/// FOD write attempts before giving up (non-fatal).
pub(crate) const FOD_WRITE_RETRIES: u32 = 3;
const FOD_RETRY_DELAY: Duration = Duration::from_millis(100);
/// BPP output voltage driven on demotion, mV.
pub(crate) const BPP_VOUT_MV: u32 = 5_000;
const BPP_VOUT_RETRIES: u32 = 10;
const BPP_VOUT_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Negotiated-power register value for a 10 W contract (half-watt units).
pub(crate) const NEG_POWER_10W: u8 = 20;
/// Negotiated-power register value for an 11 W contract.
pub(crate) const NEG_POWER_11W: u8 = 22;
const RECHECK_POLL_BUDGET: u32 = 10;
const RECHECK_POLL_DELAY: Duration = Duration::from_millis(50);

impl Supervisor {
    /// Whether this session runs the extended profile. Resolves and caches
    /// the mode on first use; the cache lives until teardown.
    pub(crate) fn is_epp(&mut self) -> bool {
        if let Some(mode) = self.mode {
            return mode == ChargeMode::Epp;
        }
        let mode = self.determine_mode();
        info!("mode: negotiated {mode}");
        self.mode = Some(mode);
        mode == ChargeMode::Epp
    }

    fn determine_mode(&mut self) -> ChargeMode {
        if self.cfg.force_epp_test {
            return ChargeMode::Epp;
        }
        if self.force_bpp {
            return ChargeMode::Bpp;
        }

        // The manufacturer code can read as zero right after power-up;
        // refresh it while we are here so later consumers see it.
        if self.mfg == 0 {
            match self.chip.tx_mfg_code(&self.io) {
                Ok(mfg) => {
                    self.mfg = mfg;
                    self.mfg_accepted = mfg == self.cfg.accepted_tx_mfg;
                }
                Err(e) => error!("mode: cannot read manufacturer code: {e}"),
            }
        }

        match self.chip.sys_mode(&self.io) {
            Ok(mode) => {
                return if mode.is_extended() {
                    ChargeMode::Epp
                } else {
                    ChargeMode::Bpp
                }
            }
            Err(e) => warn!("mode: could not read operating mode: {e}"),
        }

        match self.chip.vout_mv(&self.io) {
            Ok(mv) => {
                info!("mode: output voltage {mv} mV");
                if mv_to_uv(mv) > EPP_THRESHOLD_UV {
                    return ChargeMode::Epp;
                }
            }
            Err(e) => warn!("mode: could not read output voltage: {e}"),
        }

        ChargeMode::Bpp
    }

    /// Write the FOD table for the active profile and verify it byte for
    /// byte, with a bounded retry budget. Failure is logged, not fatal.
    pub(crate) async fn write_fod(&mut self) {
        let epp = self.is_epp();
        let table = if epp && !self.cfg.fod_epp.is_empty() {
            self.cfg.fod_epp.clone()
        } else if !self.cfg.fod_bpp.is_empty() {
            self.cfg.fod_bpp.clone()
        } else {
            warn!(
                "fod: no table configured (bpp={}, epp={})",
                self.cfg.fod_bpp.len(),
                self.cfg.fod_epp.len()
            );
            return;
        };

        for attempt in 1..=FOD_WRITE_RETRIES {
            info!(
                "fod: writing {} table (n={}, try {attempt})",
                if epp { "epp" } else { "bpp" },
                table.len()
            );
            if let Err(e) = self.io.write_n(FOD_REG, &table) {
                error!("fod: write failed: {e}");
                return;
            }
            let mut readback = vec![0u8; table.len()];
            if let Err(e) = self.io.read_n(FOD_REG, &mut readback) {
                error!("fod: read-back failed: {e}");
                return;
            }
            if readback == table {
                return;
            }
            error!("fod: verify mismatch, read: {}", hex_str(&readback));
            sleep(FOD_RETRY_DELAY).await;
        }
        warn!("fod: table not verified after {FOD_WRITE_RETRIES} attempts");
    }

    /// Drive the output voltage down to the BPP level, verifying the
    /// setpoint with a bounded retry budget.
    pub(crate) async fn force_bpp_vout(&mut self) -> Result<(), Error> {
        for _ in 0..BPP_VOUT_RETRIES {
            self.chip.set_vout_mv(&self.io, BPP_VOUT_MV)?;
            if self.chip.vout_set_mv(&self.io)? == BPP_VOUT_MV {
                return Ok(());
            }
            sleep(BPP_VOUT_RETRY_DELAY).await;
        }
        Err(Error::Timeout("bpp voltage force"))
    }

    /// One recheck probe. `Ok(true)` means decided, `Ok(false)` means the
    /// voltage ramp is still pending and the probe should run again.
    fn recheck_step(&mut self) -> Result<bool, Error> {
        let np = self.chip.negotiated_power(&self.io)?;
        if np >= NEG_POWER_10W {
            // Real EPP unless this transmitter is on the quirk list.
            let mfg = self.chip.tx_mfg_code(&self.io)?;
            self.force_bpp = self.cfg.bpp_quirk_tx_codes.contains(&mfg);
            info!(
                "mode: recheck np={np:#04x} mfg={mfg:#06x} force_bpp={}",
                self.force_bpp
            );
            return Ok(true);
        }

        // BPP output voltage settles much earlier than EPP; no voltage yet
        // means the contract is still forming.
        let status = StatusFlags::from_bits_truncate(self.io.read_u16(STATUS_REG)?);
        if !status.contains(StatusFlags::VOUT_ON) {
            return Ok(false);
        }

        self.force_bpp = true;
        info!("mode: recheck np={np:#04x}, standard bpp or low-power epp");
        Ok(true)
    }

    /// Field workaround: immediately after confirming presence, re-derive
    /// the actual profile with a short bounded poll, demoting to BPP (and
    /// driving the voltage down) when the early reported mode was wrong.
    pub(crate) async fn recheck_mode_after_confirm(&mut self) {
        let mut decided = false;
        for _ in 0..RECHECK_POLL_BUDGET {
            match self.recheck_step() {
                Ok(true) => {
                    decided = true;
                    break;
                }
                Ok(false) => sleep(RECHECK_POLL_DELAY).await,
                Err(e) => {
                    error!("mode: recheck failed: {e}");
                    return;
                }
            }
        }
        if !decided {
            warn!("mode: recheck undecided, keeping reported mode");
            return;
        }
        if self.force_bpp {
            self.mode = Some(ChargeMode::Bpp);
            if let Err(e) = self.force_bpp_vout().await {
                error!("mode: cannot drive output voltage down: {e}");
            }
        }
    }

    /// Pick the EPP session current from the negotiated power contract.
    pub(crate) fn check_epp_negotiated_current(&mut self) {
        self.epp_neg_icl_ua = DC_ICL_EPP_UA;
        if self.chip.generation() < Generation::Rtx || !self.is_epp() {
            return;
        }
        if self.mfg_accepted {
            self.epp_neg_icl_ua = DC_ICL_EPP_REDUCED_UA;
            info!(
                "icl: recognized transmitter, using {} uA",
                self.epp_neg_icl_ua
            );
            return;
        }
        match self.chip.negotiated_power(&self.io) {
            Err(e) => error!("icl: could not read negotiated power: {e}"),
            Ok(np) if np < NEG_POWER_10W => {
                // Output voltage stays at 5 V below 10 W.
                self.epp_neg_icl_ua = DC_ICL_BPP_UA;
                info!("icl: epp under 10 W, using bpp limit (np={np:#04x})");
            }
            Ok(np) if np < NEG_POWER_11W => {
                self.epp_neg_icl_ua = DC_ICL_EPP_REDUCED_UA;
                info!("icl: using {} uA (np={np:#04x})", self.epp_neg_icl_ua);
            }
            Ok(_) => {}
        }
    }

    /// Write the board's EPP calibration values at confirmation; both are
    /// optional and failures are logged only.
    pub(crate) fn apply_board_calibration(&mut self) {
        if let Some(q) = self.cfg.epp_q_factor {
            if let Err(e) = self.io.write_u8(EPP_Q_FACTOR_REG, q) {
                error!("mode: cannot write q factor {q}: {e}");
            }
        }
        if let Some(p) = self.cfg.epp_renegotiate_power {
            if let Err(e) = self.chip.renegotiate_power(&self.io, p) {
                warn!("mode: power renegotiation unavailable: {e}");
            }
        }
    }
}
