//! Over-voltage, over-temperature and over-current handling.
//!
//! Over-voltage and over-temperature terminate the session at once; there is
//! nothing to retry. Over-current first backs the input-current-limit vote
//! off one step, then polls a bounded number of times to absorb transients:
//! only a condition that both persists through the poll budget and shows
//! enough over-threshold current samples ends the session.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::registers::{ma_to_ua, StatusFlags, STATUS_REG};
use crate::supervisor::Supervisor;
use crate::types::{EndOfPowerReason, Notification};
use crate::votes::OCP_VOTER;

/// Poll iterations before a standing over-current condition is terminal.
pub(crate) const OVC_POLL_COUNT: usize = 3;
/// Delay between over-current polls.
pub(crate) const OVC_POLL_DELAY: Duration = Duration::from_millis(50);
/// Output-current sample level counted as over threshold, microamps.
pub(crate) const OVC_SAMPLE_THRESHOLD_UA: u32 = 1_400_000;
/// Minimum over-threshold samples for a terminal verdict.
pub(crate) const OVC_SAMPLE_LIMIT: usize = 1;
/// Effective-limit floor below which no backoff is applied, microamps.
pub(crate) const OVC_BACKOFF_FLOOR_UA: u32 = 900_000;
/// Backoff step, microamps.
pub(crate) const OVC_BACKOFF_STEP_UA: u32 = 100_000;

impl Supervisor {
    /// Entry point for dispatched limit-related interrupt bits.
    pub(crate) async fn handle_limit_flags(&mut self, flags: StatusFlags) {
        error!("protect: limit interrupt {flags:?}");

        if flags.contains(StatusFlags::OVER_VOLTAGE) {
            self.terminate_session(EndOfPowerReason::OverVoltage, Vec::new())
                .await;
            return;
        }
        if flags.contains(StatusFlags::OVER_TEMP) {
            self.terminate_session(EndOfPowerReason::OverTemperature, Vec::new())
                .await;
            return;
        }
        // Under-voltage on its own carries no action.
        if flags.contains(StatusFlags::UNDER_VOLTAGE) && !flags.contains(StatusFlags::OVER_CURRENT)
        {
            return;
        }

        // Over-current: one backoff step on the shared limit, then poll to
        // see whether the condition was transient.
        if let Some(dc_icl) = self.dc_icl.clone() {
            match dc_icl.effective() {
                Some(icl) if icl > OVC_BACKOFF_FLOOR_UA => {
                    let reduced = icl - OVC_BACKOFF_STEP_UA;
                    dc_icl.vote(OCP_VOTER, reduced);
                    warn!("protect: reduced input limit to {reduced} uA");
                }
                Some(_) => {}
                None => error!("protect: no effective input limit to reduce"),
            }
        }

        let mut samples_ua: Vec<u32> = Vec::with_capacity(OVC_POLL_COUNT);
        let mut over_count = 0usize;
        for _ in 0..OVC_POLL_COUNT {
            let cleared = self.clear_interrupts(flags & StatusFlags::LIMIT_MASK);
            sleep(OVC_POLL_DELAY).await;
            if let Err(e) = cleared {
                error!("protect: failed to clear limit bits: {e}");
                continue;
            }

            match self.chip.iout_ma(&self.io) {
                Ok(ma) => {
                    let ua = ma_to_ua(ma);
                    samples_ua.push(ua);
                    if ua > OVC_SAMPLE_THRESHOLD_UA {
                        over_count += 1;
                    }
                }
                Err(e) => {
                    error!("protect: failed to sample output current: {e}");
                    continue;
                }
            }

            let status = match self.io.read_u16(STATUS_REG) {
                Ok(raw) => StatusFlags::from_bits_truncate(raw),
                Err(e) => {
                    error!("protect: failed to re-read status: {e}");
                    continue;
                }
            };
            if !status.contains(StatusFlags::OVER_CURRENT) {
                info!(
                    "protect: over-current cleared, samples {:?} uA",
                    samples_ua
                );
                return;
            }
            warn!("protect: over-current still set, retrying");
        }

        if over_count < OVC_SAMPLE_LIMIT {
            info!(
                "protect: transient over-current, samples {:?} uA (over={over_count})",
                samples_ua
            );
            return;
        }

        self.terminate_session(EndOfPowerReason::OverCurrent, samples_ua)
            .await;
    }

    /// Send the end-of-power reason to the transmitter, then tear down.
    pub(crate) async fn terminate_session(
        &mut self,
        reason: EndOfPowerReason,
        samples_ua: Vec<u32>,
    ) {
        error!("protect: terminating session, reason {reason:?}");
        if let Err(e) = self.send_eop(reason) {
            error!("protect: failed to send end-of-power: {e}");
        }
        self.set_offline().await;
        self.notify(Notification::SessionEnded { reason, samples_ua });
    }
}
