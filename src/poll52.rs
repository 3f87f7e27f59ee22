//! External-change detection via the "new control value" register.
//!
//! Register 0x52 names the register behind the most recent front-panel
//! change, or 0.  Some monitors clear the report by themselves, some latch
//! it until 0x01 is written to register 0x02; two determinators learn
//! which kind this one is, and whether it answers 0x52 at all.

use core::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::ddc::{VCP_NEW_CONTROL_VALUE, VCP_RESET_NEW_CONTROL};
use crate::determ::Determinator;
use crate::err::Error;
use crate::mccs::VcpReply;
use crate::setting::{Priority, Task};

const POLL_PAUSE: Duration = Duration::from_secs(1);

pub(crate) struct ChangePoller {
    next_check: Instant,
    /// Non-zero report we left unreset, to see whether it comes back.
    awaiting_echo: Option<u16>,
    reset_pending: bool,
    supports: Determinator,
    needs_reset: Determinator,
}

impl ChangePoller {
    pub(crate) fn new() -> Self {
        Self {
            next_check: Instant::now(),
            awaiting_echo: None,
            reset_pending: false,
            supports: Determinator::new(true, 1, 3),
            needs_reset: Determinator::new(false, 4, 1),
        }
    }

    /// The task this poller wants to run, when one is due.
    pub(crate) fn candidate(
        &self,
        now: Instant,
        prep: Option<u8>,
        position: usize,
    ) -> Option<(Priority, Task)> {
        if !self.supports.value() {
            return None;
        }
        if self.reset_pending {
            return Some((
                Priority::new(1, false, false, position),
                Task::Write {
                    vcp: VCP_RESET_NEW_CONTROL,
                    value: 1,
                },
            ));
        }
        if now >= self.next_check {
            return Some((
                Priority::new(0, false, prep == Some(VCP_NEW_CONTROL_VALUE), position),
                Task::Read {
                    vcp: VCP_NEW_CONTROL_VALUE,
                },
            ));
        }
        None
    }

    /// How long until the next poll is due; `None` when polling is off.
    pub(crate) fn next_due(&self, now: Instant) -> Option<Duration> {
        if !self.supports.value() || self.reset_pending {
            return None;
        }
        Some(self.next_check.saturating_duration_since(now))
    }

    pub(crate) fn reset_acked(&mut self) {
        self.reset_pending = false;
    }

    /// Digest a 0x52 reply; returns the register to refresh, if any.
    pub(crate) fn read_acked(&mut self, reply: VcpReply, now: Instant) -> Option<u8> {
        self.supports.observe(true);
        self.next_check = now + POLL_PAUSE;
        let value = reply.value;
        let mut echoed = false;
        if let Some(previous) = self.awaiting_echo.take() {
            echoed = value != 0 && value == previous;
            self.needs_reset.observe(echoed);
            if self.needs_reset.locked() {
                info!(
                    "change reports are {}",
                    if self.needs_reset.value() {
                        "latched, resetting from now on"
                    } else {
                        "self-clearing"
                    }
                );
            }
        }
        if value == 0 {
            return None;
        }
        if self.needs_reset.value() || echoed {
            self.reset_pending = true;
        } else {
            self.awaiting_echo = Some(value);
        }
        if echoed {
            // stale repeat of a report we already acted on
            return None;
        }
        if value > u8::MAX as u16 {
            warn!("change report names a register out of range: {value:#06x}");
            return None;
        }
        debug!("front-panel change on VCP {value:#04x}");
        Some(value as u8)
    }

    /// Digest a failed 0x52 read.
    pub(crate) fn read_nacked(&mut self, err: &Error, now: Instant) {
        if matches!(err, Error::Unsupported(_)) {
            self.supports.observe(false);
            if self.supports.locked() && !self.supports.value() {
                info!("monitor does not answer change reports, polling stopped");
            }
        } else {
            debug!("change poll failed: {err}");
        }
        self.next_check = now + POLL_PAUSE;
    }
}
