//! Pacing between bus operations.
//!
//! DDC/CI monitors tolerate no back-to-back traffic: after a write they
//! need settle time before the reply is readable, and writes arriving too
//! fast get dropped on the floor.  The waiter tracks the last operation
//! and refuses the next one until the delay for that succession has
//! passed.

use core::time::Duration;
use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use tokio::time::Instant;

use crate::ddc::Op;
use crate::err::{Error, Result};

/// Conservative delay used before calibration and for diagnostics.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(200);

/// Capability fragments take the monitor notably longer to serve.
const CAPABILITIES_EXTRA: Duration = Duration::from_millis(50);

/// Operation kind, as the delay matrix sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

pub struct Waiter {
    last: Option<(OpKind, Instant)>,
    read_delay: Duration,
    write_delay: Duration,
}

impl Waiter {
    pub fn new(read_delay: Duration, write_delay: Duration) -> Self {
        Self {
            last: None,
            read_delay,
            write_delay,
        }
    }

    pub fn delays(&self) -> (Duration, Duration) {
        (self.read_delay, self.write_delay)
    }

    pub fn set_delays(&mut self, read: Duration, write: Duration) {
        self.read_delay = read;
        self.write_delay = write;
    }

    /// Gate one bus operation.  On success the caller must perform the
    /// operation immediately; on [`Error::WouldBlock`] it retries after
    /// the returned duration.
    pub fn prepare(&mut self, kind: OpKind, hint: Option<Op>) -> Result<()> {
        let now = Instant::now();
        if let Some((last_kind, last_when)) = self.last {
            let mut delay = match (last_kind, kind) {
                (OpKind::Read, OpKind::Read) => Duration::ZERO,
                (OpKind::Write, OpKind::Read) => self.read_delay,
                (OpKind::Write, OpKind::Write) => self.write_delay,
                (OpKind::Read, OpKind::Write) => self.read_delay.max(self.write_delay),
            };
            if hint == Some(Op::CapabilitiesReply) {
                delay += CAPABILITIES_EXTRA;
            }
            let due = last_when + delay;
            if now < due {
                return Err(Error::WouldBlock(due - now));
            }
        }
        self.last = Some((kind, now));
        Ok(())
    }
}

/// Scoped delay override; the previous delays come back when the guard is
/// dropped, whichever way the scope is left.
pub struct DelayGuard {
    waiter: Rc<RefCell<Waiter>>,
    saved: (Duration, Duration),
}

impl DelayGuard {
    pub fn new(waiter: &Rc<RefCell<Waiter>>, read: Duration, write: Duration) -> Self {
        let saved = waiter.borrow().delays();
        debug!("delays {read:?}/{write:?} (was {saved:?})");
        waiter.borrow_mut().set_delays(read, write);
        Self {
            waiter: waiter.clone(),
            saved,
        }
    }

    /// Override with delays every monitor tolerates.
    pub fn safe(waiter: &Rc<RefCell<Waiter>>) -> Self {
        Self::new(waiter, DEFAULT_DELAY, DEFAULT_DELAY)
    }
}

impl Drop for DelayGuard {
    fn drop(&mut self) {
        self.waiter.borrow_mut().set_delays(self.saved.0, self.saved.1);
    }
}
