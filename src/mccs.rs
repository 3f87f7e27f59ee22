//! The MCCS request layer: VCP reads and writes, capability strings, and
//! the read-preparation cache that keeps request/reply pairs matched up.

use core::time::Duration;
use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use crate::bus::I2cBus;
use crate::ddc::{self, Op, VCP_BRIGHTNESS, VCP_NEW_CONTROL_VALUE};
use crate::err::{Error, Result};
use crate::frame::{FrameReader, Hint};
use crate::waiter::{DelayGuard, OpKind, Waiter};

/// Outcome of a VCP read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpReply {
    pub value: u16,
    pub max: u16,
    /// 0 = set parameter, 1 = momentary; anything else is off-standard.
    pub kind: u8,
}

#[derive(Default)]
struct CapsRead {
    acc: Vec<u8>,
    submitted: bool,
}

/// One monitor's request pipeline.  All primitives are non-blocking: they
/// either finish, or return [`Error::WouldBlock`] to be retried, in which
/// case their progress (the read preparation, a partially accumulated
/// capabilities string) is kept.
pub struct Mccs {
    bus: I2cBus,
    reader: FrameReader,
    waiter: Rc<RefCell<Waiter>>,
    prep: Option<u8>,
    caps: Option<CapsRead>,
}

impl Mccs {
    pub fn new(bus: I2cBus, read_delay: Duration, write_delay: Duration) -> Self {
        Self {
            bus,
            reader: FrameReader::new(),
            waiter: Rc::new(RefCell::new(Waiter::new(read_delay, write_delay))),
            prep: None,
            caps: None,
        }
    }

    pub(crate) fn waiter(&self) -> &Rc<RefCell<Waiter>> {
        &self.waiter
    }

    /// The VCP register a READ has been submitted for, while its reply is
    /// still outstanding.
    pub fn preparation(&self) -> Option<u8> {
        self.prep
    }

    /// Scoped delay override, restored when the guard drops.
    pub fn set_delay(&self, read: Duration, write: Duration) -> DelayGuard {
        DelayGuard::new(&self.waiter, read, write)
    }

    /// Scoped override with delays every monitor tolerates.
    pub fn safe_delay(&self) -> DelayGuard {
        DelayGuard::safe(&self.waiter)
    }

    fn submit(&mut self, op: Op, args: &[u8]) -> Result<()> {
        self.waiter.borrow_mut().prepare(OpKind::Write, Some(op))?;
        self.bus.write(&ddc::encode(op, args))?;
        Ok(())
    }

    fn expect(&mut self, want: Op) -> Result<Vec<u8>> {
        self.waiter.borrow_mut().prepare(OpKind::Read, Some(want))?;
        self.reader.find_next(&mut self.bus, Hint::Reply(want))
    }

    /// Anything but flow control invalidates the read preparation.
    fn fail<T>(&mut self, e: Error) -> Result<T> {
        if !matches!(e, Error::WouldBlock(_)) {
            self.prep = None;
        }
        Err(e)
    }

    /// Non-blocking VCP read.  The first call submits the READ and records
    /// it as the preparation; once the preparation matches, calls go
    /// straight to collecting the reply.
    pub fn try_read_vcp(&mut self, vcp: u8) -> Result<VcpReply> {
        if self.prep != Some(vcp) {
            match self.submit(Op::Read, &[vcp]) {
                Ok(()) => self.prep = Some(vcp),
                Err(e) => return self.fail(e),
            }
        }
        let payload = match self.expect(Op::ReadReply) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        self.prep = None;
        parse_read_reply(vcp, &payload)
    }

    /// Non-blocking VCP write.
    pub fn try_write_vcp(&mut self, vcp: u8, value: u16) -> Result<()> {
        let v = value.to_be_bytes();
        match self.submit(Op::Write, &[vcp, v[0], v[1]]) {
            Ok(()) => {
                self.prep = None;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Ask the monitor to persist its current settings.
    pub fn try_save(&mut self) -> Result<()> {
        match self.submit(Op::Save, &[]) {
            Ok(()) => {
                self.prep = None;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Non-blocking capabilities read.  Fragments accumulate across calls
    /// until the monitor answers the current offset with an empty one.
    pub fn try_read_capabilities(&mut self) -> Result<Vec<u8>> {
        let mut caps = self.caps.take().unwrap_or_default();
        loop {
            if !caps.submitted {
                let offset = (caps.acc.len() as u16).to_be_bytes();
                match self.submit(Op::Capabilities, &offset) {
                    Ok(()) => caps.submitted = true,
                    Err(e) => {
                        if matches!(e, Error::WouldBlock(_)) {
                            self.caps = Some(caps);
                        }
                        return self.fail(e);
                    }
                }
            }
            let payload = match self.expect(Op::CapabilitiesReply) {
                Ok(p) => p,
                Err(e) => {
                    if matches!(e, Error::WouldBlock(_)) {
                        self.caps = Some(caps);
                    }
                    return self.fail(e);
                }
            };
            caps.submitted = false;
            if let Err(e) = expect_opcode(Op::CapabilitiesReply, &payload) {
                return self.fail(e);
            }
            if payload.len() < 3 {
                return self.fail(Error::InvalidFrame("short capabilities reply"));
            }
            let offset = u16::from_be_bytes([payload[1], payload[2]]) as usize;
            let fragment = &payload[3..];
            if offset > caps.acc.len() {
                return self.fail(Error::OutOfSync {
                    want: caps.acc.len() as u16,
                    got: offset as u16,
                });
            }
            if offset < caps.acc.len() {
                debug!("capabilities overlap at {offset}, newer bytes win");
                caps.acc.truncate(offset);
            }
            if fragment.is_empty() {
                debug!("capabilities complete, {} bytes", caps.acc.len());
                return Ok(caps.acc);
            }
            caps.acc.extend_from_slice(fragment);
        }
    }

    pub async fn read_vcp(&mut self, vcp: u8) -> Result<VcpReply> {
        drive(|| self.try_read_vcp(vcp)).await
    }

    pub async fn write_vcp(&mut self, vcp: u8, value: u16) -> Result<()> {
        drive(|| self.try_write_vcp(vcp, value)).await
    }

    pub async fn read_capabilities(&mut self) -> Result<Vec<u8>> {
        drive(|| self.try_read_capabilities()).await
    }

    pub async fn save(&mut self) -> Result<()> {
        drive(|| self.try_save()).await
    }

    /// Request a timing report and hand back the raw reply bytes.  The
    /// reply frame predates MCCS framing, so it bypasses the scanner;
    /// diagnostics only.
    pub async fn timing_report(&mut self) -> Result<Vec<u8>> {
        drive(|| self.submit(Op::TimingRequest, &[])).await?;
        self.prep = None;
        drive(|| {
            self.waiter.borrow_mut().prepare(OpKind::Read, None)?;
            let mut buf = [0u8; 9];
            let n = self.bus.read(&mut buf)?;
            Ok(buf[..n].to_vec())
        })
        .await
    }

    /// Current and maximal brightness.
    pub async fn brightness(&mut self) -> Result<VcpReply> {
        self.read_vcp(VCP_BRIGHTNESS).await
    }

    pub async fn set_brightness(&mut self, value: u16) -> Result<()> {
        self.write_vcp(VCP_BRIGHTNESS, value).await
    }
}

fn parse_read_reply(vcp: u8, payload: &[u8]) -> Result<VcpReply> {
    expect_opcode(Op::ReadReply, payload)?;
    if payload.len() != 8 {
        return Err(Error::InvalidFrame("odd VCP reply length"));
    }
    if payload[1] != 0 {
        return Err(Error::Unsupported(vcp));
    }
    if payload[2] != vcp {
        return Err(Error::OutOfSync {
            want: vcp as u16,
            got: payload[2] as u16,
        });
    }
    let kind = payload[3];
    if kind > 1 {
        warn!("VCP {vcp:#04x}: reply type {kind:#04x} out of range");
    } else if kind != 0 && vcp != VCP_NEW_CONTROL_VALUE {
        warn!("VCP {vcp:#04x}: momentary type on a settings register");
    }
    Ok(VcpReply {
        value: u16::from_be_bytes([payload[6], payload[7]]),
        max: u16::from_be_bytes([payload[4], payload[5]]),
        kind,
    })
}

fn expect_opcode(want: Op, payload: &[u8]) -> Result<()> {
    match payload.first().copied().map(Op::from_opcode) {
        Some(Some(op)) if op == want => Ok(()),
        Some(Some(op)) => Err(Error::UnexpectedOpcode { want, got: op }),
        Some(None) => Err(Error::UnknownOpcode(payload[0])),
        None => Err(Error::InvalidFrame("empty payload")),
    }
}

/// Drive a non-blocking operation to completion, sleeping through
/// [`Error::WouldBlock`].
pub async fn drive<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match op() {
            Err(Error::WouldBlock(d)) => tokio::time::sleep(d).await,
            other => return other,
        }
    }
}
