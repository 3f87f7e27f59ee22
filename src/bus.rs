//! Raw access to an i2c-dev bus node.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::err::{Error, Result};

/// i2c-dev control selector binding an fd to a 7-bit slave address.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Attempts granted to resilient operations.
const RETRY_BUDGET: u32 = 5;

/// Transport under [`I2cBus`]: a character device in production, a
/// simulated monitor in tests, or some other platform's DDC channel.
pub trait RawBus {
    fn bind(&mut self, addr: u16) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A `/dev/i2c-N` device node.
pub struct DevI2c {
    file: File,
}

impl DevI2c {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl RawBus for DevI2c {
    fn bind(&mut self, addr: u16) -> io::Result<()> {
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE as _, addr as libc::c_ulong)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
}

/// One bus node bound to one slave address.
pub struct I2cBus {
    raw: Box<dyn RawBus>,
    name: String,
    addr: u16,
}

impl I2cBus {
    pub fn open(path: &Path, addr: u16) -> Result<Self> {
        let name = path.display().to_string();
        let raw = DevI2c::open(path).map_err(|source| Error::Bus {
            bus: name.clone(),
            source,
        })?;
        Self::from_raw(Box::new(raw), name, addr)
    }

    /// Bind an arbitrary transport.  Entry point for tests and for
    /// platforms whose DDC channel is not an i2c-dev node.
    pub fn from_raw(mut raw: Box<dyn RawBus>, name: String, addr: u16) -> Result<Self> {
        raw.bind(addr).map_err(|source| Error::Bus {
            bus: name.clone(),
            source,
        })?;
        Ok(Self { raw, name, addr })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Single-attempt read.
    pub fn read_strict(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.raw.read(buf).map_err(|e| self.fail(e))?;
        self.log_read(&buf[..n]);
        Ok(n)
    }

    /// Read with the retry budget; monitors NAK transiently all the time.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.raw.read(buf) {
                Ok(n) => {
                    if attempt >= 2 {
                        debug!("{}: read succeeded on attempt {attempt}", self.name);
                    }
                    self.log_read(&buf[..n]);
                    return Ok(n);
                }
                Err(e) => {
                    if attempt >= RETRY_BUDGET || !transient(&e) {
                        return Err(self.fail(e));
                    }
                }
            }
        }
    }

    /// Write with the retry budget.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        debug!("{} {:#04x}: write {}", self.name, self.addr, hex(buf));
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.raw.write(buf) {
                Ok(n) => {
                    if attempt >= 2 {
                        debug!("{}: write succeeded on attempt {attempt}", self.name);
                    }
                    return Ok(n);
                }
                Err(e) => {
                    if attempt >= RETRY_BUDGET || !transient(&e) {
                        return Err(self.fail(e));
                    }
                }
            }
        }
    }

    /// Estimate this bus's read cost by timing a 1 and a 20 byte read and
    /// solving for the per-byte and the fixed share.
    pub fn measure(&mut self) -> Result<BusTiming> {
        let t1 = self.time_read(1)?;
        let t20 = self.time_read(20)?;
        let per_byte = t20.saturating_sub(t1) / 19;
        let fixed = t1.saturating_sub(per_byte);
        let slow = per_byte > Duration::from_micros(230) || fixed > Duration::from_micros(500);
        if slow {
            warn!("{}: slow bus, {per_byte:?}/byte plus {fixed:?}", self.name);
        }
        Ok(BusTiming {
            per_byte,
            fixed,
            slow,
        })
    }

    fn time_read(&mut self, n: usize) -> Result<Duration> {
        let mut buf = vec![0u8; n];
        let start = Instant::now();
        self.read(&mut buf)?;
        Ok(start.elapsed())
    }

    fn log_read(&self, bytes: &[u8]) {
        if bytes.len() <= 20 {
            debug!("{} {:#04x}: read {}", self.name, self.addr, hex(bytes));
        } else {
            debug!("{} {:#04x}: read {} bytes", self.name, self.addr, bytes.len());
        }
    }

    fn fail(&self, source: io::Error) -> Error {
        Error::Bus {
            bus: self.name.clone(),
            source,
        }
    }
}

/// Read cost of a bus, from [`I2cBus::measure`].
#[derive(Debug, Clone, Copy)]
pub struct BusTiming {
    pub per_byte: Duration,
    pub fixed: Duration,
    /// Notably slower than a healthy DDC bus.
    pub slow: bool,
}

fn transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EAGAIN | libc::EIO | libc::EREMOTEIO | libc::ETIMEDOUT | libc::ENXIO)
    )
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(out, "{b:02x} ");
    }
    out.pop();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Flaky {
        failures: u32,
        reads: VecDeque<Vec<u8>>,
    }

    impl RawBus for Flaky {
        fn bind(&mut self, _addr: u16) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from_raw_os_error(libc::EREMOTEIO));
            }
            let chunk = self.reads.pop_front().unwrap_or_default();
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from_raw_os_error(libc::EREMOTEIO));
            }
            Ok(buf.len())
        }
    }

    fn bus(failures: u32, reads: Vec<Vec<u8>>) -> I2cBus {
        I2cBus::from_raw(
            Box::new(Flaky {
                failures,
                reads: reads.into(),
            }),
            "flaky".into(),
            0x37,
        )
        .unwrap()
    }

    #[test]
    fn resilient_read_retries_transient_errors() {
        let mut bus = bus(4, vec![vec![0x6e, 0x80, 0xbe]]);
        let mut buf = [0u8; 3];
        assert_eq!(bus.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [0x6e, 0x80, 0xbe]);
    }

    #[test]
    fn resilient_read_gives_up_after_budget() {
        let mut bus = bus(5, vec![vec![0x6e]]);
        let mut buf = [0u8; 1];
        match bus.read(&mut buf) {
            Err(Error::Bus { bus, .. }) => assert_eq!(bus, "flaky"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn measure_solves_for_read_costs() {
        let mut bus = bus(0, vec![vec![0u8; 1], vec![0u8; 20]]);
        let timing = bus.measure().unwrap();
        assert!(!timing.slow);
        assert!(timing.per_byte < Duration::from_micros(230));
    }

    #[test]
    fn strict_read_does_not_retry() {
        let mut bus = bus(1, vec![vec![0x6e]]);
        let mut buf = [0u8; 1];
        assert!(bus.read_strict(&mut buf).is_err());
    }
}
