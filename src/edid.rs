//! EDID probing and the monitor identity derived from it.

use core::fmt;

use bit_field::BitField;
use log::debug;

use crate::bus::I2cBus;
use crate::err::{Error, Result};

const HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

/// Bytes requested from the EEPROM.  Its read pointer is wherever the last
/// reader left it, so twice the image guarantees a full copy somewhere in
/// the haystack.
const PROBE_LEN: usize = 512;

/// Stable monitor identifier: the three manufacturer letters followed by
/// the hex of product code, serial number and manufacturing week/year.
/// Also names the monitor's delay-calibration file.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MonitorId(String);

impl MonitorId {
    pub fn from_edid(edid: &[u8; 256]) -> Self {
        let code = u16::from_be_bytes([edid[8], edid[9]]);
        let mut id = String::with_capacity(17);
        for range in [10..15, 5..10, 0..5] {
            id.push((b'A' - 1 + code.get_bits(range) as u8) as char);
        }
        for b in &edid[10..17] {
            id.push_str(&format!("{b:02X}"));
        }
        MonitorId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MonitorId({})", self.0)
    }
}

/// Read the 256-byte EDID image from the EEPROM behind `bus`.
///
/// The wire gives us a window starting at an arbitrary EEPROM offset; the
/// image is located by its header.  Monitors with a 128-byte EDID repeat
/// it across the window, so a short tail simply completes the image with
/// the last bytes read.
pub fn read_edid(bus: &mut I2cBus) -> Result<[u8; 256]> {
    let mut window = vec![0u8; PROBE_LEN];
    let n = bus.read(&mut window)?;
    window.truncate(n);
    let start = window
        .windows(HEADER.len())
        .position(|w| w == HEADER)
        .ok_or_else(|| Error::NoEdid(bus.name().to_string()))?;
    let avail = window.len() - start;
    let mut image = [0u8; 256];
    if avail >= 256 {
        image.copy_from_slice(&window[start..start + 256]);
    } else if avail >= 128 {
        debug!("{}: short EDID window, padding with the tail", bus.name());
        image[..avail].copy_from_slice(&window[start..]);
        let tail = &window[window.len() - (256 - avail)..];
        image[avail..].copy_from_slice(tail);
    } else {
        return Err(Error::NoEdid(bus.name().to_string()));
    }
    debug!("{}: EDID of {}", bus.name(), MonitorId::from_edid(&image));
    Ok(image)
}
