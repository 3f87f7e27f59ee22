//! Locating DDC/CI frames in the inbound byte stream.
//!
//! Monitors prepend garbage, serve replies in slices, and keep stale
//! bytes around, so inbound data goes through a persistent per-monitor
//! buffer that is scanned for the next structurally valid frame and
//! refilled from the bus on demand.

use log::debug;

use crate::bus::I2cBus;
use crate::ddc::{self, Op, DDC_MAX_LEN, MONITOR_SOURCE, READ_XOR};
use crate::determ::Determinator;
use crate::err::{Error, Result};

/// What the caller expects to arrive, which sizes the refill requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    /// Diagnostics: request exactly this many bytes, single attempt.
    Raw(usize),
    /// Expect this reply; request its maximal frame length.
    Reply(Op),
    /// Nothing specific: size for the common case, a VCP read reply.
    Common,
}

impl Hint {
    fn frame_len(self) -> usize {
        match self {
            Hint::Raw(n) => n,
            Hint::Reply(op) => op.ddc_len(),
            Hint::Common => Op::ReadReply.ddc_len(),
        }
    }
}

/// Slack requested beyond the expected frame, riding out leading noise.
const NOISE_SLACK: usize = 5;
/// Refills allowed per [`FrameReader::find_next`] call.
const REFILL_BUDGET: u8 = 2;

enum Scan {
    /// A valid frame; this is its MCCS payload, opcode included.
    Found(Vec<u8>),
    /// A frame start sits at the buffer front with `missing` bytes absent.
    Partial { missing: usize },
    /// Nothing frame-like left in the buffer.
    Empty,
}

#[derive(Default)]
struct ScanStats {
    skipped: bool,
    checksum_mismatch: bool,
}

pub struct FrameReader {
    buf: Vec<u8>,
    chopped: Determinator,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            chopped: Determinator::new(true, 1, 2),
        }
    }

    /// Scan for the next valid frame, refilling from the bus as needed,
    /// and return its MCCS payload.  Leftover bytes stay buffered for the
    /// next call.
    pub fn find_next(&mut self, bus: &mut I2cBus, hint: Hint) -> Result<Vec<u8>> {
        let mut refills = 0u8;
        let mut partial_after_first = false;
        loop {
            let (scan, stats) = self.scan(hint);
            if refills == REFILL_BUDGET {
                // The second refill settles the chopped-read question.
                if stats.skipped || stats.checksum_mismatch {
                    self.chopped.observe(false);
                } else if partial_after_first && matches!(&scan, Scan::Found(_)) {
                    self.chopped.observe(true);
                }
            }
            match scan {
                Scan::Found(payload) => return Ok(payload),
                Scan::Partial { missing } => {
                    if refills >= REFILL_BUDGET {
                        return Err(Error::NoMessage);
                    }
                    if refills == 1 {
                        partial_after_first = true;
                    }
                    self.refill(bus, hint, Some(missing))?;
                    refills += 1;
                }
                Scan::Empty => {
                    if refills >= REFILL_BUDGET {
                        return Err(Error::NoMessage);
                    }
                    self.refill(bus, hint, None)?;
                    refills += 1;
                }
            }
        }
    }

    fn scan(&mut self, hint: Hint) -> (Scan, ScanStats) {
        let mut stats = ScanStats::default();
        loop {
            match self.buf.iter().position(|&b| b == MONITOR_SOURCE) {
                None => {
                    if !self.buf.is_empty() {
                        debug!("dropping {} bytes of noise", self.buf.len());
                        stats.skipped = true;
                        self.buf.clear();
                    }
                    return (Scan::Empty, stats);
                }
                Some(0) => {}
                Some(n) => {
                    debug!("skipping {n} bytes to a frame start");
                    stats.skipped = true;
                    self.buf.drain(..n);
                }
            }
            if self.buf.len() < 2 {
                return (Scan::Partial { missing: 2 - self.buf.len() }, stats);
            }
            let length_byte = self.buf[1];
            if length_byte & 0x80 == 0 {
                debug!("length byte {length_byte:#04x} without its top bit, skipping 1");
                stats.skipped = true;
                self.buf.drain(..1);
                continue;
            }
            let payload_len = (length_byte & 0x7f) as usize;
            let total = payload_len + 3;
            if total > DDC_MAX_LEN {
                debug!("oversized frame ({total} bytes), skipping 1");
                stats.skipped = true;
                self.buf.drain(..1);
                continue;
            }
            if self.buf.len() < total {
                return (
                    Scan::Partial {
                        missing: total - self.buf.len(),
                    },
                    stats,
                );
            }
            if ddc::xor(&self.buf[..total]) != READ_XOR {
                debug!("checksum mismatch, skipping 2");
                stats.checksum_mismatch = true;
                self.buf.drain(..2);
                continue;
            }
            if payload_len == 0 {
                // Null message: the monitor explicitly has nothing to say.
                debug!("null message");
                self.buf.drain(..total);
                continue;
            }
            let opcode = self.buf[2];
            let Some(op) = Op::from_opcode(opcode) else {
                debug!("unknown opcode {opcode:#04x}, skipping 2");
                stats.skipped = true;
                self.buf.drain(..2);
                continue;
            };
            if let Hint::Reply(want) = hint {
                if op != want {
                    debug!("dropping whole {op:?} frame while waiting for {want:?}");
                    self.buf.drain(..total);
                    continue;
                }
            }
            let payload = self.buf[2..2 + payload_len].to_vec();
            self.buf.drain(..total);
            return (Scan::Found(payload), stats);
        }
    }

    fn refill(&mut self, bus: &mut I2cBus, hint: Hint, missing: Option<usize>) -> Result<()> {
        let (amount, strict) = match (hint, missing) {
            (Hint::Raw(n), _) => (n, true),
            (_, Some(m)) if self.chopped.value() => (m, false),
            _ => (hint.frame_len() + NOISE_SLACK, false),
        };
        let mut chunk = vec![0u8; amount];
        let n = if strict {
            bus.read_strict(&mut chunk)?
        } else {
            bus.read(&mut chunk)?
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RawBus;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    /// Serves a script of canned read results and records request sizes.
    #[derive(Default)]
    struct ScriptState {
        reads: VecDeque<Vec<u8>>,
        requested: Vec<usize>,
    }

    struct Script(Rc<RefCell<ScriptState>>);

    impl RawBus for Script {
        fn bind(&mut self, _addr: u16) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            state.requested.push(buf.len());
            let chunk = state.reads.pop_front().unwrap_or_default();
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }

        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn script(reads: Vec<Vec<u8>>) -> (I2cBus, Rc<RefCell<ScriptState>>) {
        let state = Rc::new(RefCell::new(ScriptState {
            reads: reads.into(),
            requested: Vec::new(),
        }));
        let bus = I2cBus::from_raw(Box::new(Script(state.clone())), "script".into(), 0x37)
            .unwrap();
        (bus, state)
    }

    fn monitor_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![MONITOR_SOURCE, payload.len() as u8 | 0x80];
        frame.extend_from_slice(payload);
        frame.push(READ_XOR ^ ddc::xor(&frame));
        frame
    }

    fn read_reply(vcp: u8, max: u16, value: u16) -> Vec<u8> {
        let mx = max.to_be_bytes();
        let v = value.to_be_bytes();
        monitor_frame(&[0x02, 0x00, vcp, 0x00, mx[0], mx[1], v[0], v[1]])
    }

    #[test]
    fn finds_frame_behind_noise() {
        let mut noisy = vec![0x00, 0xff, 0x13];
        noisy.extend(read_reply(0x10, 100, 50));
        let (mut bus, _) = script(vec![noisy]);
        let payload = FrameReader::new()
            .find_next(&mut bus, Hint::Reply(Op::ReadReply))
            .unwrap();
        assert_eq!(payload, [0x02, 0x00, 0x10, 0x00, 0x00, 0x64, 0x00, 0x32]);
    }

    #[test]
    fn null_message_is_skipped() {
        let mut bytes = vec![0x6e, 0x80, 0xbe];
        bytes.extend(read_reply(0x10, 100, 50));
        let (mut bus, _) = script(vec![bytes]);
        let payload = FrameReader::new().find_next(&mut bus, Hint::Common).unwrap();
        assert_eq!(payload[0], 0x02);
    }

    #[test]
    fn gives_up_after_two_refills() {
        let (mut bus, state) = script(vec![vec![0x00; 16], vec![0x00; 16], vec![0x00; 16]]);
        match FrameReader::new().find_next(&mut bus, Hint::Common) {
            Err(Error::NoMessage) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state.borrow().requested.len(), 2);
    }

    #[test]
    fn checksum_mismatch_skips_two_bytes() {
        let mut bad = read_reply(0x10, 100, 50);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        let mut stream = bad;
        stream.extend(read_reply(0x12, 100, 80));
        let (head, tail) = stream.split_at(16);
        let (mut bus, _) = script(vec![head.to_vec(), tail.to_vec()]);
        let payload = FrameReader::new()
            .find_next(&mut bus, Hint::Reply(Op::ReadReply))
            .unwrap();
        assert_eq!(payload[2], 0x12);
    }

    #[test]
    fn wrong_opcode_against_hint_drops_whole_frame() {
        let mut stream = monitor_frame(&[0xe3, 0x00, 0x00, b'x']);
        stream.extend(read_reply(0x10, 100, 50));
        let (head, tail) = stream.split_at(16);
        let (mut bus, _) = script(vec![head.to_vec(), tail.to_vec()]);
        let payload = FrameReader::new()
            .find_next(&mut bus, Hint::Reply(Op::ReadReply))
            .unwrap();
        assert_eq!(payload[0], 0x02);
    }

    #[test]
    fn max_admissible_frame_accepted_oversized_rejected() {
        // opcode + offset + 32 fragment bytes: 38 on the wire
        let mut payload = vec![0xe3, 0x00, 0x00];
        payload.extend([b'a'; 32]);
        let frame = monitor_frame(&payload);
        assert_eq!(frame.len(), DDC_MAX_LEN);
        let (mut bus, _) = script(vec![frame]);
        let got = FrameReader::new()
            .find_next(&mut bus, Hint::Reply(Op::CapabilitiesReply))
            .unwrap();
        assert_eq!(got, payload);

        // one fragment byte more and the length byte exceeds the limit
        let mut over = vec![0xe3, 0x00, 0x00];
        over.extend([b'a'; 33]);
        let frame = monitor_frame(&over);
        let (mut bus, _) = script(vec![frame]);
        assert!(matches!(
            FrameReader::new().find_next(&mut bus, Hint::Reply(Op::CapabilitiesReply)),
            Err(Error::NoMessage)
        ));
    }

    #[test]
    fn chopped_reads_request_only_missing_bytes() {
        let reply = read_reply(0x10, 100, 50);
        let (first, second) = reply.split_at(5);
        let (mut bus, state) = script(vec![first.to_vec(), second.to_vec()]);
        let mut reader = FrameReader::new();
        let payload = reader.find_next(&mut bus, Hint::Common).unwrap();
        assert_eq!(payload[0], 0x02);
        assert!(reader.chopped.locked());
        assert!(reader.chopped.value());
        // first refill sized for frame + slack, second for the missing tail
        assert_eq!(state.borrow().requested, [16, 6]);
    }

    #[test]
    fn garbage_on_second_refill_counts_against_chopped() {
        let mut reader = FrameReader::new();
        for _ in 0..2 {
            let reply = read_reply(0x10, 100, 50);
            let (first, _) = reply.split_at(5);
            // the second refill completes the frame with a broken checksum
            let (mut bus, _) = script(vec![first.to_vec(), vec![0x00; 6]]);
            let _ = reader.find_next(&mut bus, Hint::Common);
        }
        assert!(reader.chopped.locked());
        assert!(!reader.chopped.value());

        // once chopped reads are off the table, a partial frame refill
        // falls back to the frame-plus-slack request size
        let reply = read_reply(0x12, 100, 80);
        let (first, second) = reply.split_at(4);
        let (mut bus, state) = script(vec![first.to_vec(), second.to_vec()]);
        reader.find_next(&mut bus, Hint::Common).unwrap();
        assert_eq!(state.borrow().requested, [16, 16]);
    }

    #[test]
    fn strict_raw_hint_requests_exactly_that() {
        let (mut bus, state) = script(vec![read_reply(0x10, 100, 50)]);
        let payload = FrameReader::new().find_next(&mut bus, Hint::Raw(11)).unwrap();
        assert_eq!(payload.len(), 8);
        assert_eq!(state.borrow().requested, [11]);
    }

    proptest! {
        // Any legal payload wrapped in a monitor frame comes back intact.
        #[test]
        fn payload_round_trip(
            opcode in prop::sample::select(vec![0x01u8, 0x02, 0x03, 0x07, 0x0c, 0xe3, 0xf3]),
            args in proptest::collection::vec(any::<u8>(), 0..=34),
        ) {
            let mut payload = vec![opcode];
            payload.extend(&args);
            let frame = monitor_frame(&payload);
            let len = frame.len();
            let (mut bus, _) = script(vec![frame]);
            let got = FrameReader::new().find_next(&mut bus, Hint::Raw(len)).unwrap();
            prop_assert_eq!(got, payload);
        }
    }
}
