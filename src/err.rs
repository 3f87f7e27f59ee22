use core::time::Duration;
use std::io;

use crate::ddc::Op;

/// Errors surfaced by the DDC/CI stack.
///
/// [`Error::WouldBlock`] is not a failure: it is the waiter's flow-control
/// signal telling the caller that the monitor needs more settle time, and
/// how much.  The async adapters absorb it; everything else propagates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{bus}: {source}")]
    Bus {
        bus: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}: no EDID header")]
    NoEdid(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("expected a {want:?} reply, got {got:?}")]
    UnexpectedOpcode { want: Op, got: Op },
    #[error("monitor does not support VCP {0:#04x}")]
    Unsupported(u8),
    #[error("reply out of sync: expected {want:#06x}, got {got:#06x}")]
    OutOfSync { want: u16, got: u16 },
    #[error("monitor not ready, retry in {0:?}")]
    WouldBlock(Duration),
    #[error("no valid frame within the refill budget")]
    NoMessage,
}

pub type Result<T> = core::result::Result<T, Error>;
