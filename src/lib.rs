//! Joint brightness and contrast control for external monitors, speaking
//! DDC/CI over the Linux i2c-dev interface.
//!
//! The wire protocol is slow, loosely implemented, and intolerant of
//! back-to-back traffic, so every monitor gets its own pipeline: a frame
//! scanner that digs replies out of a noisy byte stream, a waiter pacing
//! successive operations with per-monitor calibrated delays, and a
//! priority scheduler that mediates between pending writes, confirmation
//! reads, and polling for front-panel changes (VCP 0x52).
//!
//! Everything runs cooperatively on one thread.  [`coldplug`] probes the
//! buses; each controller then runs as one long task:
//!
//! ```no_run
//! use tokio::task::LocalSet;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let local = LocalSet::new();
//!     let mut handles = Vec::new();
//!     for monitor in d2see::coldplug() {
//!         handles.push(monitor.handle());
//!         local.spawn_local(monitor.run());
//!     }
//!     for handle in &handles {
//!         handle.add_listeners(
//!             d2see::VCP_BRIGHTNESS,
//!             Some(Box::new(|value| println!("brightness {value}"))),
//!             None,
//!         );
//!         handle.write(d2see::VCP_BRIGHTNESS, 50);
//!     }
//!     local.await;
//! }
//! ```
//!
//! Writes are fire-and-forget: the scheduler writes them out twice, reads
//! the register back, and reports what actually stuck through the
//! listeners.  Failures never surface to the caller; a broken monitor
//! simply goes silent while its listeners keep the last known values.

mod bus;
mod calibrate;
mod config;
mod control;
mod ddc;
mod determ;
mod edid;
pub mod err;
mod frame;
mod mccs;
mod poll52;
mod setting;
mod waiter;

pub use bus::{BusTiming, DevI2c, I2cBus, RawBus};
pub use control::{coldplug, list_buses, MonitorController, MonitorHandle};
pub use ddc::{
    encode, Op, DDC_ADDR, DDC_MAX_LEN, EDID_ADDR, VCP_BRIGHTNESS, VCP_CONTRAST,
    VCP_NEW_CONTROL_VALUE, VCP_RESET_NEW_CONTROL,
};
pub use determ::Determinator;
pub use edid::{read_edid, MonitorId};
pub use err::{Error, Result};
pub use frame::{FrameReader, Hint};
pub use mccs::{drive, Mccs, VcpReply};
pub use setting::{MaxListener, ValueListener};
pub use waiter::{DelayGuard, OpKind, Waiter, DEFAULT_DELAY};
