//! Monitor discovery and the per-monitor scheduler.

use core::time::Duration;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::bus::I2cBus;
use crate::calibrate;
use crate::config;
use crate::ddc::{DDC_ADDR, EDID_ADDR, VCP_NEW_CONTROL_VALUE};
use crate::edid::{self, MonitorId};
use crate::err::{Error, Result};
use crate::mccs::Mccs;
use crate::poll52::ChangePoller;
use crate::setting::{self, MaxListener, Store, Task, ValueListener};
use crate::waiter::DEFAULT_DELAY;

/// Scan `/dev` for i2c bus nodes.
pub fn list_buses() -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = match std::fs::read_dir("/dev") {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("i2c-"))
            })
            .collect(),
        Err(e) => {
            warn!("/dev: {e}");
            Vec::new()
        }
    };
    nodes.sort();
    nodes
}

/// Probe every bus node and keep the ones serving an EDID.  Spawn each
/// returned controller's [`MonitorController::run`] on a `LocalSet`.
pub fn coldplug() -> Vec<MonitorController> {
    let mut monitors = Vec::new();
    for path in list_buses() {
        match MonitorController::probe(&path) {
            Ok(monitor) => {
                info!("{}: monitor {}", path.display(), monitor.id());
                monitors.push(monitor);
            }
            Err(e) => debug!("{}: {e}", path.display()),
        }
    }
    monitors
}

enum Origin {
    Setting,
    Poller,
}

enum Decision {
    Idle,
    Sleep(Duration),
    Act(Origin, Task),
}

/// Owns one monitor: its DDC pipeline, its settings, and the scheduler
/// that mediates between them.  Lives as one long-running task.
pub struct MonitorController {
    id: MonitorId,
    edid: [u8; 256],
    mccs: Mccs,
    store: Rc<RefCell<Store>>,
    notify: Rc<Notify>,
    poller: ChangePoller,
    calibrated: bool,
}

impl MonitorController {
    /// Probe one bus node for a monitor.
    pub fn probe(path: &Path) -> Result<Self> {
        let mut edid_bus = I2cBus::open(path, EDID_ADDR)?;
        let image = edid::read_edid(&mut edid_bus)?;
        let ddc = I2cBus::open(path, DDC_ADDR)?;
        Ok(Self::new(ddc, image))
    }

    /// Build a controller over an already-open DDC bus; entry point for
    /// tests and non-i2c-dev transports.
    pub fn new(ddc: I2cBus, edid: [u8; 256]) -> Self {
        let id = MonitorId::from_edid(&edid);
        let stored = config::load_delays(&id);
        let calibrated = stored.is_some();
        let (read_delay, write_delay) = stored.unwrap_or((DEFAULT_DELAY, DEFAULT_DELAY));
        Self {
            mccs: Mccs::new(ddc, read_delay, write_delay),
            id,
            edid,
            store: Rc::new(RefCell::new(Store::default())),
            notify: Rc::new(Notify::new()),
            poller: ChangePoller::new(),
            calibrated,
        }
    }

    pub fn id(&self) -> &MonitorId {
        &self.id
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            id: self.id.clone(),
            edid: self.edid,
            store: self.store.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Calibrate when no tuned delays are on disk, then schedule forever.
    pub async fn run(mut self) {
        if !self.calibrated {
            match calibrate::run(&mut self.mccs).await {
                Ok((read, write)) => {
                    self.mccs.waiter().borrow_mut().set_delays(read, write);
                    if let Err(e) = config::store_delays(&self.id, read, write) {
                        warn!("{}: delays not stored: {e}", self.id);
                    }
                }
                Err(e) => warn!("{}: calibration aborted: {e}", self.id),
            }
        }
        loop {
            match self.pick() {
                Decision::Idle => self.notify.notified().await,
                Decision::Sleep(d) => self.pause(d).await,
                Decision::Act(origin, task) => self.perform(origin, task).await,
            }
        }
    }

    fn pick(&self) -> Decision {
        let now = Instant::now();
        let prep = self.mccs.preparation();
        let store = self.store.borrow();
        let mut best = store
            .best(prep)
            .map(|(priority, task)| (priority, Origin::Setting, task));
        if let Some((priority, task)) =
            self.poller
                .candidate(now, prep, store.position(VCP_NEW_CONTROL_VALUE))
        {
            let beats_settings = match &best {
                Some((best_priority, _, _)) => priority > *best_priority,
                None => true,
            };
            if beats_settings {
                best = Some((priority, Origin::Poller, task));
            }
        }
        match best {
            Some((_, origin, task)) => Decision::Act(origin, task),
            None => match self.poller.next_due(now) {
                Some(d) => Decision::Sleep(d),
                None => Decision::Idle,
            },
        }
    }

    async fn perform(&mut self, origin: Origin, task: Task) {
        match task {
            Task::Read { vcp } => match self.mccs.try_read_vcp(vcp) {
                Ok(reply) => {
                    match origin {
                        Origin::Poller => self.poll_acked(reply),
                        Origin::Setting => {
                            let notes = self.store.borrow_mut().read_acked(vcp, reply);
                            setting::dispatch(&self.store, notes);
                        }
                    }
                    self.done(vcp).await;
                }
                Err(Error::WouldBlock(d)) => self.pause(d).await,
                Err(e) => match origin {
                    Origin::Poller => self.poller.read_nacked(&e, Instant::now()),
                    Origin::Setting => {
                        warn!("{}: VCP {vcp:#04x} read failed: {e}", self.id)
                    }
                },
            },
            Task::Write { vcp, value } => match self.mccs.try_write_vcp(vcp, value) {
                Ok(()) => {
                    match origin {
                        Origin::Poller => self.poller.reset_acked(),
                        Origin::Setting => {
                            let notes = self.store.borrow_mut().write_acked(vcp);
                            setting::dispatch(&self.store, notes);
                        }
                    }
                    self.done(vcp).await;
                }
                Err(Error::WouldBlock(d)) => self.pause(d).await,
                Err(e) => warn!("{}: VCP {vcp:#04x} write failed: {e}", self.id),
            },
        }
    }

    /// Record the interaction and give other monitor tasks a turn.
    async fn done(&mut self, vcp: u8) {
        self.store.borrow_mut().touch(vcp);
        tokio::task::yield_now().await;
    }

    /// Wait out a delay, but let a priority change cut it short.
    async fn pause(&self, d: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = time::sleep(d) => {}
        }
    }

    fn poll_acked(&mut self, reply: crate::mccs::VcpReply) {
        if let Some(vcp) = self.poller.read_acked(reply, Instant::now()) {
            let mut store = self.store.borrow_mut();
            if let Some(s) = store.get_mut(vcp) {
                s.invalidate();
            } else {
                debug!("{}: change on untracked VCP {vcp:#04x}", self.id);
            }
        }
    }
}

/// UI-facing handle to one monitor; cheap to clone, all methods are
/// fire-and-forget against the scheduler.
#[derive(Clone)]
pub struct MonitorHandle {
    id: MonitorId,
    edid: [u8; 256],
    store: Rc<RefCell<Store>>,
    notify: Rc<Notify>,
}

impl MonitorHandle {
    /// Stable EDID-derived identifier.
    pub fn id(&self) -> &MonitorId {
        &self.id
    }

    /// Raw EDID image, for correlating with window-system outputs.
    pub fn edid256(&self) -> &[u8; 256] {
        &self.edid
    }

    /// Ask for `value` in `vcp`.  The scheduler writes it out, confirms
    /// it, and reports the outcome through the listeners.
    pub fn write(&self, vcp: u8, value: u16) {
        if self.store.borrow_mut().entry(vcp).request(value) {
            self.notify.notify_one();
        }
    }

    /// Attach listeners to a register.  Known state is reported right
    /// away; the register is created and kept fresh from then on.
    /// Listeners run on the scheduler task and must not block.
    pub fn add_listeners(
        &self,
        vcp: u8,
        mut on_value: Option<ValueListener>,
        mut on_max: Option<MaxListener>,
    ) {
        let (created, current, max) = {
            let mut store = self.store.borrow_mut();
            let created = !store.known(vcp);
            let setting = store.entry(vcp);
            (created, setting.current(), setting.max())
        };
        if let (Some(value), Some(cb)) = (current, on_value.as_mut()) {
            cb(value);
        }
        if let Some(max) = max {
            if let Some(cb) = on_max.take() {
                cb(max);
            }
        }
        let mut store = self.store.borrow_mut();
        let setting = store.entry(vcp);
        if let Some(cb) = on_value {
            setting.push_value_listener(cb);
        }
        if let Some(cb) = on_max {
            setting.push_max_listener(cb);
        }
        drop(store);
        if created {
            self.notify.notify_one();
        }
    }
}
