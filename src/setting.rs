//! Per-register state and the per-monitor settings store.
//!
//! A `Setting` tracks what we believe is in the hardware (`current`),
//! what the user wants there (`desired`), and how far along the
//! write-then-confirm dance is.  The store ranks pending work so the
//! scheduler always drives the most urgent register next.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use log::{debug, warn};

use crate::mccs::VcpReply;

/// Callback for value changes; stays registered.
pub type ValueListener = Box<dyn FnMut(u16)>;
/// Callback for the register maximum; fires once.
pub type MaxListener = Box<dyn FnOnce(u16)>;

/// What a setting wants from the bus next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    Read { vcp: u8 },
    Write { vcp: u8, value: u16 },
}

impl Task {
    pub(crate) fn vcp(self) -> u8 {
        match self {
            Task::Read { vcp } | Task::Write { vcp, .. } => vcp,
        }
    }
}

/// Scheduling rank; bigger wins.  Field order is the comparison order:
/// pending writes dominate, then unconfirmed reads, then finishing an
/// already-prepared read, then the least recently interacted register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Priority {
    writings_left: u8,
    unconfirmed: bool,
    prep_match: bool,
    recency: Reverse<usize>,
}

impl Priority {
    pub(crate) fn new(
        writings_left: u8,
        unconfirmed: bool,
        prep_match: bool,
        position: usize,
    ) -> Self {
        Self {
            writings_left,
            unconfirmed,
            prep_match,
            recency: Reverse(position),
        }
    }
}

/// Listener notification, delivered once the store borrow is released.
pub(crate) enum Note {
    Value(u8, u16),
    Max(u8, u16),
}

pub(crate) struct Setting {
    vcp: u8,
    current: Option<u16>,
    desired: Option<u16>,
    confirmed: bool,
    writings_left: u8,
    max: Option<u16>,
    /// Last known value, parked here while a front-panel change is being
    /// re-read so listeners only fire on a real difference.
    pre_52: Option<u16>,
    value_listeners: Vec<ValueListener>,
    max_listeners: Vec<MaxListener>,
}

impl Setting {
    fn new(vcp: u8) -> Self {
        Self {
            vcp,
            current: None,
            desired: None,
            confirmed: false,
            writings_left: 0,
            max: None,
            pre_52: None,
            value_listeners: Vec::new(),
            max_listeners: Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> Option<u16> {
        self.current
    }

    pub(crate) fn max(&self) -> Option<u16> {
        self.max
    }

    /// Register a pending write.  Returns whether the scheduler's priority
    /// landscape changed.
    pub(crate) fn request(&mut self, value: u16) -> bool {
        let value = match self.max {
            Some(max) if value > max => {
                debug!("VCP {:#04x}: clamping {value} to max {max}", self.vcp);
                max
            }
            _ => value,
        };
        if self.desired == Some(value) {
            return false;
        }
        if self.current == Some(value) {
            let had_pending = self.desired.take().is_some();
            if had_pending {
                self.writings_left = 0;
            }
            return had_pending;
        }
        self.desired = Some(value);
        self.writings_left = 2;
        true
    }

    pub(crate) fn task(&self) -> Option<Task> {
        if self.writings_left > 0 {
            if let Some(value) = self.desired {
                return Some(Task::Write {
                    vcp: self.vcp,
                    value,
                });
            }
        }
        if !self.confirmed {
            return Some(Task::Read { vcp: self.vcp });
        }
        None
    }

    fn priority(&self, prep: Option<u8>, position: usize) -> Priority {
        Priority::new(
            if self.desired.is_some() {
                self.writings_left
            } else {
                0
            },
            !self.confirmed,
            prep == Some(self.vcp),
            position,
        )
    }

    pub(crate) fn read_acked(&mut self, reply: VcpReply, notes: &mut Vec<Note>) {
        match self.max {
            None => {
                self.max = Some(reply.max);
                notes.push(Note::Max(self.vcp, reply.max));
            }
            Some(max) if max != reply.max => {
                warn!(
                    "VCP {:#04x}: monitor changed max {max} -> {}, keeping {max}",
                    self.vcp, reply.max
                );
            }
            _ => {}
        }
        let previous = self.current.or(self.pre_52.take());
        self.current = Some(reply.value);
        self.confirmed = true;
        if let Some(desired) = self.desired {
            if desired == reply.value {
                self.desired = None;
                self.writings_left = 0;
            } else if self.max.is_some_and(|max| desired > max) {
                debug!(
                    "VCP {:#04x}: abandoning {desired}, beyond max {:?}",
                    self.vcp, self.max
                );
                self.desired = None;
                self.writings_left = 0;
            } else {
                self.writings_left = 2;
            }
        }
        if previous != Some(reply.value) {
            notes.push(Note::Value(self.vcp, reply.value));
        }
    }

    pub(crate) fn write_acked(&mut self, notes: &mut Vec<Note>) {
        let Some(desired) = self.desired else {
            return;
        };
        let previous = self.current.or(self.pre_52.take());
        self.current = Some(desired);
        self.confirmed = false;
        self.writings_left = self.writings_left.saturating_sub(1);
        if previous != Some(desired) {
            notes.push(Note::Value(self.vcp, desired));
        }
    }

    /// A front-panel change was reported for this register: forget the
    /// cached value and have the scheduler re-read it.
    pub(crate) fn invalidate(&mut self) {
        if self.pre_52.is_none() {
            self.pre_52 = self.current;
        }
        self.current = None;
        self.confirmed = false;
    }

    pub(crate) fn push_value_listener(&mut self, cb: ValueListener) {
        self.value_listeners.push(cb);
    }

    pub(crate) fn push_max_listener(&mut self, cb: MaxListener) {
        self.max_listeners.push(cb);
    }
}

#[derive(Default)]
pub(crate) struct Store {
    settings: BTreeMap<u8, Setting>,
    /// Interaction order, least recently interacted first.
    log: Vec<u8>,
}

impl Store {
    pub(crate) fn entry(&mut self, vcp: u8) -> &mut Setting {
        self.settings.entry(vcp).or_insert_with(|| Setting::new(vcp))
    }

    pub(crate) fn get_mut(&mut self, vcp: u8) -> Option<&mut Setting> {
        self.settings.get_mut(&vcp)
    }

    pub(crate) fn known(&self, vcp: u8) -> bool {
        self.settings.contains_key(&vcp)
    }

    /// Record a completed interaction for round-robin ranking.
    pub(crate) fn touch(&mut self, vcp: u8) {
        self.log.retain(|&v| v != vcp);
        self.log.push(vcp);
    }

    /// 0 for never-interacted registers, otherwise 1 + the interaction-log
    /// index (so older interactions rank first).
    pub(crate) fn position(&self, vcp: u8) -> usize {
        self.log
            .iter()
            .position(|&v| v == vcp)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// The top-priority pending task among all settings.
    pub(crate) fn best(&self, prep: Option<u8>) -> Option<(Priority, Task)> {
        self.settings
            .values()
            .filter_map(|s| {
                s.task()
                    .map(|task| (s.priority(prep, self.position(s.vcp)), task))
            })
            .max_by_key(|&(priority, _)| priority)
    }

    pub(crate) fn read_acked(&mut self, vcp: u8, reply: VcpReply) -> Vec<Note> {
        let mut notes = Vec::new();
        if let Some(setting) = self.settings.get_mut(&vcp) {
            setting.read_acked(reply, &mut notes);
        }
        notes
    }

    pub(crate) fn write_acked(&mut self, vcp: u8) -> Vec<Note> {
        let mut notes = Vec::new();
        if let Some(setting) = self.settings.get_mut(&vcp) {
            setting.write_acked(&mut notes);
        }
        notes
    }

    fn take_value_listeners(&mut self, vcp: u8) -> Vec<ValueListener> {
        self.settings
            .get_mut(&vcp)
            .map(|s| mem::take(&mut s.value_listeners))
            .unwrap_or_default()
    }

    fn return_value_listeners(&mut self, vcp: u8, mut cbs: Vec<ValueListener>) {
        if let Some(setting) = self.settings.get_mut(&vcp) {
            // listeners added during dispatch go after the existing ones
            cbs.append(&mut setting.value_listeners);
            setting.value_listeners = cbs;
        }
    }

    fn take_max_listeners(&mut self, vcp: u8) -> Vec<MaxListener> {
        self.settings
            .get_mut(&vcp)
            .map(|s| mem::take(&mut s.max_listeners))
            .unwrap_or_default()
    }
}

/// Deliver notifications with the store borrow released, so listeners may
/// call back into the handle (e.g. to write a follow-up value).
pub(crate) fn dispatch(store: &Rc<RefCell<Store>>, notes: Vec<Note>) {
    for note in notes {
        match note {
            Note::Value(vcp, value) => {
                let mut cbs = store.borrow_mut().take_value_listeners(vcp);
                for cb in cbs.iter_mut() {
                    cb(value);
                }
                store.borrow_mut().return_value_listeners(vcp, cbs);
            }
            Note::Max(vcp, max) => {
                for cb in store.borrow_mut().take_max_listeners(vcp) {
                    cb(max);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(value: u16, max: u16) -> VcpReply {
        VcpReply {
            value,
            max,
            kind: 0,
        }
    }

    #[test]
    fn write_then_confirm_lifecycle() {
        let mut s = Setting::new(0x10);
        assert_eq!(s.task(), Some(Task::Read { vcp: 0x10 }));

        assert!(s.request(50));
        assert_eq!(
            s.task(),
            Some(Task::Write {
                vcp: 0x10,
                value: 50
            })
        );

        let mut notes = Vec::new();
        s.write_acked(&mut notes);
        s.write_acked(&mut notes);
        // two writes done, read-back pending
        assert_eq!(s.writings_left, 0);
        assert_eq!(s.task(), Some(Task::Read { vcp: 0x10 }));
        assert_eq!(notes.len(), 1);

        let mut notes = Vec::new();
        s.read_acked(reply(50, 100), &mut notes);
        assert!(s.confirmed);
        assert_eq!(s.desired, None);
        assert_eq!(s.task(), None);
        // no value change on confirmation, only the max is news
        assert!(matches!(notes.as_slice(), [Note::Max(0x10, 100)]));
    }

    #[test]
    fn repeated_request_does_not_change_the_landscape() {
        let mut s = Setting::new(0x10);
        assert!(s.request(50));
        assert!(!s.request(50));
    }

    #[test]
    fn requesting_the_current_value_withdraws_the_pending_write() {
        let mut s = Setting::new(0x10);
        let mut notes = Vec::new();
        s.read_acked(reply(30, 100), &mut notes);
        assert!(s.request(50));
        assert!(s.request(30));
        assert_eq!(s.task(), None);
        assert!(!s.request(30));
    }

    #[test]
    fn requests_clamp_to_a_known_max() {
        let mut s = Setting::new(0x10);
        let mut notes = Vec::new();
        s.read_acked(reply(30, 100), &mut notes);
        assert!(s.request(250));
        assert_eq!(
            s.task(),
            Some(Task::Write {
                vcp: 0x10,
                value: 100
            })
        );
    }

    #[test]
    fn overshooting_desired_is_abandoned_after_read_back() {
        // max unknown at request time, so the raw value goes out
        let mut s = Setting::new(0x10);
        assert!(s.request(250));
        let mut notes = Vec::new();
        s.write_acked(&mut notes);
        s.write_acked(&mut notes);
        s.read_acked(reply(100, 100), &mut notes);
        assert_eq!(s.desired, None);
        assert_eq!(s.task(), None);
    }

    #[test]
    fn mismatching_read_back_schedules_retries() {
        let mut s = Setting::new(0x10);
        assert!(s.request(50));
        let mut notes = Vec::new();
        s.write_acked(&mut notes);
        s.write_acked(&mut notes);
        // monitor reports something else entirely
        s.read_acked(reply(47, 100), &mut notes);
        assert_eq!(s.writings_left, 2);
        assert_eq!(
            s.task(),
            Some(Task::Write {
                vcp: 0x10,
                value: 50
            })
        );
    }

    #[test]
    fn invalidation_reports_only_real_changes() {
        let mut s = Setting::new(0x10);
        let mut notes = Vec::new();
        s.read_acked(reply(30, 100), &mut notes);

        s.invalidate();
        assert_eq!(s.task(), Some(Task::Read { vcp: 0x10 }));
        let mut notes = Vec::new();
        s.read_acked(reply(30, 100), &mut notes);
        assert!(notes.is_empty());

        s.invalidate();
        let mut notes = Vec::new();
        s.read_acked(reply(77, 100), &mut notes);
        assert!(matches!(notes.as_slice(), [Note::Value(0x10, 77)]));
    }

    #[test]
    fn writes_beat_reads_for_the_same_register() {
        let mut store = Store::default();
        store.entry(0x10).request(50);
        store.entry(0x12);
        let (_, task) = store.best(None).unwrap();
        assert_eq!(
            task,
            Task::Write {
                vcp: 0x10,
                value: 50
            }
        );
    }

    #[test]
    fn reads_round_robin_by_least_recent_interaction() {
        let mut store = Store::default();
        store.entry(0x10);
        store.entry(0x12);
        store.touch(0x10);
        // 0x12 never interacted: it goes first
        let (_, task) = store.best(None).unwrap();
        assert_eq!(task, Task::Read { vcp: 0x12 });
        store.touch(0x12);
        // now 0x10 is the older interaction
        let (_, task) = store.best(None).unwrap();
        assert_eq!(task, Task::Read { vcp: 0x10 });
    }

    #[test]
    fn prepared_read_is_finished_before_switching() {
        let mut store = Store::default();
        store.entry(0x10);
        store.entry(0x12);
        store.touch(0x12);
        store.touch(0x10);
        // round robin would pick 0x12, but 0x10's reply is in flight
        let (_, task) = store.best(Some(0x10)).unwrap();
        assert_eq!(task, Task::Read { vcp: 0x10 });
    }

    #[test]
    fn dispatch_releases_the_store_for_reentrant_listeners() {
        let store = Rc::new(RefCell::new(Store::default()));
        store.borrow_mut().entry(0x10);
        let inner = store.clone();
        store
            .borrow_mut()
            .entry(0x10)
            .push_value_listener(Box::new(move |_| {
                // must not deadlock or panic
                inner.borrow_mut().entry(0x10).request(5);
            }));
        dispatch(&store, vec![Note::Value(0x10, 50)]);
        assert!(store.borrow_mut().entry(0x10).task().is_some());
    }
}
