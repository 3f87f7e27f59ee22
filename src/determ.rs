//! Fluent-to-locked booleans for monitor quirks.

/// A counter-backed boolean that answers with a default until enough
/// corroborating observations push its counter to an endpoint; from then
/// on the answer is locked for good and further observations are no-ops.
///
/// `yes` and `no` are the observation counts needed to lock; mixed
/// observations cancel each other out while still fluent.
#[derive(Debug, Clone)]
pub struct Determinator {
    counter: i32,
    yes: i32,
    no: i32,
    default: bool,
}

impl Determinator {
    pub fn new(default: bool, yes: u32, no: u32) -> Self {
        assert!(yes > 0 && no > 0);
        Self {
            counter: 0,
            yes: yes as i32,
            no: -(no as i32),
            default,
        }
    }

    pub fn observe(&mut self, observation: bool) {
        if self.locked() {
            return;
        }
        self.counter += if observation { 1 } else { -1 };
    }

    pub fn locked(&self) -> bool {
        self.counter == self.yes || self.counter == self.no
    }

    pub fn value(&self) -> bool {
        if self.counter == self.yes {
            true
        } else if self.counter == self.no {
            false
        } else {
            self.default
        }
    }
}
