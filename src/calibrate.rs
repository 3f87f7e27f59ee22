//! Delay calibration: binary-search the shortest (read, write) delays the
//! monitor still answers correctly at, using brightness as the probe.

use core::time::Duration;

use log::{debug, info};
use rand::Rng;

use crate::err::{Error, Result};
use crate::ddc::VCP_BRIGHTNESS;
use crate::mccs::Mccs;

/// Probes per trial.
const TRIALS: u32 = 10;
/// Halvings per binary search.
const SEARCH_STEPS: u32 = 5;
/// Known-good upper bound, in seconds.
const SAFE: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
enum TrialKind {
    Read,
    Write,
}

/// Tune the monitor's delays.  Trial failures are too-short-delay signals
/// and steer the search; only the initial sanity check can abort.
pub(crate) async fn run(mccs: &mut Mccs) -> Result<(Duration, Duration)> {
    let (orig, max) = safe_check(mccs).await?;
    info!("calibrating against brightness {orig}/{max}");
    let probe = Probe { orig, max };

    let mut read = 1.5 * probe.search(mccs, TrialKind::Read, SAFE, 0.0, SAFE).await;
    let mut write = 1.5 * probe.search(mccs, TrialKind::Write, SAFE, read, 0.0).await;
    read = 1.2 * probe.search(mccs, TrialKind::Read, read, 0.0, write).await;
    write = 1.2 * probe.search(mccs, TrialKind::Write, write, read, 0.0).await;

    if !probe.trial(mccs, TrialKind::Write, read, write).await
        || !probe.trial(mccs, TrialKind::Read, read, write).await
    {
        info!("tuned delays did not verify, staying at the safe pair");
        read = SAFE;
        write = SAFE;
    }
    info!("calibrated delays: read {read:.4}s, write {write:.4}s");
    Ok((Duration::from_secs_f64(read), Duration::from_secs_f64(write)))
}

/// With safe delays: read brightness, nudge it, read it back, restore.
/// Proves the monitor follows brightness writes at all.
async fn safe_check(mccs: &mut Mccs) -> Result<(u16, u16)> {
    let _guard = mccs.safe_delay();
    let reply = mccs.brightness().await?;
    let (orig, max) = (reply.value, reply.max);
    let nudge = if orig == 0 { 1 } else { orig - 1 };
    mccs.set_brightness(nudge).await?;
    if mccs.brightness().await?.value != nudge {
        return Err(Error::Unsupported(VCP_BRIGHTNESS));
    }
    mccs.set_brightness(orig).await?;
    if mccs.brightness().await?.value != orig {
        return Err(Error::Unsupported(VCP_BRIGHTNESS));
    }
    Ok((orig, max))
}

struct Probe {
    orig: u16,
    max: u16,
}

impl Probe {
    /// Smallest delay on one axis that still passes the trial, narrowing
    /// from a known-good `upper` towards zero.
    async fn search(
        &self,
        mccs: &mut Mccs,
        kind: TrialKind,
        upper: f64,
        read: f64,
        write: f64,
    ) -> f64 {
        let mut good = upper;
        let mut bad = 0.0;
        for _ in 0..SEARCH_STEPS {
            let point = bad + (good - bad) / 2.0;
            let (r, w) = match kind {
                TrialKind::Read => (point, write),
                TrialKind::Write => (read, point),
            };
            if self.trial(mccs, kind, r, w).await {
                good = point;
            } else {
                bad = point;
            }
        }
        good
    }

    async fn trial(&self, mccs: &mut Mccs, kind: TrialKind, r: f64, w: f64) -> bool {
        let result = match kind {
            TrialKind::Read => self.read_trial(mccs, r, w).await,
            TrialKind::Write => self.write_trial(mccs, r, w).await,
        };
        let ok = matches!(result, Ok(true));
        let restored = self.restore(mccs).await;
        let passed = ok && restored;
        debug!(
            "{} {kind:?} delays ({r:.4}, {w:.4})",
            if passed { "SUCC" } else { "FAIL" }
        );
        passed
    }

    /// Set a random brightness, read it back, `TRIALS` times over.
    async fn read_trial(&self, mccs: &mut Mccs, r: f64, w: f64) -> Result<bool> {
        let _guard = mccs.set_delay(Duration::from_secs_f64(r), Duration::from_secs_f64(w));
        let mut tolerance = 1u32;
        for _ in 0..TRIALS {
            let value = rand::thread_rng().gen_range(0..=self.max);
            mccs.set_brightness(value).await?;
            if mccs.brightness().await?.value != value {
                if tolerance == 0 {
                    return Ok(false);
                }
                tolerance -= 1;
            }
        }
        Ok(true)
    }

    /// Bursts of writes back to back, with only a final safe-paced
    /// read-back checking that the last one stuck.
    async fn write_trial(&self, mccs: &mut Mccs, r: f64, w: f64) -> Result<bool> {
        let mut tolerance = 1u32;
        for _ in 0..TRIALS {
            let burst = rand::thread_rng().gen_range(3..=8);
            let mut last = 0;
            {
                let _guard =
                    mccs.set_delay(Duration::from_secs_f64(r), Duration::from_secs_f64(w));
                for _ in 0..burst {
                    last = rand::thread_rng().gen_range(0..=self.max);
                    mccs.set_brightness(last).await?;
                }
            }
            let _guard = mccs.safe_delay();
            if mccs.brightness().await?.value != last {
                if tolerance == 0 {
                    return Ok(false);
                }
                tolerance -= 1;
            }
        }
        Ok(true)
    }

    async fn restore(&self, mccs: &mut Mccs) -> bool {
        let _guard = mccs.safe_delay();
        if mccs.set_brightness(self.orig).await.is_err() {
            return false;
        }
        matches!(mccs.brightness().await, Ok(reply) if reply.value == self.orig)
    }
}
