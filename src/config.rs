//! Per-monitor configuration files, looked up XDG-style.
//!
//! One plain-text file per monitor, named after its identifier: two lines,
//! each a floating-point number of seconds (read delay, then write delay).
//! Anything missing or malformed counts as "defaults", which makes the
//! controller recalibrate on its next start.

use core::time::Duration;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::edid::MonitorId;

const APP_DIR: &str = "d2see";

fn base_dirs(var: &str, split: bool, default: &str) -> Vec<PathBuf> {
    let raw = env::var(var).unwrap_or_default();
    let candidates: Vec<&str> = if split {
        raw.split(':').collect()
    } else {
        vec![raw.as_str()]
    };
    let mut dirs: Vec<PathBuf> = candidates
        .into_iter()
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .collect();
    if dirs.is_empty() {
        if let Some(d) = expand(default) {
            dirs.push(d);
        }
    }
    dirs
}

fn expand(default: &str) -> Option<PathBuf> {
    match default.strip_prefix("~/") {
        Some(rest) => env::var_os("HOME").map(|home| Path::new(&home).join(rest)),
        None => Some(PathBuf::from(default)),
    }
}

fn read_dirs() -> Vec<PathBuf> {
    let mut dirs = base_dirs("XDG_CONFIG_HOME", false, "~/.config");
    dirs.extend(base_dirs("XDG_CONFIG_DIRS", true, "/etc/xdg"));
    dirs
}

fn write_dir() -> Option<PathBuf> {
    base_dirs("XDG_CONFIG_HOME", false, "~/.config").into_iter().next()
}

/// Calibrated delays for `id`, when a well-formed file exists.
pub(crate) fn load_delays(id: &MonitorId) -> Option<(Duration, Duration)> {
    for dir in read_dirs() {
        let path = dir.join(APP_DIR).join(id.as_str());
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        return match parse_delays(&text) {
            Some(delays) => {
                debug!("{id}: delays from {}", path.display());
                Some(delays)
            }
            None => {
                warn!("{id}: malformed delay file {}", path.display());
                None
            }
        };
    }
    None
}

fn parse_delays(text: &str) -> Option<(Duration, Duration)> {
    let mut lines = text.lines();
    let read: f64 = lines.next()?.trim().parse().ok()?;
    let write: f64 = lines.next()?.trim().parse().ok()?;
    if !(read.is_finite() && write.is_finite() && read >= 0.0 && write >= 0.0) {
        return None;
    }
    Some((Duration::from_secs_f64(read), Duration::from_secs_f64(write)))
}

/// Persist calibrated delays; called exactly once per monitor, when the
/// defaults are first replaced.
pub(crate) fn store_delays(id: &MonitorId, read: Duration, write: Duration) -> io::Result<()> {
    let dir = write_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no writable config dir"))?
        .join(APP_DIR);
    fs::create_dir_all(&dir)?;
    let path = dir.join(id.as_str());
    fs::write(
        &path,
        format!("{}\n{}\n", read.as_secs_f64(), write.as_secs_f64()),
    )?;
    debug!("{id}: delays stored at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The tests rewrite process environment; keep them serialized.
    static ENV: Mutex<()> = Mutex::new(());

    fn test_id() -> MonitorId {
        let mut edid = [0u8; 256];
        edid[8] = 0x1e;
        edid[9] = 0x6d;
        MonitorId::from_edid(&edid)
    }

    #[test]
    fn parses_two_floats() {
        assert_eq!(
            parse_delays("0.05\n0.0815\n"),
            Some((Duration::from_secs_f64(0.05), Duration::from_secs_f64(0.0815)))
        );
    }

    #[test]
    fn rejects_short_or_malformed_files() {
        assert_eq!(parse_delays(""), None);
        assert_eq!(parse_delays("0.05\n"), None);
        assert_eq!(parse_delays("0.05\nbogus\n"), None);
        assert_eq!(parse_delays("-1\n0.05\n"), None);
        assert_eq!(parse_delays("inf\n0.05\n"), None);
    }

    #[test]
    fn store_then_load_round_trip() {
        let _env = ENV.lock().unwrap();
        let home = tempfile::tempdir().unwrap();
        env::set_var("XDG_CONFIG_HOME", home.path());
        let id = test_id();
        let delays = (Duration::from_millis(73), Duration::from_millis(120));
        store_delays(&id, delays.0, delays.1).unwrap();
        assert_eq!(load_delays(&id), Some(delays));
        let text = fs::read_to_string(home.path().join(APP_DIR).join(id.as_str())).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn missing_file_means_defaults() {
        let _env = ENV.lock().unwrap();
        let home = tempfile::tempdir().unwrap();
        env::set_var("XDG_CONFIG_HOME", home.path());
        assert_eq!(load_delays(&test_id()), None);
    }

    #[test]
    fn falls_back_to_config_dirs_for_reading() {
        let _env = ENV.lock().unwrap();
        let home = tempfile::tempdir().unwrap();
        let site = tempfile::tempdir().unwrap();
        env::set_var("XDG_CONFIG_HOME", home.path());
        env::set_var("XDG_CONFIG_DIRS", site.path());
        let id = test_id();
        let dir = site.path().join(APP_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(id.as_str()), "0.1\n0.2\n").unwrap();
        assert_eq!(
            load_delays(&id),
            Some((Duration::from_millis(100), Duration::from_millis(200)))
        );
        env::remove_var("XDG_CONFIG_DIRS");
    }
}
