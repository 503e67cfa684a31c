//! The permanent block behind `/hang`.
//!
//! A hung call parks its own thread and never comes back. Hung calls share
//! no synchronization state with each other or with `getattr("/")`.
//! Spurious unparks are absorbed by the loop.

use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Interval between "still hanging" log lines when none is configured.
pub const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(10);

/// Park length used when wake logging is disabled.
const SILENT_PARK: Duration = Duration::from_secs(3600);

/// Diagnostics for the permanent hang.
///
/// This only controls logging. Which paths hang is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HangOptions {
    /// Log a line every `wake_interval` while hanging. `None` stays silent
    /// after the initial "entering" line.
    pub wake_interval: Option<Duration>,
}

impl Default for HangOptions {
    fn default() -> Self {
        Self {
            wake_interval: Some(DEFAULT_WAKE_INTERVAL),
        }
    }
}

impl HangOptions {
    /// Hang silently: no periodic wake logging.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            wake_interval: None,
        }
    }

    /// Build options from a wake interval. A zero interval disables wake
    /// logging rather than spinning.
    #[must_use]
    pub fn with_wake_interval(interval: Duration) -> Self {
        Self {
            wake_interval: Some(interval).filter(|d| !d.is_zero()),
        }
    }
}

/// Block the calling thread forever.
///
/// Emits one log line before the wait and, if configured, one per wake
/// interval afterwards. Only killing the process ends the wait.
pub fn hang_forever(path: &str, options: &HangOptions) -> ! {
    let interval = options.wake_interval.filter(|d| !d.is_zero());
    let started = Instant::now();
    info!(
        path,
        wake_interval_ms = interval.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        "entering permanent hang"
    );

    let mut next_wake = interval.map(|d| started + d);
    let mut wakes: u64 = 0;
    loop {
        let park_for = next_wake.map_or(SILENT_PARK, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        thread::park_timeout(park_for);

        let (Some(deadline), Some(interval)) = (next_wake, interval) else {
            continue;
        };
        let now = Instant::now();
        if now < deadline {
            continue;
        }
        wakes += 1;
        info!(
            path,
            wakes,
            hung_for_secs = started.elapsed().as_secs(),
            "still hanging"
        );
        // Skip missed ticks after a long stall instead of logging a burst.
        next_wake = Some((deadline + interval).max(now + interval / 2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn default_wakes_every_ten_seconds() {
        assert_eq!(
            HangOptions::default().wake_interval,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn zero_interval_disables_wake_logging() {
        assert_eq!(
            HangOptions::with_wake_interval(Duration::ZERO),
            HangOptions::silent()
        );
    }

    #[test]
    fn hang_survives_frequent_wakes() {
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            let _done = tx;
            hang_forever(
                "/hang",
                &HangOptions::with_wake_interval(Duration::from_millis(5)),
            );
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(300)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn hang_ignores_unpark() {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _done = tx;
            hang_forever("/hang", &HangOptions::silent());
        });
        for _ in 0..20 {
            handle.thread().unpark();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(200)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );
    }
}
