//! When the device registry gets refreshed.
//!
//! There is at most one interval timer alive at any time. Changing the mode
//! always tears the old timer down (joining its thread) before a new one is
//! created, and every timer is stamped with a generation so ticks it queued
//! before being torn down are recognised as stale and dropped.
use crate::error::Result;
use log::debug;
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshMode {
    /// Refresh when the executor reports a hotplug event.
    #[default]
    Hotplug,
    Interval5,
    Interval15,
    Interval60,
    /// Refresh only when the user asks.
    Manual,
}

impl RefreshMode {
    pub const ALL: [RefreshMode; 5] = [
        RefreshMode::Hotplug,
        RefreshMode::Interval5,
        RefreshMode::Interval15,
        RefreshMode::Interval60,
        RefreshMode::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RefreshMode::Hotplug => "hotplug",
            RefreshMode::Interval5 => "interval-5",
            RefreshMode::Interval15 => "interval-15",
            RefreshMode::Interval60 => "interval-60",
            RefreshMode::Manual => "manual",
        }
    }

    pub fn interval(self) -> Option<Duration> {
        match self {
            RefreshMode::Interval5 => Some(Duration::from_secs(5)),
            RefreshMode::Interval15 => Some(Duration::from_secs(15)),
            RefreshMode::Interval60 => Some(Duration::from_secs(60)),
            RefreshMode::Hotplug | RefreshMode::Manual => None,
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "off" {
            return Ok(RefreshMode::Manual);
        }
        RefreshMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("unknown refresh mode '{s}'"))
    }
}

/// Why a refresh is being considered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTrigger {
    Manual,
    Hotplug,
    /// A tick from the interval timer of the given generation.
    Tick(u64),
}

/// A repeating timer on its own thread. Dropping it stops and joins the thread.
pub struct IntervalTimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IntervalTimer {
    pub fn start(period: Duration, mut on_tick: impl FnMut() + Send + 'static) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("inscribe-refresh".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(period) {
                    on_tick();
                }
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread immediately.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
pub struct RefreshPolicy {
    mode: RefreshMode,
    generation: u64,
    timer: Option<IntervalTimer>,
    period_override: Option<Duration>,
}

impl RefreshPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every interval mode at `period` instead of its nominal interval.
    #[cfg(test)]
    pub(crate) fn with_period(period: Duration) -> Self {
        Self {
            period_override: Some(period),
            ..Self::default()
        }
    }

    pub fn mode(&self) -> RefreshMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Switches to `mode`. `on_tick` is called from the timer thread with the
    /// generation of the timer that fired.
    pub fn apply(
        &mut self,
        mode: RefreshMode,
        on_tick: impl Fn(u64) + Send + 'static,
    ) -> Result<()> {
        self.stop();
        self.mode = mode;
        if let Some(nominal) = mode.interval() {
            let period = self.period_override.unwrap_or(nominal);
            let generation = self.generation;
            self.timer = Some(IntervalTimer::start(period, move || on_tick(generation))?);
            debug!("refresh timer #{generation} every {period:?}");
        }
        Ok(())
    }

    /// Tears down any timer. Ticks it already queued become stale.
    pub fn stop(&mut self) {
        self.timer = None;
        self.generation += 1;
    }

    pub fn should_refresh(&self, trigger: RefreshTrigger) -> bool {
        match trigger {
            RefreshTrigger::Manual => true,
            RefreshTrigger::Hotplug => self.mode != RefreshMode::Manual,
            RefreshTrigger::Tick(generation) => {
                generation == self.generation && self.timer.is_some()
            }
        }
    }
}

impl fmt::Debug for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshPolicy")
            .field("mode", &self.mode)
            .field("generation", &self.generation)
            .field("timer", &self.timer.is_some())
            .finish()
    }
}
