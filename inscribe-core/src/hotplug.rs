//! Sources of the `devices-changed` signal.
//!
//! With the `hotplug` feature, the block subsystem is watched through a udev
//! monitor. Without it, or when no monitor can be opened (no netlink access
//! in a container, say), the names under `/sys/block` are polled instead.
use crate::error::Result;
use crate::platform;
use crate::refresh::IntervalTimer;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Called from the watcher thread whenever the set of block devices may have
/// changed.
pub type ChangeHandler = Arc<dyn Fn() + Send + Sync>;

/// A running watcher. Dropping it stops and joins its thread.
pub enum HotplugWatcher {
    #[cfg(feature = "hotplug")]
    Udev(udev_monitor::UdevWatcher),
    Poll(IntervalTimer),
}

impl HotplugWatcher {
    /// Starts the best source available.
    pub fn start(poll_period: Duration, on_change: ChangeHandler) -> Result<Self> {
        #[cfg(feature = "hotplug")]
        match udev_monitor::UdevWatcher::start(Arc::clone(&on_change)) {
            Ok(watcher) => return Ok(HotplugWatcher::Udev(watcher)),
            Err(e) => log::warn!("udev monitor unavailable, polling /sys/block instead: {e}"),
        }
        Self::poll(poll_period, on_change)
    }

    /// Compares the names under `/sys/block` every `period`.
    pub fn poll(period: Duration, on_change: ChangeHandler) -> Result<Self> {
        let mut known = platform::block_device_names().unwrap_or_default();
        let timer = IntervalTimer::start(period, move || match platform::block_device_names() {
            Ok(names) if names != known => {
                debug!("block devices changed: {names:?}");
                known = names;
                on_change();
            }
            Ok(_) => {}
            Err(e) => debug!("cannot scan block devices: {e}"),
        })?;
        info!("watching /sys/block every {period:?}");
        Ok(HotplugWatcher::Poll(timer))
    }

    pub fn source(&self) -> &'static str {
        match self {
            #[cfg(feature = "hotplug")]
            HotplugWatcher::Udev(_) => "udev",
            HotplugWatcher::Poll(_) => "sysfs",
        }
    }
}

#[cfg(feature = "hotplug")]
mod udev_monitor {
    use super::ChangeHandler;
    use crate::error::{Error, Result};
    use log::{debug, info};
    use std::io;
    use std::sync::mpsc::{self, RecvTimeoutError, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const IDLE: Duration = Duration::from_millis(100);

    /// Drains a udev monitor on the block subsystem. The monitor socket is
    /// opened and used only on the watcher thread.
    pub struct UdevWatcher {
        stop: Option<Sender<()>>,
        handle: Option<JoinHandle<()>>,
    }

    impl UdevWatcher {
        pub fn start(on_change: ChangeHandler) -> Result<Self> {
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<()>>(1);
            let handle = thread::Builder::new()
                .name("inscribe-udev".into())
                .spawn(move || {
                    let opened = udev::MonitorBuilder::new()
                        .and_then(|builder| builder.match_subsystem("block"))
                        .and_then(|builder| builder.listen());
                    let mut monitor = match opened {
                        Ok(monitor) => {
                            let _ = ready_tx.send(Ok(()));
                            monitor
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    loop {
                        let mut changed = false;
                        for event in &mut monitor {
                            debug!(
                                "udev {:?} {}",
                                event.event_type(),
                                event.device().sysname().to_string_lossy()
                            );
                            changed = true;
                        }
                        if changed {
                            on_change();
                        }
                        match stop_rx.recv_timeout(IDLE) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })?;
            match ready_rx.recv() {
                Ok(Ok(())) => {
                    info!("watching the block subsystem through udev");
                    Ok(Self {
                        stop: Some(stop_tx),
                        handle: Some(handle),
                    })
                }
                Ok(Err(e)) => {
                    let _ = handle.join();
                    Err(e.into())
                }
                Err(_) => {
                    let _ = handle.join();
                    Err(Error::IoFailure("udev watcher exited during startup".into()))
                }
            }
        }
    }

    impl Drop for UdevWatcher {
        fn drop(&mut self) {
            drop(self.stop.take());
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
