//! The core, UI-agnostic library for the `inscribe` drive utility.
//!
//! `inscribe-core` coordinates the three destructive operations a user can run
//! against a removable drive: flashing an image, erasing and formatting. Any
//! front-end, whether the `inscribe` CLI or a graphical shell, drives it
//! through a single [`orchestrator::Orchestrator`]. The privileged work
//! happens behind the [`executor::Executor`] trait.
//!
//! The library is structured into several key modules:
//! - [`device`]: the `Device` record and the `lsblk` JSON parsers.
//! - [`executor`]: the boundary to the privileged side, plus its events.
//! - [`operation`]: the single-slot operation state machine.
//! - [`safety`]: the acknowledgment gate in front of destructive actions.
//! - [`progress`]: folds executor progress into one percent/speed view.
//! - [`registry`] and [`refresh`]: the device list and when it is reloaded.
//! - [`settings`]: typed, persisted preferences.
//! - [`preset`] and [`validation`]: image presets, checksums and post-flash
//!   sampling.
//! - [`platform`]: Linux block-device discovery.
//! - [`hotplug`]: the devices-changed signal, from udev or a sysfs poll.
//!
//! ## Example: Flashing an Image
//!
//! ```rust,no_run
//! use inscribe_core::helper::{HelperConfig, HelperExecutor};
//! use inscribe_core::orchestrator::{Notification, Orchestrator};
//! use inscribe_core::preset::PresetPipeline;
//! use inscribe_core::settings::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> inscribe_core::Result<()> {
//!     let executor = Arc::new(HelperExecutor::new(HelperConfig::default()));
//!     let mut orch = Orchestrator::new(executor, Box::new(MemoryStore::new()), PresetPipeline::new());
//!     orch.startup()?;
//!
//!     orch.open_flash("alpine.iso", "/dev/sdb")?;
//!     orch.confirm()?;
//!
//!     loop {
//!         orch.wait_event(Duration::from_millis(200));
//!         if let Some(percent) = orch.progress().percent() {
//!             println!("{percent}%");
//!         }
//!         for note in orch.drain_notifications() {
//!             if let Notification::Finished(report) = note {
//!                 println!("{:?}", report.outcome);
//!                 orch.shutdown();
//!                 return Ok(());
//!             }
//!         }
//!     }
//! }
//! ```

pub mod device;
pub mod error;
pub mod executor;
#[cfg(target_os = "linux")]
pub mod helper;
#[cfg(target_os = "linux")]
pub mod hotplug;
pub mod operation;
pub mod orchestrator;
pub mod platform;
pub mod preset;
pub mod progress;
pub mod refresh;
pub mod registry;
pub mod safety;
pub mod settings;
pub mod validation;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
