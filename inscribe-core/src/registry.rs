//! The last known device inventory.
//!
//! Every refresh replaces the whole snapshot. Nothing is merged, so a path
//! that vanished from the executor's list is simply gone. A failed refresh
//! keeps the previous snapshot in place.
use crate::device::{Device, DeviceNode, DeviceTree};
use crate::error::Result;
use crate::executor::Executor;
use log::{debug, warn};
use std::path::Path;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    details: Option<DeviceTree>,
    last_error: Option<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a fresh device list (and, best effort, the detail tree) and
    /// swaps it in. On error the previous snapshot is retained.
    pub fn refresh(&mut self, executor: &dyn Executor) -> Result<&[Device]> {
        let devices = match executor.list_devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("device refresh failed, keeping {} known devices: {err}", self.devices.len());
                self.last_error = Some(err.to_string());
                return Err(err);
            }
        };
        let details = match executor.device_details() {
            Ok(tree) => Some(tree),
            Err(err) => {
                warn!("device details unavailable: {err}");
                None
            }
        };
        debug!("registry now holds {} devices", devices.len());
        self.devices = devices;
        self.details = details;
        self.last_error = None;
        Ok(&self.devices)
    }

    /// The full snapshot, risky devices included.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// What a device picker should offer.
    pub fn visible(&self, hide_internal: bool) -> Vec<&Device> {
        self.devices
            .iter()
            .filter(|d| !(hide_internal && d.is_risky()))
            .collect()
    }

    pub fn find(&self, path: &Path) -> Option<&Device> {
        self.devices.iter().find(|d| d.path == path)
    }

    pub fn details(&self) -> Option<&DeviceTree> {
        self.details.as_ref()
    }

    pub fn details_for(&self, path: &Path) -> Option<&DeviceNode> {
        self.details.as_ref()?.get(path)
    }

    /// The error of the most recent refresh, cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
