//! Block devices as the rest of the core sees them.
//!
//! The executor reports devices using the JSON shape of `lsblk -J -O -b`. This
//! module turns that into [`Device`] values for the registry and into a
//! [`DeviceTree`] (disks with their partitions) for the detail view. The
//! parsing is deliberately lenient: `lsblk` has changed the types of `size`,
//! `rm` and the mount point fields across util-linux releases.
use crate::error::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// How a device is attached to the machine.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Usb,
    Sata,
    Ata,
    Nvme,
    Mmc,
    Scsi,
    Virtio,
    Other(String),
    Unknown,
}

impl Transport {
    /// Parses the `tran` column of `lsblk`. Missing or blank values are `Unknown`.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Transport::Unknown;
        };
        match raw.to_ascii_lowercase().as_str() {
            "usb" => Transport::Usb,
            "sata" => Transport::Sata,
            "ata" => Transport::Ata,
            "nvme" => Transport::Nvme,
            "mmc" => Transport::Mmc,
            "scsi" | "sas" => Transport::Scsi,
            "virtio" => Transport::Virtio,
            other => Transport::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Transport::Usb => "usb",
            Transport::Sata => "sata",
            Transport::Ata => "ata",
            Transport::Nvme => "nvme",
            Transport::Mmc => "mmc",
            Transport::Scsi => "scsi",
            Transport::Virtio => "virtio",
            Transport::Other(name) => name,
            Transport::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a whole-disk block device discovered by the executor.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The stable device node (e.g. `/dev/sdb`). Identity of the device.
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g. "sdb").
    pub name: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    /// Total capacity in bytes.
    pub size_bytes: u64,
    pub transport: Transport,
    pub removable: bool,
}

impl Device {
    /// A device is risky when it looks internal: not removable and not on USB.
    pub fn is_risky(&self) -> bool {
        !self.removable && self.transport != Transport::Usb
    }

    /// Vendor, then model, then kernel name.
    pub fn label(&self) -> &str {
        self.vendor
            .as_deref()
            .or(self.model.as_deref())
            .unwrap_or(&self.name)
    }

    pub fn size_gib(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let risk = if self.is_risky() { " [INTERNAL]" } else { "" };
        write!(
            f,
            "{:<15} {:>8.2} GiB  {:<24} {}{}",
            self.path.display(),
            self.size_gib(),
            self.label(),
            self.transport,
            risk
        )
    }
}

/// One node of the detail tree: a disk or one of its partitions.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceNode {
    pub name: String,
    pub path: PathBuf,
    /// `lsblk`'s `type` column: "disk", "part", "crypt", ...
    pub kind: String,
    pub size_bytes: Option<u64>,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub mountpoints: Vec<String>,
    pub children: Vec<DeviceNode>,
}

/// Disks and their partitions, keyed by disk path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceTree {
    disks: BTreeMap<PathBuf, DeviceNode>,
}

impl DeviceTree {
    pub fn get(&self, path: &Path) -> Option<&DeviceNode> {
        self.disks.get(path)
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceNode> {
        self.disks.values()
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    name: String,
    path: Option<String>,
    size: Option<Value>,
    rm: Option<Value>,
    tran: Option<String>,
    model: Option<String>,
    vendor: Option<String>,
    serial: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(default)]
    children: Vec<RawNode>,
}

impl RawNode {
    fn path(&self) -> PathBuf {
        match &self.path {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from("/dev/").join(&self.name),
        }
    }

    fn is_disk(&self) -> bool {
        self.kind.as_deref() == Some("disk")
            && !["loop", "zram", "ram"]
                .iter()
                .any(|prefix| self.name.starts_with(prefix))
    }

    fn into_node(self) -> DeviceNode {
        let path = self.path();
        let mut mountpoints: Vec<String> = self
            .mountpoints
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter(|mp| !mp.is_empty())
            .collect();
        if let Some(mp) = self.mountpoint.filter(|mp| !mp.is_empty()) {
            if !mountpoints.contains(&mp) {
                mountpoints.push(mp);
            }
        }
        DeviceNode {
            name: self.name,
            path,
            kind: self.kind.unwrap_or_default(),
            size_bytes: self.size.as_ref().and_then(value_to_u64),
            fstype: clean(self.fstype),
            label: clean(self.label),
            mountpoints,
            children: self.children.into_iter().map(RawNode::into_node).collect(),
        }
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64() == Some(1),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

/// Parses `lsblk -J -O -b` output into the whole-disk devices it lists.
pub fn parse_device_list(json: &[u8]) -> Result<Vec<Device>> {
    let output: LsblkOutput = serde_json::from_slice(json)?;
    let devices = output
        .blockdevices
        .into_iter()
        .filter(RawNode::is_disk)
        .map(|node| Device {
            path: node.path(),
            removable: node.rm.as_ref().is_some_and(value_to_bool),
            size_bytes: node.size.as_ref().and_then(value_to_u64).unwrap_or(0),
            transport: Transport::parse(node.tran.as_deref()),
            vendor: clean(node.vendor),
            model: clean(node.model),
            serial: clean(node.serial),
            name: node.name,
        })
        .collect();
    Ok(devices)
}

/// Parses `lsblk -J -O -b` output into the disk → partition tree.
pub fn parse_device_tree(json: &[u8]) -> Result<DeviceTree> {
    let output: LsblkOutput = serde_json::from_slice(json)?;
    let disks = output
        .blockdevices
        .into_iter()
        .filter(RawNode::is_disk)
        .map(|node| {
            let node = node.into_node();
            (node.path.clone(), node)
        })
        .collect();
    Ok(DeviceTree { disks })
}
