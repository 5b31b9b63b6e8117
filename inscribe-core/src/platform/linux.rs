use crate::device::{self, Device, DeviceTree};
use crate::error::{Error, Result};
use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

const SYS_BLOCK: &str = "/sys/block";
const SECTOR_SIZE: u64 = 512;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from(SYS_BLOCK).join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Finds the whole disk a partition belongs to (e.g. `/dev/sda1` -> `/dev/sda`,
/// `/dev/nvme0n1p2` -> `/dev/nvme0n1`). Anything else is returned unchanged.
pub fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if ["/dev/sd", "/dev/vd", "/dev/xvd", "/dev/hd"]
        .iter()
        .any(|prefix| path_str.starts_with(prefix))
    {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            let suffix = &path_str[index + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// The whole disk holding the root filesystem.
pub fn system_disk() -> Result<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let name = disk.name().to_string_lossy();
            let path = if name.starts_with("/dev/") {
                PathBuf::from(name.to_string())
            } else {
                Path::new("/dev").join(&*name)
            };
            parent_device_path(&path)
        })
        .ok_or_else(|| Error::IoFailure("could not determine the system drive".into()))
}

/// Capacity of a whole disk from `/sys/block/<name>/size`.
pub fn device_size_bytes(device_name: &str) -> Result<u64> {
    let sectors = read_sys_file(device_name, "size")?
        .parse::<u64>()
        .map_err(|e| Error::IoFailure(format!("bad size for {device_name}: {e}")))?;
    Ok(sectors * SECTOR_SIZE)
}

pub fn is_block_device(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.file_type().is_block_device())
}

/// Names under `/sys/block`, loop and ram devices excluded, sorted.
pub fn block_device_names() -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(SYS_BLOCK)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| !["loop", "ram", "zram"].iter().any(|p| name.starts_with(p)))
        .collect();
    names.sort();
    Ok(names)
}

/// Raw `lsblk -J -O -b` output.
pub fn run_lsblk() -> Result<Vec<u8>> {
    let output = Command::new("lsblk").args(["-J", "-O", "-b"]).output()?;
    if !output.status.success() {
        return Err(Error::IoFailure(format!(
            "lsblk failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

pub fn list_devices() -> Result<Vec<Device>> {
    device::parse_device_list(&run_lsblk()?)
}

pub fn device_details() -> Result<DeviceTree> {
    device::parse_device_tree(&run_lsblk()?)
}

/// Looks `tool` up on `PATH`, returning the first executable match.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}
