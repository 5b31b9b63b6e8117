//! Sampled post-write validation.
//!
//! Reads a handful of byte ranges from the written device and the source
//! image and compares them. The comparison runs on the executor's side and
//! its verdict arrives later as a `validation-complete` event. A mismatch is
//! advisory: it is reported as a warning and never turns a completed flash
//! into a failure.
use crate::error::{Error, Result};
use crate::executor::{Executor, TaskId};
use log::{info, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const DEFAULT_SAMPLE_COUNT: usize = 3;
pub const DEFAULT_SAMPLE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub enabled: bool,
    pub sample_count: usize,
    pub sample_size: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_count: DEFAULT_SAMPLE_COUNT,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Skipped,
    Passed,
    Mismatch,
    /// The check itself could not run (e.g. the device vanished).
    Error(String),
}

impl ValidationOutcome {
    pub fn is_warning(&self) -> bool {
        matches!(self, ValidationOutcome::Mismatch | ValidationOutcome::Error(_))
    }

    /// The advisory error to surface, if any.
    pub fn as_error(&self, device: &Path) -> Option<Error> {
        match self {
            ValidationOutcome::Mismatch => Some(Error::ValidationFailure {
                device: device.display().to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationPipeline {
    pub policy: ValidationPolicy,
}

impl ValidationPipeline {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Hands the sampling to the executor. The verdict comes back as a
    /// `validation-complete` event for `task`.
    pub fn start(
        &self,
        executor: &dyn Executor,
        task: TaskId,
        device: &Path,
        image: &Path,
    ) -> Result<()> {
        info!("sampling {} against {}", device.display(), image.display());
        executor.validate_sample(
            task,
            device,
            image,
            self.policy.sample_count,
            self.policy.sample_size,
        )
    }

    /// Maps the executor's verdict. A disabled policy always yields `Skipped`.
    pub fn outcome(&self, device: &Path, result: Result<bool>) -> ValidationOutcome {
        if !self.policy.enabled {
            return ValidationOutcome::Skipped;
        }
        match result {
            Ok(true) => {
                info!("sampled validation of {} passed", device.display());
                ValidationOutcome::Passed
            }
            Ok(false) => {
                warn!("sampled validation of {} found a mismatch", device.display());
                ValidationOutcome::Mismatch
            }
            Err(err) => {
                warn!("sampled validation of {} could not run: {err}", device.display());
                ValidationOutcome::Error(err.to_string())
            }
        }
    }
}

/// Evenly spaced sample offsets: `i * (total / count)`, pulled back so that
/// a sample of `len` bytes always fits inside `total`.
pub fn sample_offsets(total: u64, count: usize, len: u64) -> Vec<u64> {
    if count == 0 || total == 0 {
        return Vec::new();
    }
    let stride = total / count as u64;
    let last_start = total.saturating_sub(len);
    (0..count as u64)
        .map(|i| (i * stride).min(last_start))
        .collect()
}

/// Compares `count` samples of `size` bytes between `device` and `image`.
/// Samples are shrunk to the image length; an empty image trivially matches.
pub fn compare_samples(device: &Path, image: &Path, count: usize, size: usize) -> Result<bool> {
    let mut image_file = File::open(image)?;
    let mut device_file = File::open(device)?;
    let total = image_file.metadata()?.len();
    let len = (size as u64).min(total);
    if len == 0 {
        return Ok(true);
    }

    let mut want = vec![0u8; len as usize];
    let mut got = vec![0u8; len as usize];
    for offset in sample_offsets(total, count, len) {
        read_at(&mut image_file, offset, &mut want)?;
        read_at(&mut device_file, offset, &mut got)?;
        if want != got {
            warn!("sample at offset {offset} differs");
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}
