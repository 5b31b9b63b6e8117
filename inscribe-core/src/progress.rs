//! Normalizes the two progress styles the executor reports into one
//! percentage and a smoothed throughput figure.
//!
//! Flash and erase report byte counts; format reports percentages, sometimes
//! with a status message. Byte counts with a known total give an exact
//! percentage. Bare percentages are clamped so the displayed value never goes
//! backwards. A percentage carrying a message is informational only.
use crate::executor::ExecutorEvent;
use std::time::Instant;

const MIB: f64 = 1024.0 * 1024.0;
/// Weight of the previous average in the speed EWMA.
const SPEED_DECAY: f64 = 0.7;

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Bytes {
        processed: u64,
        total: Option<u64>,
    },
    Percent {
        percent: u8,
        message: Option<String>,
    },
}

impl ProgressEvent {
    /// The progress carried by an executor event, if it is a progress event.
    pub fn from_executor(event: &ExecutorEvent) -> Option<Self> {
        match event {
            ExecutorEvent::FlashProgress {
                bytes_written,
                total_bytes,
            } => Some(ProgressEvent::Bytes {
                processed: *bytes_written,
                total: *total_bytes,
            }),
            ExecutorEvent::EraseProgress {
                bytes_processed,
                total_bytes,
            } => Some(ProgressEvent::Bytes {
                processed: *bytes_processed,
                total: *total_bytes,
            }),
            ExecutorEvent::FormatProgress { percent, message } => Some(ProgressEvent::Percent {
                percent: *percent,
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// The informational message of a percent event.
    pub fn message(&self) -> Option<&str> {
        match self {
            ProgressEvent::Percent {
                message: Some(msg), ..
            } if !msg.is_empty() => Some(msg.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressAggregator {
    bytes_processed: Option<u64>,
    total_bytes: Option<u64>,
    clamped_percent: Option<u8>,
    speed_mbs: Option<f64>,
    last_sample: Option<(u64, Instant)>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, event: &ProgressEvent, now: Instant) {
        match event {
            ProgressEvent::Bytes { processed, total } => {
                if total.is_some() {
                    self.total_bytes = *total;
                }
                self.bytes_processed = Some(*processed);
                self.sample_speed(*processed, now);
            }
            ProgressEvent::Percent { percent, .. } => {
                if event.message().is_some() {
                    return;
                }
                let next = (*percent).min(100);
                self.clamped_percent = Some(self.clamped_percent.map_or(next, |prev| prev.max(next)));
            }
        }
    }

    fn sample_speed(&mut self, bytes: u64, now: Instant) {
        if let Some((prev_bytes, prev_at)) = self.last_sample {
            let dt = now.saturating_duration_since(prev_at).as_secs_f64();
            // A shrinking byte count is not a sample; it must not drag the average.
            if dt > 0.0 && bytes >= prev_bytes {
                let instant = (bytes - prev_bytes) as f64 / MIB / dt;
                self.speed_mbs = Some(match self.speed_mbs {
                    None => instant,
                    Some(prev) => prev * SPEED_DECAY + instant * (1.0 - SPEED_DECAY),
                });
            }
        }
        self.last_sample = Some((bytes, now));
    }

    /// 0..=100, or `None` when nothing measurable has been reported.
    pub fn percent(&self) -> Option<u8> {
        match (self.bytes_processed, self.total_bytes) {
            (Some(bytes), Some(total)) if total > 0 => {
                let ratio = (bytes as f64 / total as f64 * 100.0).min(100.0);
                Some(ratio.round() as u8)
            }
            _ => self.clamped_percent,
        }
    }

    /// Smoothed throughput in MiB/s.
    pub fn speed_mbs(&self) -> Option<f64> {
        self.speed_mbs
    }

    pub fn bytes_processed(&self) -> Option<u64> {
        self.bytes_processed
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
