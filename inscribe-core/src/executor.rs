//! The boundary to the executor: the privileged component that performs the
//! actual device I/O.
//!
//! Commands are plain method calls on [`Executor`]. Long-running commands
//! (`start_*`, hashing, downloads and sampled validation) return as soon as
//! the work has been handed off; progress and completion come back later as
//! [`ExecutorEvent`]s delivered to handlers registered with
//! [`Executor::subscribe`]. Each registration is owned by the returned
//! [`Subscription`], which unregisters the handler when dropped.
use crate::device::{Device, DeviceTree};
use crate::error::Result;
use crate::operation::{EraseMode, Filesystem, OperationId, OperationKind};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// The outcome carried by a `*-complete` event, tagged with the operation it
/// belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub operation: OperationId,
    pub ok: bool,
    pub error: Option<String>,
}

impl Completion {
    pub fn success(operation: OperationId) -> Self {
        Self {
            operation,
            ok: true,
            error: None,
        }
    }

    pub fn failure(operation: OperationId, error: impl Into<String>) -> Self {
        Self {
            operation,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Identifies one hash, download or validation handed to the executor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}", self.0)
    }
}

/// Names of the events an executor can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    FlashProgress,
    EraseProgress,
    FormatProgress,
    FlashComplete,
    EraseComplete,
    FormatComplete,
    HashComplete,
    DownloadComplete,
    ValidationComplete,
    DevicesChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::FlashProgress,
        EventKind::EraseProgress,
        EventKind::FormatProgress,
        EventKind::FlashComplete,
        EventKind::EraseComplete,
        EventKind::FormatComplete,
        EventKind::HashComplete,
        EventKind::DownloadComplete,
        EventKind::ValidationComplete,
        EventKind::DevicesChanged,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::FlashProgress => "flash-progress",
            EventKind::EraseProgress => "erase-progress",
            EventKind::FormatProgress => "format-progress",
            EventKind::FlashComplete => "flash-complete",
            EventKind::EraseComplete => "erase-complete",
            EventKind::FormatComplete => "format-complete",
            EventKind::HashComplete => "hash-complete",
            EventKind::DownloadComplete => "download-complete",
            EventKind::ValidationComplete => "validation-complete",
            EventKind::DevicesChanged => "devices-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutorEvent {
    FlashProgress {
        bytes_written: u64,
        total_bytes: Option<u64>,
    },
    EraseProgress {
        bytes_processed: u64,
        total_bytes: Option<u64>,
    },
    FormatProgress {
        percent: u8,
        message: Option<String>,
    },
    FlashComplete(Completion),
    EraseComplete(Completion),
    FormatComplete(Completion),
    /// Lowercase hex SHA-256 of a local file.
    HashComplete {
        task: TaskId,
        result: Result<String>,
    },
    /// A download finished; `result` is the SHA-256 of what was written.
    DownloadComplete {
        task: TaskId,
        result: Result<String>,
    },
    /// `Ok(true)` when every sample matched.
    ValidationComplete {
        task: TaskId,
        result: Result<bool>,
    },
    /// Hotplug signal: the set of block devices may have changed.
    DevicesChanged,
}

impl ExecutorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ExecutorEvent::FlashProgress { .. } => EventKind::FlashProgress,
            ExecutorEvent::EraseProgress { .. } => EventKind::EraseProgress,
            ExecutorEvent::FormatProgress { .. } => EventKind::FormatProgress,
            ExecutorEvent::FlashComplete(_) => EventKind::FlashComplete,
            ExecutorEvent::EraseComplete(_) => EventKind::EraseComplete,
            ExecutorEvent::FormatComplete(_) => EventKind::FormatComplete,
            ExecutorEvent::HashComplete { .. } => EventKind::HashComplete,
            ExecutorEvent::DownloadComplete { .. } => EventKind::DownloadComplete,
            ExecutorEvent::ValidationComplete { .. } => EventKind::ValidationComplete,
            ExecutorEvent::DevicesChanged => EventKind::DevicesChanged,
        }
    }

    /// The operation this event reports on, if any.
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            ExecutorEvent::FlashProgress { .. } | ExecutorEvent::FlashComplete(_) => {
                Some(OperationKind::Flash)
            }
            ExecutorEvent::EraseProgress { .. } | ExecutorEvent::EraseComplete(_) => {
                Some(OperationKind::Erase)
            }
            ExecutorEvent::FormatProgress { .. } | ExecutorEvent::FormatComplete(_) => {
                Some(OperationKind::Format)
            }
            _ => None,
        }
    }

    /// The task this event finishes, if it is a task completion.
    pub fn task(&self) -> Option<TaskId> {
        match self {
            ExecutorEvent::HashComplete { task, .. }
            | ExecutorEvent::DownloadComplete { task, .. }
            | ExecutorEvent::ValidationComplete { task, .. } => Some(*task),
            _ => None,
        }
    }
}

/// A tool the executor shells out to, and whether it is installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeDependency {
    pub package: String,
    pub tool: String,
    pub installed: bool,
}

pub type EventHandler = Box<dyn Fn(ExecutorEvent) + Send + Sync>;

/// Keeps an event handler registered for as long as it is alive.
pub struct Subscription {
    kind: EventKind,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(kind: EventKind, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            kind,
            release: Some(Box::new(release)),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Unregisters the handler now rather than at drop.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// The command surface the orchestrator needs from an executor.
pub trait Executor: Send + Sync {
    fn list_devices(&self) -> Result<Vec<Device>>;
    fn device_details(&self) -> Result<DeviceTree>;

    /// The completion event carries `operation` back.
    fn start_flash(&self, operation: OperationId, image: &Path, device: &Path) -> Result<()>;
    fn start_erase(&self, operation: OperationId, device: &Path, mode: EraseMode) -> Result<()>;
    fn start_format(
        &self,
        operation: OperationId,
        device: &Path,
        filesystem: Filesystem,
        label: &str,
    ) -> Result<()>;
    /// Asks the active operation to stop. Completion still arrives as an event.
    fn cancel_active_operation(&self) -> Result<()>;

    /// Hashes `path` in the background and answers with `hash-complete`.
    fn compute_hash(&self, task: TaskId, path: &Path) -> Result<()>;
    /// Downloads `url` to `dest` in the background and answers with
    /// `download-complete`.
    fn download_with_hash(
        &self,
        task: TaskId,
        url: &str,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<()>;
    /// Compares samples of `device` and `image` in the background and answers
    /// with `validation-complete`.
    fn validate_sample(
        &self,
        task: TaskId,
        device: &Path,
        image: &Path,
        sample_count: usize,
        sample_size: usize,
    ) -> Result<()>;

    /// Returns `true` if setup changed anything.
    fn ensure_setup(&self) -> Result<bool>;
    fn check_runtime_dependencies(&self) -> Result<Vec<RuntimeDependency>>;
    fn install_runtime_dependencies(&self) -> Result<()>;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription;
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: BTreeMap<u64, (EventKind, Arc<dyn Fn(ExecutorEvent) + Send + Sync>)>,
}

/// Fan-out of executor events to subscribed handlers.
///
/// Executors embed one of these and forward [`Executor::subscribe`] to it.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.insert(id, (kind, Arc::from(handler)));
            id
        };
        let inner = Arc::clone(&self.inner);
        Subscription::new(kind, move || {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handlers
                .remove(&id);
        })
    }

    /// Delivers `event` to every handler subscribed to its kind.
    pub fn emit(&self, event: ExecutorEvent) {
        let kind = event.kind();
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let targets: Vec<_> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner
                .handlers
                .values()
                .filter(|(k, _)| *k == kind)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in targets {
            handler(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}
