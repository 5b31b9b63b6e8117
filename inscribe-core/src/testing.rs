//! A scriptable in-memory executor for tests.
use crate::device::{Device, DeviceTree};
use crate::error::{Error, Result};
use crate::executor::{
    EventBus, EventHandler, EventKind, Executor, ExecutorEvent, RuntimeDependency, Subscription,
    TaskId,
};
use crate::operation::{EraseMode, Filesystem, OperationId};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A command the fake received, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ListDevices,
    DeviceDetails,
    Flash {
        image: PathBuf,
        device: PathBuf,
    },
    Erase {
        device: PathBuf,
        mode: EraseMode,
    },
    Format {
        device: PathBuf,
        filesystem: Filesystem,
        label: String,
    },
    Cancel,
    ComputeHash(PathBuf),
    Download {
        url: String,
        dest: PathBuf,
        expected: Option<String>,
    },
    ValidateSample {
        device: PathBuf,
        image: PathBuf,
        count: usize,
        size: usize,
    },
    EnsureSetup,
    CheckDependencies,
    InstallDependencies,
}

impl Command {
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            Command::Flash { .. } | Command::Erase { .. } | Command::Format { .. }
        )
    }
}

struct Script {
    commands: Vec<Command>,
    operations: Vec<OperationId>,
    devices: Vec<Device>,
    listing_error: Option<String>,
    start_error: Option<String>,
    task_error: Option<String>,
    hold_tasks: bool,
    held: Vec<ExecutorEvent>,
    hash: String,
    download_hash: String,
    validation: std::result::Result<bool, String>,
    dependencies: Vec<RuntimeDependency>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            operations: Vec::new(),
            devices: Vec::new(),
            listing_error: None,
            start_error: None,
            task_error: None,
            hold_tasks: false,
            held: Vec::new(),
            hash: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".into(),
            download_hash: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .into(),
            validation: Ok(true),
            dependencies: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct FakeExecutor {
    bus: EventBus,
    script: Mutex<Script>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, command: Command) {
        self.script().commands.push(command);
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        let mut script = self.script();
        script.devices = devices;
        script.listing_error = None;
    }

    pub fn fail_listing(&self, message: &str) {
        self.script().listing_error = Some(message.to_string());
    }

    pub fn fail_starts(&self, message: &str) {
        self.script().start_error = Some(message.to_string());
    }

    /// Makes hash, download and validation requests fail to start.
    pub fn fail_tasks(&self, message: &str) {
        self.script().task_error = Some(message.to_string());
    }

    /// Keeps task results back until [`FakeExecutor::release_tasks`].
    pub fn hold_tasks(&self) {
        self.script().hold_tasks = true;
    }

    /// Delivers every held task result. Returns how many there were.
    pub fn release_tasks(&self) -> usize {
        let held = {
            let mut script = self.script();
            script.hold_tasks = false;
            std::mem::take(&mut script.held)
        };
        let count = held.len();
        for event in held {
            self.bus.emit(event);
        }
        count
    }

    pub fn set_hash(&self, hash: &str) {
        self.script().hash = hash.to_string();
    }

    pub fn set_download_hash(&self, hash: &str) {
        self.script().download_hash = hash.to_string();
    }

    pub fn set_validation(&self, result: std::result::Result<bool, String>) {
        self.script().validation = result;
    }

    pub fn set_dependencies(&self, dependencies: Vec<RuntimeDependency>) {
        self.script().dependencies = dependencies;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.script().commands.clone()
    }

    /// The operation id passed with the most recent start command.
    pub fn last_operation(&self) -> Option<OperationId> {
        self.script().operations.last().copied()
    }

    pub fn start_count(&self) -> usize {
        self.script().commands.iter().filter(|c| c.is_start()).count()
    }

    pub fn clear_commands(&self) {
        self.script().commands.clear();
    }

    /// Delivers `event` to subscribers as the real executor would.
    pub fn emit(&self, event: ExecutorEvent) {
        self.bus.emit(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    fn start(&self, operation: OperationId, command: Command) -> Result<()> {
        let mut script = self.script();
        script.commands.push(command);
        script.operations.push(operation);
        match script.start_error.clone() {
            Some(message) => Err(Error::IoFailure(message)),
            None => Ok(()),
        }
    }

    /// Records `command` and answers with the event `answer` builds from
    /// the script, unless tasks are refused or held.
    fn task(&self, command: Command, answer: impl FnOnce(&Script) -> ExecutorEvent) -> Result<()> {
        let event = {
            let mut script = self.script();
            script.commands.push(command);
            if let Some(message) = script.task_error.clone() {
                return Err(Error::IoFailure(message));
            }
            let event = answer(&script);
            if script.hold_tasks {
                script.held.push(event);
                return Ok(());
            }
            event
        };
        self.bus.emit(event);
        Ok(())
    }
}

impl Executor for FakeExecutor {
    fn list_devices(&self) -> Result<Vec<Device>> {
        self.record(Command::ListDevices);
        let script = self.script();
        match &script.listing_error {
            Some(message) => Err(Error::IoFailure(message.clone())),
            None => Ok(script.devices.clone()),
        }
    }

    fn device_details(&self) -> Result<DeviceTree> {
        self.record(Command::DeviceDetails);
        Ok(DeviceTree::default())
    }

    fn start_flash(&self, operation: OperationId, image: &Path, device: &Path) -> Result<()> {
        self.start(
            operation,
            Command::Flash {
                image: image.to_path_buf(),
                device: device.to_path_buf(),
            },
        )
    }

    fn start_erase(&self, operation: OperationId, device: &Path, mode: EraseMode) -> Result<()> {
        self.start(
            operation,
            Command::Erase {
                device: device.to_path_buf(),
                mode,
            },
        )
    }

    fn start_format(
        &self,
        operation: OperationId,
        device: &Path,
        filesystem: Filesystem,
        label: &str,
    ) -> Result<()> {
        self.start(
            operation,
            Command::Format {
                device: device.to_path_buf(),
                filesystem,
                label: label.to_string(),
            },
        )
    }

    fn cancel_active_operation(&self) -> Result<()> {
        self.record(Command::Cancel);
        Ok(())
    }

    fn compute_hash(&self, task: TaskId, path: &Path) -> Result<()> {
        self.task(Command::ComputeHash(path.to_path_buf()), |script| {
            ExecutorEvent::HashComplete {
                task,
                result: Ok(script.hash.clone()),
            }
        })
    }

    fn download_with_hash(
        &self,
        task: TaskId,
        url: &str,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<()> {
        let command = Command::Download {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            expected: expected.map(str::to_string),
        };
        self.task(command, |script| ExecutorEvent::DownloadComplete {
            task,
            result: Ok(script.download_hash.clone()),
        })
    }

    fn validate_sample(
        &self,
        task: TaskId,
        device: &Path,
        image: &Path,
        sample_count: usize,
        sample_size: usize,
    ) -> Result<()> {
        let command = Command::ValidateSample {
            device: device.to_path_buf(),
            image: image.to_path_buf(),
            count: sample_count,
            size: sample_size,
        };
        self.task(command, |script| ExecutorEvent::ValidationComplete {
            task,
            result: script.validation.clone().map_err(Error::IoFailure),
        })
    }

    fn ensure_setup(&self) -> Result<bool> {
        self.record(Command::EnsureSetup);
        Ok(false)
    }

    fn check_runtime_dependencies(&self) -> Result<Vec<RuntimeDependency>> {
        self.record(Command::CheckDependencies);
        Ok(self.script().dependencies.clone())
    }

    fn install_runtime_dependencies(&self) -> Result<()> {
        self.record(Command::InstallDependencies);
        Ok(())
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.bus.subscribe(kind, handler)
    }
}
