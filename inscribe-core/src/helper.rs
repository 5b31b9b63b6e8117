//! An [`Executor`] backed by a privileged helper program.
//!
//! Destructive work runs in a child process (`flash IMAGE DEV`,
//! `erase MODE DEV`, `format FS DEV LABEL`, `install-deps PKG...`), optionally
//! behind `sudo -n`. The helper reports progress on stderr: for flash and
//! erase a line whose first token is an integer is a byte count; for format
//! `PERCENT n` and `MSG text` lines carry the progress. Lines may end in `\r`
//! or `\n`.
//!
//! Hashing, downloads and sampled validation need no privileges. They run
//! in-process, each on its own worker thread, and answer with a completion
//! event. Hotplug comes from [`HotplugWatcher`].
use crate::device::{Device, DeviceTree};
use crate::error::{Error, Result};
use crate::executor::{
    Completion, EventBus, EventHandler, EventKind, Executor, ExecutorEvent, RuntimeDependency,
    Subscription, TaskId,
};
use crate::hotplug::HotplugWatcher;
use crate::operation::{EraseMode, Filesystem, OperationId, OperationKind};
use crate::platform;
use crate::validation;
use anyhow::Context;
use log::{debug, error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub const DEFAULT_HELPER: &str = "/usr/local/bin/inscribe-helper";

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB
const TAIL_LINES: usize = 200;
const END_OF_DEVICE: &str = "No space left on device";

/// Tools the helper shells out to, and the package providing each.
pub const RUNTIME_TOOLS: &[(&str, &str)] = &[
    ("lsblk", "util-linux"),
    ("dd", "coreutils"),
    ("blkdiscard", "util-linux"),
    ("wipefs", "util-linux"),
    ("sgdisk", "gdisk"),
    ("partprobe", "parted"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.exfat", "exfatprogs"),
    ("mkfs.ntfs", "ntfs-3g"),
];

#[derive(Clone, Debug)]
pub struct HelperConfig {
    pub program: PathBuf,
    /// Prefix every helper invocation with `sudo -n`.
    pub use_sudo: bool,
    pub hotplug_poll: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_HELPER),
            use_sudo: false,
            hotplug_poll: Duration::from_secs(2),
        }
    }
}

/// What a running helper child is doing, and how to read its output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Job {
    Flash { total: Option<u64> },
    Erase { total: Option<u64> },
    Format,
}

impl Job {
    fn kind(self) -> OperationKind {
        match self {
            Job::Flash { .. } => OperationKind::Flash,
            Job::Erase { .. } => OperationKind::Erase,
            Job::Format => OperationKind::Format,
        }
    }

    fn parse_progress(self, line: &str) -> Option<ExecutorEvent> {
        let line = line.trim();
        match self {
            Job::Flash { total } => {
                let bytes = leading_integer(line)?;
                Some(ExecutorEvent::FlashProgress {
                    bytes_written: bytes,
                    total_bytes: total,
                })
            }
            Job::Erase { total } => {
                let bytes = leading_integer(line)?;
                Some(ExecutorEvent::EraseProgress {
                    bytes_processed: bytes,
                    total_bytes: total,
                })
            }
            Job::Format => {
                if let Some(rest) = line.strip_prefix("PERCENT ") {
                    let percent = rest.trim().parse::<u64>().ok()?.min(100) as u8;
                    Some(ExecutorEvent::FormatProgress {
                        percent,
                        message: None,
                    })
                } else {
                    line.strip_prefix("MSG ").map(|msg| ExecutorEvent::FormatProgress {
                        percent: 0,
                        message: Some(msg.trim().to_string()),
                    })
                }
            }
        }
    }

    fn completion(
        self,
        operation: OperationId,
        exited_ok: bool,
        status: &str,
        tail: &OutputTail,
    ) -> Completion {
        if exited_ok {
            return Completion::success(operation);
        }
        // Zero and random erases run until the device is full.
        if matches!(self, Job::Erase { .. }) && tail.contains(END_OF_DEVICE) {
            return Completion::success(operation);
        }
        if tail.is_empty() {
            Completion::failure(operation, format!("helper exited with {status}"))
        } else {
            Completion::failure(operation, tail.joined())
        }
    }

    /// Progress pinned at the known total, sent after a successful run.
    fn final_progress(self) -> Option<ExecutorEvent> {
        match self {
            Job::Flash { total: Some(total) } => Some(ExecutorEvent::FlashProgress {
                bytes_written: total,
                total_bytes: Some(total),
            }),
            Job::Erase { total: Some(total) } => Some(ExecutorEvent::EraseProgress {
                bytes_processed: total,
                total_bytes: Some(total),
            }),
            _ => None,
        }
    }

    fn complete_event(self, completion: Completion) -> ExecutorEvent {
        match self {
            Job::Flash { .. } => ExecutorEvent::FlashComplete(completion),
            Job::Erase { .. } => ExecutorEvent::EraseComplete(completion),
            Job::Format => ExecutorEvent::FormatComplete(completion),
        }
    }
}

fn leading_integer(line: &str) -> Option<u64> {
    line.split_whitespace().next()?.parse().ok()
}

/// The last lines a helper printed, attached to failures.
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    limit: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Calls `on_line` for every non-empty line of `reader`, splitting on both
/// `\r` and `\n`.
fn for_each_line(mut reader: impl Read, mut on_line: impl FnMut(String)) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>| {
        if !line.is_empty() {
            on_line(String::from_utf8_lossy(line).into_owned());
            line.clear();
        }
    };
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                flush(&mut line);
            } else {
                line.push(byte);
            }
        }
    }
    flush(&mut line);
    Ok(())
}

/// Follows one helper child to completion, forwarding its progress. The
/// child is reaped even when its output cannot be read.
fn supervise(
    job: Job,
    operation: OperationId,
    mut child: Child,
    output: impl Read,
    bus: &EventBus,
) -> anyhow::Result<Completion> {
    let mut tail = OutputTail::new(TAIL_LINES);
    // `output` is closed once this returns, so the child cannot block on it.
    let read = for_each_line(output, |line| {
        match job.parse_progress(&line) {
            Some(event) => bus.emit(event),
            None => debug!("helper: {line}"),
        }
        tail.push(line);
    });
    let status = child.wait().context("waiting for the helper to exit")?;
    read.context("reading helper output")?;
    let completion = job.completion(operation, status.success(), &status.to_string(), &tail);
    if completion.ok {
        if let Some(event) = job.final_progress() {
            bus.emit(event);
        }
    }
    Ok(completion)
}

/// Streams `url` into `dest`, hashing as it goes.
fn fetch_to(url: &str, dest: &Path) -> anyhow::Result<String> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Option::<Duration>::None)
        .user_agent(concat!("inscribe/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = response.read(&mut buffer).context("reading response body")?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n])?;
    }
    file.flush()?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn download_checked(url: &str, dest: &Path, expected: Option<&str>) -> Result<String> {
    let actual = fetch_to(url, dest).map_err(|e| Error::NetworkFailure(format!("{e:#}")))?;
    if let Some(expected) = expected.map(str::trim).filter(|e| !e.is_empty()) {
        if !actual.eq_ignore_ascii_case(expected) {
            warn!("checksum mismatch for {}", dest.display());
            return Err(Error::ChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
    }
    info!("downloaded {url} to {}", dest.display());
    Ok(actual)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct HelperExecutor {
    config: HelperConfig,
    bus: EventBus,
    /// Pid of the running helper child, 0 when idle.
    active_pid: Arc<AtomicU32>,
    hotplug: Mutex<Option<HotplugWatcher>>,
}

impl HelperExecutor {
    pub fn new(config: HelperConfig) -> Self {
        Self {
            config,
            bus: EventBus::new(),
            active_pid: Arc::new(AtomicU32::new(0)),
            hotplug: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut cmd = if self.config.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.config.program);
            cmd
        } else {
            Command::new(&self.config.program)
        };
        cmd.args(args.into_iter().map(Into::into));
        cmd
    }

    /// Refuses anything but a block device that does not hold `/`.
    fn guard_target(&self, device: &Path) -> Result<()> {
        if !platform::is_block_device(device) {
            return Err(Error::PrecheckBlocked(format!(
                "{} is not a block device",
                device.display()
            )));
        }
        let system = platform::system_disk()?;
        if platform::parent_device_path(device) == system {
            return Err(Error::PrecheckBlocked(format!(
                "{} holds the running system",
                device.display()
            )));
        }
        Ok(())
    }

    /// Spawns the helper with `args` and follows it on a worker thread.
    fn launch(&self, job: Job, operation: OperationId, args: Vec<OsString>) -> Result<()> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        self.launch_command(job, operation, cmd)
    }

    fn launch_command(&self, job: Job, operation: OperationId, mut cmd: Command) -> Result<()> {
        if self.active_pid.load(Ordering::SeqCst) != 0 {
            return Err(Error::OperationInProgress(job.kind()));
        }
        let mut child = cmd.spawn().map_err(|e| {
            Error::IoFailure(format!(
                "cannot start {}: {e}",
                self.config.program.display()
            ))
        })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::IoFailure("helper stderr was not captured".into()))?;
        self.active_pid.store(child.id(), Ordering::SeqCst);
        info!("started {} helper {operation} (pid {})", job.kind(), child.id());

        let bus = self.bus.clone();
        let active_pid = Arc::clone(&self.active_pid);
        let spawned = thread::Builder::new()
            .name(format!("inscribe-{}", job.kind()))
            .spawn(move || {
                let completion =
                    supervise(job, operation, child, stderr, &bus).unwrap_or_else(|e| {
                        error!("{} helper failed: {e:#}", job.kind());
                        Completion::failure(operation, format!("{e:#}"))
                    });
                active_pid.store(0, Ordering::SeqCst);
                bus.emit(job.complete_event(completion));
            });
        if let Err(e) = spawned {
            self.active_pid.store(0, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    fn ensure_hotplug_watcher(&self) {
        let mut watcher = self.hotplug.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }
        let bus = self.bus.clone();
        let on_change = Arc::new(move || bus.emit(ExecutorEvent::DevicesChanged));
        match HotplugWatcher::start(self.config.hotplug_poll, on_change) {
            Ok(started) => {
                debug!("hotplug source: {}", started.source());
                *watcher = Some(started);
            }
            Err(e) => warn!("hotplug detection unavailable: {e}"),
        }
    }

    /// Runs `work` on its own thread and emits the event it returns.
    fn spawn_task(
        &self,
        name: &str,
        work: impl FnOnce() -> ExecutorEvent + Send + 'static,
    ) -> Result<()> {
        let bus = self.bus.clone();
        thread::Builder::new()
            .name(format!("inscribe-{name}"))
            .spawn(move || bus.emit(work()))?;
        Ok(())
    }
}

impl Default for HelperExecutor {
    fn default() -> Self {
        Self::new(HelperConfig::default())
    }
}

impl Executor for HelperExecutor {
    fn list_devices(&self) -> Result<Vec<Device>> {
        platform::list_devices()
    }

    fn device_details(&self) -> Result<DeviceTree> {
        platform::device_details()
    }

    fn start_flash(&self, operation: OperationId, image: &Path, device: &Path) -> Result<()> {
        let total = fs::metadata(image)
            .map_err(|e| Error::IoFailure(format!("cannot read {}: {e}", image.display())))?
            .len();
        self.guard_target(device)?;
        self.launch(
            Job::Flash { total: Some(total) },
            operation,
            vec!["flash".into(), image.into(), device.into()],
        )
    }

    fn start_erase(&self, operation: OperationId, device: &Path, mode: EraseMode) -> Result<()> {
        self.guard_target(device)?;
        let total = device
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| platform::device_size_bytes(name).ok());
        self.launch(
            Job::Erase { total },
            operation,
            vec!["erase".into(), mode.as_str().into(), device.into()],
        )
    }

    fn start_format(
        &self,
        operation: OperationId,
        device: &Path,
        filesystem: Filesystem,
        label: &str,
    ) -> Result<()> {
        self.guard_target(device)?;
        self.launch(
            Job::Format,
            operation,
            vec![
                "format".into(),
                filesystem.as_str().into(),
                device.into(),
                label.into(),
            ],
        )
    }

    fn cancel_active_operation(&self) -> Result<()> {
        let pid = self.active_pid.load(Ordering::SeqCst);
        if pid == 0 {
            debug!("cancel requested with no helper running");
            return Ok(());
        }
        let pid = i32::try_from(pid).map_err(|_| Error::IoFailure(format!("bad pid {pid}")))?;
        info!("sending SIGTERM to helper pid {pid}");
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| Error::IoFailure(format!("cannot signal helper: {e}")))
    }

    fn compute_hash(&self, task: TaskId, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.spawn_task("hash", move || ExecutorEvent::HashComplete {
            task,
            result: sha256_file(&path),
        })
    }

    fn download_with_hash(
        &self,
        task: TaskId,
        url: &str,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<()> {
        info!("downloading {url} to {}", dest.display());
        let url = url.to_string();
        let dest = dest.to_path_buf();
        let expected = expected.map(str::to_string);
        self.spawn_task("download", move || ExecutorEvent::DownloadComplete {
            task,
            result: download_checked(&url, &dest, expected.as_deref()),
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
        let device = device.to_path_buf();
        let image = image.to_path_buf();
        self.spawn_task("validate", move || ExecutorEvent::ValidationComplete {
            task,
            result: validation::compare_samples(&device, &image, sample_count, sample_size),
        })
    }

    fn ensure_setup(&self) -> Result<bool> {
        if platform::is_executable(&self.config.program) {
            Ok(false)
        } else {
            Err(Error::IoFailure(format!(
                "helper program {} is missing or not executable",
                self.config.program.display()
            )))
        }
    }

    fn check_runtime_dependencies(&self) -> Result<Vec<RuntimeDependency>> {
        Ok(RUNTIME_TOOLS
            .iter()
            .map(|(tool, package)| RuntimeDependency {
                package: package.to_string(),
                tool: tool.to_string(),
                installed: platform::find_in_path(tool).is_some(),
            })
            .collect())
    }

    fn install_runtime_dependencies(&self) -> Result<()> {
        let missing: BTreeSet<String> = self
            .check_runtime_dependencies()?
            .into_iter()
            .filter(|dep| !dep.installed)
            .map(|dep| dep.package)
            .collect();
        if missing.is_empty() {
            info!("all runtime dependencies are present");
            return Ok(());
        }
        info!("installing {missing:?}");
        let status = self
            .command(std::iter::once("install-deps".to_string()).chain(missing))
            .status()?;
        if !status.success() {
            return Err(Error::IoFailure(format!(
                "dependency installation exited with {status}"
            )));
        }
        Ok(())
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        if kind == EventKind::DevicesChanged {
            self.ensure_hotplug_watcher();
        }
        self.bus.subscribe(kind, handler)
    }
}
