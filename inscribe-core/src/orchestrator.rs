//! The coordinator every front-end drives.
//!
//! [`Orchestrator`] owns the settings, the device registry, the refresh
//! policy and the single operation slot. It runs on the caller's thread:
//! executor events and refresh ticks are queued by their producers and only
//! applied when the front-end calls [`Orchestrator::pump`] or
//! [`Orchestrator::wait_event`]. Nothing here blocks on a long-running
//! device operation, a download, a hash or a sampled validation: each is
//! handed to the executor and its result arrives as an event.
use crate::device::{Device, DeviceNode, DeviceTree};
use crate::error::{Error, Result};
use crate::executor::{
    Completion, EventKind, Executor, ExecutorEvent, RuntimeDependency, Subscription, TaskId,
};
use crate::operation::{
    EraseMode, Filesystem, Operation, OperationId, OperationKind, OperationMachine,
    OperationRequest, OperationState, Outcome,
};
use crate::preset::{self, Preset, PresetPipeline, ResolvedPreset};
use crate::progress::{ProgressAggregator, ProgressEvent};
use crate::refresh::{RefreshMode, RefreshPolicy, RefreshTrigger};
use crate::registry::DeviceRegistry;
use crate::safety::{ConfirmationRequest, SafetyGate};
use crate::settings::{PostAction, SettingKey, Settings, SettingsStore};
use crate::validation::{ValidationOutcome, ValidationPipeline, ValidationPolicy};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// The screen a front-end should be showing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Flash,
    Format,
    Erase,
    Devices,
    Logs,
    Settings,
}

/// What happened to one operation, delivered exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationReport {
    pub id: OperationId,
    pub kind: OperationKind,
    pub outcome: Outcome,
    /// Set only for flashes that went through sampled validation.
    pub validation: Option<ValidationOutcome>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Info(String),
    Success(String),
    Warning(String),
    Error(String),
    Finished(OperationReport),
    TaskFinished(TaskReport),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    /// Time since the session started.
    pub elapsed: Duration,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>9.3}s] {}", self.elapsed.as_secs_f64(), self.text)
    }
}

/// The in-memory session log. Never persisted.
#[derive(Debug)]
pub struct SessionLog {
    started: Instant,
    lines: Vec<LogLine>,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            lines: Vec::new(),
        }
    }

    fn push(&mut self, text: impl Into<String>) {
        let text = text.into();
        debug!("session: {text}");
        self.lines.push(LogLine {
            elapsed: self.started.elapsed(),
            text,
        });
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutput {
    Hashed { path: PathBuf, sha256: String },
    Downloaded(DownloadedImage),
}

/// What happened to one hash or download, delivered exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskReport {
    pub task: TaskId,
    pub result: Result<TaskOutput>,
}

/// Work handed to the executor whose result has not arrived yet.
#[derive(Clone, Debug)]
enum PendingTask {
    Hash {
        path: PathBuf,
        expected: Option<String>,
    },
    Download {
        dest: PathBuf,
        expected: Option<String>,
    },
    Validation {
        operation: OperationId,
        device: PathBuf,
    },
}

enum Inbound {
    Executor(ExecutorEvent),
    RefreshTick(u64),
}

pub struct Orchestrator {
    executor: Arc<dyn Executor>,
    store: Box<dyn SettingsStore>,
    settings: Settings,
    registry: DeviceRegistry,
    refresh: RefreshPolicy,
    gate: SafetyGate,
    machine: OperationMachine,
    progress: ProgressAggregator,
    validation: ValidationPipeline,
    presets: PresetPipeline,
    confirmation: Option<ConfirmationRequest>,
    expected_hash: Option<String>,
    tasks: HashMap<TaskId, PendingTask>,
    last_task: u64,
    log: SessionLog,
    notifications: VecDeque<Notification>,
    view: View,
    inbox_tx: Sender<Inbound>,
    inbox: Receiver<Inbound>,
    subscriptions: Vec<Subscription>,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<dyn Executor>,
        store: Box<dyn SettingsStore>,
        presets: PresetPipeline,
    ) -> Self {
        let settings = Settings::load(store.as_ref());
        let validation = ValidationPipeline::new(ValidationPolicy {
            enabled: settings.validate_after_flash,
            ..ValidationPolicy::default()
        });
        let (inbox_tx, inbox) = mpsc::channel();
        Self {
            executor,
            store,
            settings,
            registry: DeviceRegistry::new(),
            refresh: RefreshPolicy::new(),
            gate: SafetyGate,
            machine: OperationMachine::new(),
            progress: ProgressAggregator::new(),
            validation,
            presets,
            confirmation: None,
            expected_hash: None,
            tasks: HashMap::new(),
            last_task: 0,
            log: SessionLog::new(),
            notifications: VecDeque::new(),
            view: View::default(),
            inbox_tx,
            inbox,
            subscriptions: Vec::new(),
        }
    }

    /// Subscribes to the executor, starts the refresh policy, checks the
    /// executor setup and loads the first device snapshot.
    pub fn startup(&mut self) -> Result<()> {
        self.subscriptions.clear();
        for kind in EventKind::ALL {
            let tx = self.inbox_tx.clone();
            let subscription = self.executor.subscribe(
                kind,
                Box::new(move |event| {
                    let _ = tx.send(Inbound::Executor(event));
                }),
            );
            self.subscriptions.push(subscription);
        }
        self.apply_refresh_mode()?;
        // Both failures below are already surfaced as notifications.
        let _ = self.ensure_setup();
        let _ = self.refresh_now();
        Ok(())
    }

    /// Checks the executor is ready to run operations. Returns whether
    /// anything had to change.
    pub fn ensure_setup(&mut self) -> Result<bool> {
        match self.executor.ensure_setup() {
            Ok(changed) => {
                if changed {
                    self.notify(Notification::Info("executor setup updated".into()));
                }
                Ok(changed)
            }
            Err(e) => {
                warn!("executor setup incomplete: {e}");
                self.notify(Notification::Warning(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops the refresh timer and releases every executor subscription.
    pub fn shutdown(&mut self) {
        self.refresh.stop();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        info!("orchestrator shut down");
    }

    fn apply_refresh_mode(&mut self) -> Result<()> {
        let tx = self.inbox_tx.clone();
        self.refresh.apply(self.settings.refresh_mode, move |generation| {
            let _ = tx.send(Inbound::RefreshTick(generation));
        })
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push_back(notification);
    }

    // --- devices ---------------------------------------------------------

    /// Refreshes on explicit user request, whatever the refresh mode.
    pub fn refresh_devices(&mut self) -> Result<()> {
        self.refresh_on(RefreshTrigger::Manual)
    }

    fn refresh_on(&mut self, trigger: RefreshTrigger) -> Result<()> {
        if !self.refresh.should_refresh(trigger) {
            debug!("ignoring {trigger:?} in {} mode", self.refresh.mode());
            return Ok(());
        }
        self.refresh_now()
    }

    fn refresh_now(&mut self) -> Result<()> {
        match self.registry.refresh(self.executor.as_ref()) {
            Ok(devices) => {
                let count = devices.len();
                self.log.push(format!("found {count} device(s)"));
                if let Err(e) = self.reclassify_target() {
                    self.notify(Notification::Warning(e.to_string()));
                }
                Ok(())
            }
            Err(e) => {
                self.log.push(format!("device refresh failed: {e}"));
                self.notify(Notification::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Devices a picker should offer, honoring the hide-internal setting.
    pub fn devices(&self) -> Vec<&Device> {
        self.registry.visible(self.settings.hide_internal_devices)
    }

    pub fn all_devices(&self) -> &[Device] {
        self.registry.devices()
    }

    pub fn device_details(&self) -> Option<&DeviceTree> {
        self.registry.details()
    }

    /// The partition tree under one disk.
    pub fn device_details_for(&self, path: &Path) -> Option<&DeviceNode> {
        self.registry.details_for(path)
    }

    // --- the operation lifecycle ----------------------------------------

    pub fn open_flash(&mut self, image: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Result<OperationId> {
        self.open(OperationRequest::Flash {
            image: image.into(),
            device: device.into(),
        })
    }

    /// `mode` defaults to the configured erase mode.
    pub fn open_erase(&mut self, device: impl Into<PathBuf>, mode: Option<EraseMode>) -> Result<OperationId> {
        self.open(OperationRequest::Erase {
            device: device.into(),
            mode: mode.unwrap_or(self.settings.erase_mode),
        })
    }

    pub fn open_format(
        &mut self,
        device: impl Into<PathBuf>,
        filesystem: Filesystem,
        label: impl Into<String>,
    ) -> Result<OperationId> {
        self.open(OperationRequest::Format {
            device: device.into(),
            filesystem,
            label: label.into(),
        })
    }

    fn open(&mut self, request: OperationRequest) -> Result<OperationId> {
        if !self.machine.can_start() {
            return Err(self.machine.busy_error());
        }
        let device = self
            .registry
            .find(request.device())
            .cloned()
            .ok_or_else(|| {
                Error::PrecheckBlocked(format!(
                    "{} is not a known device; refresh the device list",
                    request.device().display()
                ))
            })?;
        let id = self.machine.open(request.clone())?;
        self.confirmation = Some(self.gate.prepare(request, &device));
        Ok(id)
    }

    pub fn confirmation(&self) -> Option<&ConfirmationRequest> {
        self.confirmation.as_ref()
    }

    /// Where the dialog records the checkbox and the typed phrase.
    pub fn confirmation_mut(&mut self) -> Option<&mut ConfirmationRequest> {
        self.confirmation.as_mut()
    }

    /// Whether the confirm control is enabled.
    pub fn can_confirm(&self) -> bool {
        self.machine.state() == OperationState::AwaitingConfirmation
            && self
                .confirmation
                .as_ref()
                .is_some_and(|c| c.is_satisfied() && self.target_unchanged(c))
    }

    /// The target is still known, with the risk the dialog was built for.
    fn target_unchanged(&self, confirmation: &ConfirmationRequest) -> bool {
        self.registry
            .find(confirmation.request.device())
            .is_some_and(|device| self.gate.classify(device).risky == confirmation.risky)
    }

    /// Rebuilds the open confirmation when its target's risk class differs in
    /// the current snapshot, dropping whatever was already acknowledged.
    fn reclassify_target(&mut self) -> Result<()> {
        let Some(confirmation) = self.confirmation.as_ref() else {
            return Ok(());
        };
        let Some(device) = self.registry.find(confirmation.request.device()) else {
            return Ok(());
        };
        if self.gate.classify(device).risky == confirmation.risky {
            return Ok(());
        }
        let rebuilt = self.gate.prepare(confirmation.request.clone(), device);
        let path = device.path.display().to_string();
        warn!("{path} changed while awaiting confirmation");
        self.confirmation = Some(rebuilt);
        Err(Error::PrecheckBlocked(format!(
            "{path} changed since it was selected; acknowledge the risk again"
        )))
    }

    /// Looks the target up in the current snapshot before anything starts.
    fn recheck_target(&mut self) -> Result<()> {
        let Some(confirmation) = self.confirmation.as_ref() else {
            return Err(Error::InvalidTransition("no confirmation is open".into()));
        };
        let path = confirmation.request.device();
        if self.registry.find(path).is_none() {
            return Err(Error::PrecheckBlocked(format!(
                "{} is no longer present; refresh the device list",
                path.display()
            )));
        }
        self.reclassify_target()
    }

    /// Passes the safety gate and issues the single start command.
    pub fn confirm(&mut self) -> Result<OperationId> {
        self.recheck_target()?;
        let confirmation = self
            .confirmation
            .as_ref()
            .ok_or_else(|| Error::InvalidTransition("no confirmation is open".into()))?;
        self.gate.evaluate(confirmation)?;
        let request = self.machine.confirm()?;
        self.confirmation = None;
        self.progress.reset();
        let id = self.machine.current().id;

        info!("starting {request}");
        self.log.push(format!("started {request}"));
        let started = match &request {
            OperationRequest::Flash { image, device } => {
                self.executor.start_flash(id, image, device)
            }
            OperationRequest::Erase { device, mode } => {
                self.executor.start_erase(id, device, *mode)
            }
            OperationRequest::Format {
                device,
                filesystem,
                label,
            } => self.executor.start_format(id, device, *filesystem, label),
        };
        if let Err(e) = started {
            error!("{} could not start: {e}", request.kind());
            self.machine.fail_to_start(&e);
            self.finish(Outcome::Failed(e.to_string()));
            return Err(e);
        }
        Ok(id)
    }

    /// Closes the confirmation dialog without starting anything.
    pub fn dismiss(&mut self) -> Result<()> {
        self.machine.dismiss()?;
        self.confirmation = None;
        Ok(())
    }

    /// Asks the executor to stop. The outcome still arrives as a completion.
    pub fn cancel(&mut self) -> Result<()> {
        self.machine.request_cancel()?;
        self.log.push("cancel requested");
        if let Err(e) = self.executor.cancel_active_operation() {
            error!("cancel failed: {e}");
            self.notify(Notification::Error(format!("could not cancel: {e}")));
            return Err(e);
        }
        Ok(())
    }

    /// Returns the finished operation and frees the slot.
    pub fn acknowledge(&mut self) -> Result<Operation> {
        let finished = self.machine.acknowledge()?;
        self.progress.reset();
        Ok(finished)
    }

    // --- events -----------------------------------------------------------

    /// Applies every queued event. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(inbound) = self.inbox.try_recv() {
            self.dispatch(inbound);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for the next event, then drains the queue.
    pub fn wait_event(&mut self, timeout: Duration) -> usize {
        match self.inbox.recv_timeout(timeout) {
            Ok(inbound) => {
                self.dispatch(inbound);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Executor(event) => self.handle_event(event),
            Inbound::RefreshTick(generation) => {
                let _ = self.refresh_on(RefreshTrigger::Tick(generation));
            }
        }
    }

    pub fn handle_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::DevicesChanged => {
                self.log.push("device change detected");
                let _ = self.refresh_on(RefreshTrigger::Hotplug);
            }
            ExecutorEvent::FlashComplete(completion) => {
                self.on_completion(OperationKind::Flash, completion)
            }
            ExecutorEvent::EraseComplete(completion) => {
                self.on_completion(OperationKind::Erase, completion)
            }
            ExecutorEvent::FormatComplete(completion) => {
                self.on_completion(OperationKind::Format, completion)
            }
            ExecutorEvent::HashComplete { task, result }
            | ExecutorEvent::DownloadComplete { task, result } => self.on_digest(task, result),
            ExecutorEvent::ValidationComplete { task, result } => self.on_validation(task, result),
            progress => self.on_progress(&progress),
        }
    }

    fn on_progress(&mut self, event: &ExecutorEvent) {
        let current = self.machine.current();
        if current.state != OperationState::Running || event.operation() != Some(current.kind()) {
            debug!("dropping {} outside its operation", event.kind());
            return;
        }
        let Some(progress) = ProgressEvent::from_executor(event) else {
            return;
        };
        if let Some(message) = progress.message() {
            self.log.push(message.to_string());
        }
        self.progress.ingest(&progress, Instant::now());
    }

    fn on_completion(&mut self, kind: OperationKind, completion: Completion) {
        let Some(outcome) = self.machine.complete(kind, &completion) else {
            debug!("ignoring {kind} completion for no running operation");
            return;
        };
        self.finish(outcome);
    }

    /// Terminal bookkeeping. A completed flash goes through validation first
    /// and is reported once its verdict arrives.
    fn finish(&mut self, outcome: Outcome) {
        let kind = self.machine.current().kind();
        let id = self.machine.current().id;

        match &outcome {
            Outcome::Completed => {
                info!("{kind} {id} completed");
                self.log.push(format!("{kind} completed"));
                if kind == OperationKind::Flash
                    && self.validation.policy.enabled
                    && self.start_validation()
                {
                    return;
                }
            }
            Outcome::Failed(message) => {
                error!("{kind} {id} failed: {message}");
                self.log.push(format!("{kind} failed: {message}"));
            }
            Outcome::Cancelled => {
                let reason = Error::UserCancelled;
                info!("{kind} {id}: {reason}");
                self.log.push(format!("{kind}: {reason}"));
            }
        }
        self.report(outcome, None);
    }

    /// The single report for the current operation, then the post-action.
    fn report(&mut self, outcome: Outcome, validation: Option<ValidationOutcome>) {
        let current = self.machine.current();
        let (id, kind) = (current.id, current.kind());
        self.progress.reset();
        let succeeded = outcome == Outcome::Completed;
        self.notify(Notification::Finished(OperationReport {
            id,
            kind,
            outcome,
            validation,
        }));
        if succeeded {
            self.apply_post_action();
        }
    }

    /// Moves a completed flash to `Validating` and hands the sampling to the
    /// executor. Returns `false` if the flash is to be reported without it.
    fn start_validation(&mut self) -> bool {
        let current = self.machine.current();
        let operation = current.id;
        let Some(OperationRequest::Flash { image, device }) = current.request.clone() else {
            return false;
        };
        if let Err(e) = self.machine.begin_validation() {
            warn!("cannot validate: {e}");
            return false;
        }
        let task = self.next_task();
        self.log.push(format!("validating {}", device.display()));
        match self
            .validation
            .start(self.executor.as_ref(), task, &device, &image)
        {
            Ok(()) => {
                self.tasks
                    .insert(task, PendingTask::Validation { operation, device });
            }
            Err(e) => self.conclude_validation(&device, Err(e)),
        }
        true
    }

    fn on_validation(&mut self, task: TaskId, result: Result<bool>) {
        let Some(PendingTask::Validation { operation, device }) = self.tasks.get(&task).cloned()
        else {
            debug!("ignoring validation result for unknown {task}");
            return;
        };
        self.tasks.remove(&task);
        if operation != self.machine.current().id
            || self.machine.state() != OperationState::Validating
        {
            debug!("validation of {operation} is no longer awaited");
            return;
        }
        self.conclude_validation(&device, result);
    }

    fn conclude_validation(&mut self, device: &Path, result: Result<bool>) {
        let outcome = self.validation.outcome(device, result);
        match &outcome {
            ValidationOutcome::Passed => self.log.push("sampled validation passed"),
            ValidationOutcome::Mismatch => {
                let message = outcome
                    .as_error(device)
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                self.log.push(message.clone());
                self.notify(Notification::Warning(format!(
                    "{message}; the write itself reported success"
                )));
            }
            ValidationOutcome::Error(e) => {
                self.log.push(format!("sampled validation could not run: {e}"));
                self.notify(Notification::Warning(format!(
                    "sampled validation could not run: {e}"
                )));
            }
            ValidationOutcome::Skipped => {}
        }
        self.machine.finish_validation();
        self.report(Outcome::Completed, Some(outcome));
    }

    fn apply_post_action(&mut self) {
        match self.settings.post_action {
            PostAction::None => {}
            PostAction::Logs => self.view = View::Logs,
            PostAction::Devices => {
                self.view = View::Devices;
                let _ = self.refresh_now();
            }
        }
    }

    // --- settings --------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_store(&self) -> &dyn SettingsStore {
        self.store.as_ref()
    }

    /// Parses, persists and applies one setting. Invalid values change nothing.
    pub fn update_setting(&mut self, key: SettingKey, raw: &str) -> Result<()> {
        let mut next = self.settings.clone();
        next.apply(key, raw).map_err(|reason| Error::InvalidSetting {
            key: key.to_string(),
            reason,
        })?;
        next.persist(key, self.store.as_mut())?;
        self.commit(key, next)
    }

    /// Returns `key` to its default and removes it from the store.
    pub fn clear_setting(&mut self, key: SettingKey) -> Result<()> {
        let mut next = self.settings.clone();
        let default = Settings::default().value_of(key).unwrap_or_default();
        next.apply(key, &default).map_err(|reason| Error::InvalidSetting {
            key: key.to_string(),
            reason,
        })?;
        self.store.remove(key.as_str())?;
        self.commit(key, next)
    }

    fn commit(&mut self, key: SettingKey, next: Settings) -> Result<()> {
        self.settings = next;
        info!("{key} = {}", self.settings.value_of(key).unwrap_or_default());
        match key {
            SettingKey::RefreshMode => self.apply_refresh_mode()?,
            SettingKey::ValidateAfterFlash => {
                self.validation.policy.enabled = self.settings.validate_after_flash
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_refresh_mode(&mut self, mode: RefreshMode) -> Result<()> {
        self.update_setting(SettingKey::RefreshMode, mode.as_str())
    }

    pub fn refresh_policy(&self) -> &RefreshPolicy {
        &self.refresh
    }

    // --- images and presets ---------------------------------------------

    pub fn expected_hash(&self) -> Option<&str> {
        self.expected_hash.as_deref()
    }

    /// The user edited the expected-hash field.
    pub fn set_expected_hash(&mut self, hash: Option<String>) {
        self.expected_hash = hash.filter(|h| !h.trim().is_empty());
    }

    /// Resolves `preset` and back-fills the expected hash when the user has
    /// not supplied one.
    pub fn resolve_preset(&mut self, preset: &Preset) -> Result<ResolvedPreset> {
        let mut resolved = match self.presets.resolve(preset) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.notify(Notification::Error(e.to_string()));
                return Err(e);
            }
        };
        self.expected_hash = preset::effective_expected_hash(
            self.expected_hash.as_deref(),
            resolved.expected_hash.as_deref(),
            preset.expected_hash.as_deref(),
        );
        resolved.expected_hash = self.expected_hash.clone();
        self.log.push(format!("{} -> {}", preset.label, resolved.url));
        Ok(resolved)
    }

    fn next_task(&mut self) -> TaskId {
        self.last_task += 1;
        TaskId(self.last_task)
    }

    /// Whether `task` was handed off and has not reported yet.
    pub fn is_task_pending(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task)
    }

    /// Starts downloading `url` into `dest`, or into the configured download
    /// directory. The result arrives as [`Notification::TaskFinished`].
    pub fn download_image(&mut self, url: &str, dest: Option<PathBuf>) -> Result<TaskId> {
        let dest = match (dest, &self.settings.download_dir) {
            (Some(dest), _) => dest,
            (None, Some(dir)) => preset::destination(dir, url),
            (None, None) => {
                return Err(Error::PrecheckBlocked(
                    "no download directory is configured".into(),
                ));
            }
        };
        let task = self.next_task();
        let expected = self.expected_hash.clone();
        if let Err(e) = self
            .executor
            .download_with_hash(task, url, &dest, expected.as_deref())
        {
            self.log.push(format!("download failed: {e}"));
            self.notify(Notification::Error(e.to_string()));
            return Err(e);
        }
        self.log.push(format!("downloading {url}"));
        self.tasks.insert(task, PendingTask::Download { dest, expected });
        Ok(task)
    }

    /// Starts hashing `path`. The digest is compared with the expected hash,
    /// if any, when it arrives.
    pub fn verify_image(&mut self, path: &Path) -> Result<TaskId> {
        let task = self.next_task();
        if let Err(e) = self.executor.compute_hash(task, path) {
            self.log.push(format!("hash check failed: {e}"));
            self.notify(Notification::Error(e.to_string()));
            return Err(e);
        }
        self.log.push(format!("hashing {}", path.display()));
        self.tasks.insert(
            task,
            PendingTask::Hash {
                path: path.to_path_buf(),
                expected: self.expected_hash.clone(),
            },
        );
        Ok(task)
    }

    fn on_digest(&mut self, task: TaskId, result: Result<String>) {
        let (result, checked) = match self.tasks.remove(&task) {
            Some(PendingTask::Hash { path, expected }) => (
                result
                    .and_then(|digest| preset::verify_checksum(&digest, expected.as_deref()))
                    .map(|sha256| TaskOutput::Hashed { path, sha256 }),
                expected.is_some(),
            ),
            Some(PendingTask::Download { dest, expected }) => (
                result
                    .and_then(|digest| preset::verify_checksum(&digest, expected.as_deref()))
                    .map(|sha256| TaskOutput::Downloaded(DownloadedImage { path: dest, sha256 })),
                expected.is_some(),
            ),
            Some(validation @ PendingTask::Validation { .. }) => {
                debug!("{task} is a validation, not a digest");
                self.tasks.insert(task, validation);
                return;
            }
            None => {
                debug!("ignoring digest for unknown {task}");
                return;
            }
        };
        match &result {
            Ok(TaskOutput::Hashed { path, sha256 }) => {
                self.log.push(format!("sha256 of {}: {sha256}", path.display()));
                let note = if checked {
                    Notification::Success(format!("{} matches the expected hash", path.display()))
                } else {
                    Notification::Info(format!("sha256 {sha256}"))
                };
                self.notify(note);
            }
            Ok(TaskOutput::Downloaded(image)) => {
                self.log.push(format!(
                    "downloaded {} ({})",
                    image.path.display(),
                    image.sha256
                ));
                self.notify(Notification::Success(format!("saved {}", image.path.display())));
            }
            Err(e) => {
                self.log.push(format!("{task} failed: {e}"));
                self.notify(Notification::Error(e.to_string()));
            }
        }
        self.notify(Notification::TaskFinished(TaskReport { task, result }));
    }

    // --- runtime dependencies -------------------------------------------

    pub fn check_dependencies(&mut self) -> Result<Vec<RuntimeDependency>> {
        let deps = self.executor.check_runtime_dependencies()?;
        let missing = deps.iter().filter(|d| !d.installed).count();
        if missing > 0 {
            self.notify(Notification::Warning(format!(
                "{missing} runtime tool(s) missing"
            )));
        }
        Ok(deps)
    }

    pub fn install_dependencies(&mut self) -> Result<()> {
        self.log.push("installing runtime dependencies");
        match self.executor.install_runtime_dependencies() {
            Ok(()) => {
                self.notify(Notification::Success("runtime dependencies installed".into()));
                Ok(())
            }
            Err(e) => {
                self.notify(Notification::Error(e.to_string()));
                Err(e)
            }
        }
    }

    // --- accessors --------------------------------------------------------

    pub fn operation(&self) -> &Operation {
        self.machine.current()
    }

    pub fn state(&self) -> OperationState {
        self.machine.state()
    }

    /// Start entry points are enabled only while this holds.
    pub fn can_start(&self) -> bool {
        self.machine.can_start()
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.refresh.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Transport;
    use crate::preset::{DynamicKind, PresetSource, Resolver};
    use crate::settings::MemoryStore;
    use crate::testing::{Command, FakeExecutor};
    use std::thread;

    fn usb_stick() -> Device {
        Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            vendor: Some("SanDisk".into()),
            model: Some("Cruzer Blade".into()),
            serial: None,
            size_bytes: 16_000_000_000,
            transport: Transport::Usb,
            removable: true,
        }
    }

    fn internal_disk() -> Device {
        Device {
            path: PathBuf::from("/dev/sda"),
            name: "sda".into(),
            vendor: None,
            model: Some("Samsung SSD 860".into()),
            serial: None,
            size_bytes: 512_110_190_592,
            transport: Transport::Sata,
            removable: false,
        }
    }

    fn orchestrator_with(exec: &Arc<FakeExecutor>, presets: PresetPipeline) -> Orchestrator {
        let mut orch = Orchestrator::new(exec.clone(), Box::new(MemoryStore::new()), presets);
        orch.startup().unwrap();
        exec.clear_commands();
        orch.drain_notifications();
        orch
    }

    fn setup(devices: Vec<Device>) -> (Arc<FakeExecutor>, Orchestrator) {
        let exec = Arc::new(FakeExecutor::new());
        exec.set_devices(devices);
        let orch = orchestrator_with(&exec, PresetPipeline::new());
        (exec, orch)
    }

    fn start_flash(orch: &mut Orchestrator) {
        orch.open_flash("/tmp/alpine.iso", "/dev/sdb").unwrap();
        orch.confirm().unwrap();
    }

    fn start_erase(orch: &mut Orchestrator) {
        orch.open_erase("/dev/sdb", Some(EraseMode::Zero)).unwrap();
        orch.confirmation_mut().unwrap().set_typed_phrase("ERASE");
        orch.confirm().unwrap();
    }

    fn succeeded(orch: &Orchestrator) -> Completion {
        Completion::success(orch.operation().id)
    }

    fn failed(orch: &Orchestrator, error: &str) -> Completion {
        Completion::failure(orch.operation().id, error)
    }

    fn reports(orch: &mut Orchestrator) -> Vec<OperationReport> {
        orch.drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Finished(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    fn task_reports(orch: &mut Orchestrator) -> Vec<TaskReport> {
        orch.drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::TaskFinished(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn removable_usb_flash_confirms_without_acknowledgment() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_flash("/tmp/alpine.iso", "/dev/sdb").unwrap();
        assert_eq!(orch.state(), OperationState::AwaitingConfirmation);
        assert!(orch.can_confirm());

        let id = orch.confirm().unwrap();
        assert_eq!(orch.state(), OperationState::Running);
        assert!(orch.confirmation().is_none());
        assert_eq!(exec.last_operation(), Some(id));
        assert_eq!(
            exec.commands(),
            vec![Command::Flash {
                image: PathBuf::from("/tmp/alpine.iso"),
                device: PathBuf::from("/dev/sdb"),
            }]
        );
    }

    #[test]
    fn risky_erase_stays_blocked_until_fully_acknowledged() {
        let (exec, mut orch) = setup(vec![internal_disk()]);
        orch.open_erase("/dev/sda", None).unwrap();
        assert!(!orch.can_confirm());
        assert!(matches!(orch.confirm(), Err(Error::PrecheckBlocked(_))));
        assert_eq!(exec.start_count(), 0);
        assert_eq!(orch.state(), OperationState::AwaitingConfirmation);

        orch.confirmation_mut().unwrap().set_typed_phrase(" erase ");
        assert!(!orch.can_confirm());
        orch.confirmation_mut().unwrap().set_checkbox(true);
        assert!(orch.can_confirm());

        orch.confirm().unwrap();
        assert_eq!(
            exec.commands(),
            vec![Command::Erase {
                device: PathBuf::from("/dev/sda"),
                mode: EraseMode::Auto,
            }]
        );
    }

    #[test]
    fn target_turning_risky_during_confirmation_needs_a_new_acknowledgment() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_flash("/tmp/alpine.iso", "/dev/sdb").unwrap();
        assert!(orch.can_confirm());

        let mut reassigned = internal_disk();
        reassigned.path = PathBuf::from("/dev/sdb");
        reassigned.name = "sdb".into();
        exec.set_devices(vec![reassigned]);
        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();

        assert!(orch.confirmation().unwrap().risky);
        assert!(orch.confirmation().unwrap().required.checkbox);
        assert!(!orch.can_confirm());
        assert!(matches!(orch.confirm(), Err(Error::PrecheckBlocked(_))));
        assert_eq!(exec.start_count(), 0);
        assert_eq!(orch.state(), OperationState::AwaitingConfirmation);
        assert!(
            orch.drain_notifications()
                .iter()
                .any(|n| matches!(n, Notification::Warning(msg) if msg.contains("/dev/sdb")))
        );

        orch.confirmation_mut().unwrap().set_checkbox(true);
        assert!(orch.can_confirm());
        orch.confirm().unwrap();
        assert_eq!(exec.start_count(), 1);
    }

    #[test]
    fn risk_change_is_caught_at_confirm_without_a_refresh_notice() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_format("/dev/sdb", Filesystem::Exfat, "DATA").unwrap();

        let mut reassigned = internal_disk();
        reassigned.path = PathBuf::from("/dev/sdb");
        exec.set_devices(vec![reassigned]);
        orch.registry.refresh(&*exec).unwrap();

        assert!(!orch.can_confirm());
        assert!(matches!(orch.confirm(), Err(Error::PrecheckBlocked(_))));
        assert!(orch.confirmation().unwrap().required.checkbox);
        assert_eq!(exec.start_count(), 0);
    }

    #[test]
    fn vanished_target_is_never_started() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_erase("/dev/sdb", Some(EraseMode::Zero)).unwrap();
        orch.confirmation_mut().unwrap().set_typed_phrase("ERASE");
        assert!(orch.can_confirm());

        exec.set_devices(vec![]);
        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();

        assert!(orch.all_devices().is_empty());
        assert!(!orch.can_confirm());
        assert!(matches!(orch.confirm(), Err(Error::PrecheckBlocked(_))));
        assert_eq!(exec.start_count(), 0);
        assert_eq!(orch.state(), OperationState::AwaitingConfirmation);
        orch.dismiss().unwrap();
        assert_eq!(orch.state(), OperationState::Idle);
    }

    #[test]
    fn unknown_devices_cannot_be_targeted() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        assert!(matches!(
            orch.open_format("/dev/sdz", Filesystem::Exfat, "DATA"),
            Err(Error::PrecheckBlocked(_))
        ));
        assert_eq!(orch.state(), OperationState::Idle);
        assert_eq!(exec.start_count(), 0);
    }

    #[test]
    fn second_start_while_running_is_rejected_without_side_effects() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_flash(&mut orch);
        let before = orch.operation().clone();

        let err = orch.open_erase("/dev/sdb", Some(EraseMode::Zero)).unwrap_err();
        assert!(matches!(err, Error::OperationInProgress(OperationKind::Flash)));
        assert_eq!(orch.operation(), &before);
        assert!(orch.confirmation().is_none());
        assert!(!orch.can_start());
        assert!(orch.confirm().is_err());
        assert_eq!(exec.start_count(), 1);
    }

    #[test]
    fn dismissing_returns_to_idle() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_format("/dev/sdb", Filesystem::Fat32, "STICK").unwrap();
        orch.dismiss().unwrap();
        assert_eq!(orch.state(), OperationState::Idle);
        assert!(orch.confirmation().is_none());
        assert_eq!(exec.start_count(), 0);
    }

    #[test]
    fn erase_progress_becomes_a_percentage() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_erase(&mut orch);
        exec.emit(ExecutorEvent::EraseProgress {
            bytes_processed: 5_242_880,
            total_bytes: Some(10_485_760),
        });
        assert_eq!(orch.pump(), 1);
        assert_eq!(orch.progress().percent(), Some(50));
    }

    #[test]
    fn progress_for_another_operation_is_dropped() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_erase(&mut orch);
        exec.emit(ExecutorEvent::FlashProgress {
            bytes_written: 10,
            total_bytes: Some(20),
        });
        orch.pump();
        assert_eq!(orch.progress().percent(), None);
    }

    #[test]
    fn format_messages_go_to_the_session_log() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.open_format("/dev/sdb", Filesystem::Ext4, "DATA").unwrap();
        orch.confirm().unwrap();
        exec.emit(ExecutorEvent::FormatProgress {
            percent: 30,
            message: None,
        });
        exec.emit(ExecutorEvent::FormatProgress {
            percent: 0,
            message: Some("Writing superblocks".into()),
        });
        orch.pump();
        assert_eq!(orch.progress().percent(), Some(30));
        assert!(
            orch.session_log()
                .lines()
                .iter()
                .any(|l| l.text == "Writing superblocks")
        );
    }

    #[test]
    fn completed_flash_is_validated_and_reported_once() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashProgress {
            bytes_written: 512,
            total_bytes: Some(1024),
        });
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();

        assert_eq!(orch.state(), OperationState::Completed);
        assert!(exec.commands().contains(&Command::ValidateSample {
            device: PathBuf::from("/dev/sdb"),
            image: PathBuf::from("/tmp/alpine.iso"),
            count: 3,
            size: 1024 * 1024,
        }));
        let reports = reports(&mut orch);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, OperationKind::Flash);
        assert_eq!(reports[0].outcome, Outcome::Completed);
        assert_eq!(reports[0].validation, Some(ValidationOutcome::Passed));
        assert_eq!(orch.progress().percent(), None);

        let finished = orch.acknowledge().unwrap();
        assert_eq!(finished.state, OperationState::Completed);
        assert_eq!(orch.state(), OperationState::Idle);
        assert!(orch.can_start());
    }

    #[test]
    fn validating_is_observable_until_the_verdict_arrives() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.hold_tasks();
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();

        assert_eq!(orch.state(), OperationState::Validating);
        assert!(!orch.can_start());
        assert!(orch.acknowledge().is_err());
        assert!(reports(&mut orch).is_empty());
        assert!(matches!(
            orch.open_erase("/dev/sdb", None),
            Err(Error::OperationInProgress(OperationKind::Flash))
        ));

        assert_eq!(exec.release_tasks(), 1);
        orch.pump();
        assert_eq!(orch.state(), OperationState::Completed);
        let reports = reports(&mut orch);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].validation, Some(ValidationOutcome::Passed));
    }

    #[test]
    fn validation_that_cannot_start_still_reports_the_flash() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.fail_tasks("permission denied");
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();

        assert_eq!(orch.state(), OperationState::Completed);
        let notifications = orch.drain_notifications();
        assert!(
            notifications
                .iter()
                .any(|n| matches!(n, Notification::Warning(msg) if msg.contains("permission denied")))
        );
        let report = notifications
            .into_iter()
            .find_map(|n| match n {
                Notification::Finished(report) => Some(report),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert!(matches!(report.validation, Some(ValidationOutcome::Error(_))));
    }

    #[test]
    fn validation_mismatch_is_a_warning_not_a_failure() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.set_validation(Ok(false));
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();

        assert_eq!(orch.state(), OperationState::Completed);
        let notifications = orch.drain_notifications();
        assert!(
            notifications
                .iter()
                .any(|n| matches!(n, Notification::Warning(_)))
        );
        assert!(
            !notifications
                .iter()
                .any(|n| matches!(n, Notification::Error(_)))
        );
        let report = notifications
            .into_iter()
            .find_map(|n| match n {
                Notification::Finished(report) => Some(report),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.validation, Some(ValidationOutcome::Mismatch));
    }

    #[test]
    fn validation_can_be_switched_off() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.update_setting(SettingKey::ValidateAfterFlash, "false")
            .unwrap();
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();
        assert!(
            !exec
                .commands()
                .iter()
                .any(|c| matches!(c, Command::ValidateSample { .. }))
        );
        assert_eq!(reports(&mut orch)[0].validation, None);
    }

    #[test]
    fn executor_failure_marks_the_operation_failed() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_erase(&mut orch);
        exec.emit(ExecutorEvent::EraseComplete(failed(
            &orch,
            "dd: error writing '/dev/sdb': Input/output error",
        )));
        orch.pump();

        assert_eq!(orch.state(), OperationState::Failed);
        assert!(orch.operation().error.as_deref().unwrap().contains("Input/output"));
        let reports = reports(&mut orch);
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, Outcome::Failed(_)));
        assert!(!orch.can_start());
        orch.acknowledge().unwrap();
        assert!(orch.can_start());
    }

    #[test]
    fn cancel_waits_for_the_completion_event() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_erase(&mut orch);
        orch.cancel().unwrap();
        assert_eq!(exec.commands().last(), Some(&Command::Cancel));
        assert_eq!(orch.state(), OperationState::Running);

        exec.emit(ExecutorEvent::EraseComplete(failed(&orch, "terminated")));
        orch.pump();
        assert_eq!(orch.state(), OperationState::Cancelled);
        assert_eq!(reports(&mut orch)[0].outcome, Outcome::Cancelled);
        assert!(
            orch.session_log()
                .lines()
                .iter()
                .any(|l| l.text.contains("cancelled by user"))
        );
    }

    #[test]
    fn late_completion_cannot_finish_the_next_operation() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        start_erase(&mut orch);
        let first = succeeded(&orch);
        exec.emit(ExecutorEvent::EraseComplete(first.clone()));
        orch.pump();
        orch.acknowledge().unwrap();
        reports(&mut orch);

        start_erase(&mut orch);
        exec.emit(ExecutorEvent::EraseComplete(Completion::failure(
            first.operation,
            "terminated",
        )));
        orch.pump();
        assert_eq!(orch.state(), OperationState::Running);
        assert!(reports(&mut orch).is_empty());

        exec.emit(ExecutorEvent::EraseComplete(succeeded(&orch)));
        orch.pump();
        assert_eq!(orch.state(), OperationState::Completed);
    }

    #[test]
    fn a_refused_start_fails_the_operation() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.fail_starts("helper missing");
        orch.open_flash("/tmp/alpine.iso", "/dev/sdb").unwrap();
        assert!(matches!(orch.confirm(), Err(Error::IoFailure(_))));
        assert_eq!(orch.state(), OperationState::Failed);
        assert_eq!(reports(&mut orch).len(), 1);
    }

    #[test]
    fn post_action_applies_only_after_success() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.update_setting(SettingKey::PostAction, "devices").unwrap();

        start_erase(&mut orch);
        exec.emit(ExecutorEvent::EraseComplete(failed(&orch, "boom")));
        orch.pump();
        assert_eq!(orch.view(), View::Flash);
        orch.acknowledge().unwrap();

        exec.clear_commands();
        start_erase(&mut orch);
        exec.emit(ExecutorEvent::EraseComplete(succeeded(&orch)));
        orch.pump();
        assert_eq!(orch.view(), View::Devices);
        assert!(exec.commands().contains(&Command::ListDevices));

        orch.acknowledge().unwrap();
        orch.update_setting(SettingKey::PostAction, "logs").unwrap();
        start_flash(&mut orch);
        exec.emit(ExecutorEvent::FlashComplete(succeeded(&orch)));
        orch.pump();
        assert_eq!(orch.view(), View::Logs);
    }

    #[test]
    fn hotplug_refreshes_except_in_manual_mode() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.set_devices(vec![usb_stick(), internal_disk()]);
        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();
        assert!(exec.commands().contains(&Command::ListDevices));
        assert_eq!(orch.all_devices().len(), 2);
        assert_eq!(orch.devices().len(), 1);

        orch.set_refresh_mode(RefreshMode::Manual).unwrap();
        exec.clear_commands();
        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();
        assert!(!exec.commands().contains(&Command::ListDevices));

        orch.refresh_devices().unwrap();
        assert!(exec.commands().contains(&Command::ListDevices));
    }

    #[test]
    fn switching_from_interval_to_hotplug_stops_timed_refreshes() {
        let exec = Arc::new(FakeExecutor::new());
        exec.set_devices(vec![usb_stick()]);
        let mut orch =
            Orchestrator::new(exec.clone(), Box::new(MemoryStore::new()), PresetPipeline::new());
        orch.refresh = RefreshPolicy::with_period(Duration::from_millis(10));
        orch.startup().unwrap();
        orch.set_refresh_mode(RefreshMode::Interval5).unwrap();
        assert!(orch.refresh_policy().has_timer());
        exec.clear_commands();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !exec.commands().contains(&Command::ListDevices) {
            assert!(Instant::now() < deadline, "no timed refresh happened");
            orch.wait_event(Duration::from_millis(50));
        }

        orch.set_refresh_mode(RefreshMode::Hotplug).unwrap();
        assert!(!orch.refresh_policy().has_timer());
        orch.pump();
        exec.clear_commands();
        thread::sleep(Duration::from_millis(60));
        orch.pump();
        assert!(!exec.commands().contains(&Command::ListDevices));

        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();
        assert!(exec.commands().contains(&Command::ListDevices));
        assert_eq!(
            orch.settings_store().get("autoRefresh").unwrap().as_deref(),
            Some("hotplug")
        );
    }

    #[test]
    fn failed_refresh_keeps_the_known_devices() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.fail_listing("lsblk: not found");
        assert!(orch.refresh_devices().is_err());
        assert_eq!(orch.all_devices().len(), 1);
        assert!(
            orch.drain_notifications()
                .iter()
                .any(|n| matches!(n, Notification::Error(msg) if msg.contains("lsblk")))
        );
    }

    #[test]
    fn settings_are_validated_and_written_through() {
        let (_exec, mut orch) = setup(vec![]);
        orch.update_setting(SettingKey::EraseMode, "blkdiscard").unwrap();
        assert_eq!(orch.settings().erase_mode, EraseMode::Blkdiscard);
        assert_eq!(
            orch.settings_store().get("eraseMode").unwrap().as_deref(),
            Some("blkdiscard")
        );

        let err = orch.update_setting(SettingKey::EraseMode, "shred").unwrap_err();
        assert!(matches!(err, Error::InvalidSetting { .. }));
        assert_eq!(orch.settings().erase_mode, EraseMode::Blkdiscard);

        orch.clear_setting(SettingKey::EraseMode).unwrap();
        assert_eq!(orch.settings().erase_mode, EraseMode::Auto);
        assert_eq!(orch.settings_store().get("eraseMode").unwrap(), None);
    }

    #[test]
    fn erase_defaults_to_the_configured_mode() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        orch.update_setting(SettingKey::EraseMode, "wipefs").unwrap();
        orch.open_erase("/dev/sdb", None).unwrap();
        orch.confirmation_mut().unwrap().set_typed_phrase("ERASE");
        orch.confirm().unwrap();
        assert_eq!(
            exec.commands(),
            vec![Command::Erase {
                device: PathBuf::from("/dev/sdb"),
                mode: EraseMode::Wipefs,
            }]
        );
    }

    #[test]
    fn shutdown_releases_every_subscription() {
        let (exec, mut orch) = setup(vec![]);
        assert_eq!(exec.subscriber_count(), EventKind::ALL.len());
        orch.shutdown();
        assert_eq!(exec.subscriber_count(), 0);
    }

    #[test]
    fn upper_case_download_hash_matches() {
        let (exec, mut orch) = setup(vec![]);
        orch.set_expected_hash(Some("deadbeef".into()));
        exec.set_download_hash("DEADBEEF");
        let task = orch
            .download_image("https://x.test/a.iso", Some(PathBuf::from("/tmp/a.iso")))
            .unwrap();
        assert!(orch.is_task_pending(task));
        orch.pump();
        assert!(!orch.is_task_pending(task));

        let notifications = orch.drain_notifications();
        assert!(
            !notifications
                .iter()
                .any(|n| matches!(n, Notification::Error(_)))
        );
        assert!(notifications.contains(&Notification::TaskFinished(TaskReport {
            task,
            result: Ok(TaskOutput::Downloaded(DownloadedImage {
                path: PathBuf::from("/tmp/a.iso"),
                sha256: "deadbeef".into(),
            })),
        })));
    }

    #[test]
    fn downloads_land_in_the_configured_directory() {
        let (exec, mut orch) = setup(vec![]);
        assert!(matches!(
            orch.download_image("https://x.test/a.iso", None),
            Err(Error::PrecheckBlocked(_))
        ));
        orch.update_setting(SettingKey::DownloadDir, "/srv/images").unwrap();
        orch.download_image("https://x.test/iso/a.iso", None).unwrap();
        assert!(exec.commands().contains(&Command::Download {
            url: "https://x.test/iso/a.iso".into(),
            dest: PathBuf::from("/srv/images/a.iso"),
            expected: None,
        }));
        orch.pump();
        let reports = task_reports(&mut orch);
        assert!(matches!(
            &reports[0].result,
            Ok(TaskOutput::Downloaded(image)) if image.path == Path::new("/srv/images/a.iso")
        ));
    }

    #[test]
    fn hashing_does_not_block_event_handling() {
        let (exec, mut orch) = setup(vec![usb_stick()]);
        exec.hold_tasks();
        let task = orch.verify_image(Path::new("/tmp/a.iso")).unwrap();

        exec.set_devices(vec![usb_stick(), internal_disk()]);
        exec.emit(ExecutorEvent::DevicesChanged);
        orch.pump();
        assert_eq!(orch.all_devices().len(), 2);
        assert!(orch.is_task_pending(task));
        assert!(task_reports(&mut orch).is_empty());

        exec.release_tasks();
        orch.pump();
        let reports = task_reports(&mut orch);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task, task);
        assert!(matches!(&reports[0].result, Ok(TaskOutput::Hashed { .. })));
    }

    #[test]
    fn verify_reports_a_mismatch() {
        let (exec, mut orch) = setup(vec![]);
        exec.set_hash("0000");
        orch.set_expected_hash(Some("ffff".into()));
        orch.verify_image(Path::new("/tmp/a.iso")).unwrap();
        orch.pump();
        let notifications = orch.drain_notifications();
        assert!(
            notifications
                .iter()
                .any(|n| matches!(n, Notification::Error(_)))
        );
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::TaskFinished(TaskReport {
                result: Err(Error::ChecksumMismatch { .. }),
                ..
            })
        )));
    }

    #[test]
    fn refused_hash_is_reported_immediately() {
        let (exec, mut orch) = setup(vec![]);
        exec.fail_tasks("helper busy");
        assert!(matches!(
            orch.verify_image(Path::new("/tmp/a.iso")),
            Err(Error::IoFailure(_))
        ));
        assert!(
            orch.drain_notifications()
                .iter()
                .any(|n| matches!(n, Notification::Error(msg) if msg.contains("helper busy")))
        );
    }

    struct Published(Option<&'static str>);

    impl Resolver for Published {
        fn resolve(&self) -> Result<ResolvedPreset> {
            Ok(ResolvedPreset {
                url: "https://mirror.test/kali-live.iso".into(),
                expected_hash: self.0.map(str::to_string),
            })
        }
    }

    fn kali() -> Preset {
        Preset {
            label: "Kali Linux Live (latest)".into(),
            source: PresetSource::Dynamic(DynamicKind::KaliLatest),
            expected_hash: None,
        }
    }

    #[test]
    fn discovered_hash_is_back_filled() {
        let exec = Arc::new(FakeExecutor::new());
        let mut presets = PresetPipeline::new();
        presets.register(DynamicKind::KaliLatest, Box::new(Published(Some("abc123"))));
        let mut orch = orchestrator_with(&exec, presets);

        let resolved = orch.resolve_preset(&kali()).unwrap();
        assert_eq!(resolved.url, "https://mirror.test/kali-live.iso");
        assert_eq!(orch.expected_hash(), Some("abc123"));
    }

    #[test]
    fn user_supplied_hash_wins_over_the_resolver() {
        let exec = Arc::new(FakeExecutor::new());
        let mut presets = PresetPipeline::new();
        presets.register(DynamicKind::KaliLatest, Box::new(Published(Some("abc123"))));
        let mut orch = orchestrator_with(&exec, presets);

        orch.set_expected_hash(Some("FEED".into()));
        let resolved = orch.resolve_preset(&kali()).unwrap();
        assert_eq!(resolved.expected_hash.as_deref(), Some("FEED"));
        assert_eq!(orch.expected_hash(), Some("FEED"));
    }
}
