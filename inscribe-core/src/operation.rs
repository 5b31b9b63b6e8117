//! The single destructive operation and the state machine that guards it.
//!
//! At most one operation may be `Running` or `Validating` at any time. The
//! machine enforces that by construction: there is exactly one [`Operation`]
//! slot, and new requests are only accepted while it is `Idle` or still
//! `AwaitingConfirmation`.
//!
//! ```text
//! Idle -> AwaitingConfirmation -> Running -> Completed -> (Validating -> Completed)
//!              |                     |----> Failed
//!              v                     '----> Cancelled
//!             Idle                 (terminal states) -- acknowledge --> Idle
//! ```
use crate::error::{Error, Result};
use crate::executor::Completion;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Flash,
    Erase,
    Format,
    None,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Flash => "flash",
            OperationKind::Erase => "erase",
            OperationKind::Format => "format",
            OperationKind::None => "none",
        })
    }
}

/// How the executor should wipe a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EraseMode {
    /// Discard when supported, zero fill otherwise.
    #[default]
    Auto,
    Zero,
    Random,
    Blkdiscard,
    Wipefs,
}

impl EraseMode {
    pub const ALL: [EraseMode; 5] = [
        EraseMode::Auto,
        EraseMode::Zero,
        EraseMode::Random,
        EraseMode::Blkdiscard,
        EraseMode::Wipefs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EraseMode::Auto => "auto",
            EraseMode::Zero => "zero",
            EraseMode::Random => "random",
            EraseMode::Blkdiscard => "blkdiscard",
            EraseMode::Wipefs => "wipefs",
        }
    }
}

impl fmt::Display for EraseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EraseMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EraseMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown erase mode '{s}'"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filesystem {
    Ext4,
    Fat32,
    Exfat,
    Ntfs,
}

impl Filesystem {
    pub const ALL: [Filesystem; 4] = [
        Filesystem::Ext4,
        Filesystem::Fat32,
        Filesystem::Exfat,
        Filesystem::Ntfs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Fat32 => "fat32",
            Filesystem::Exfat => "exfat",
            Filesystem::Ntfs => "ntfs",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Filesystem {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ext4" => Ok(Filesystem::Ext4),
            "fat32" | "vfat" => Ok(Filesystem::Fat32),
            "exfat" => Ok(Filesystem::Exfat),
            "ntfs" => Ok(Filesystem::Ntfs),
            other => Err(format!("unsupported filesystem '{other}'")),
        }
    }
}

/// What the user asked for, with everything the executor needs to do it.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationRequest {
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
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Flash { .. } => OperationKind::Flash,
            OperationRequest::Erase { .. } => OperationKind::Erase,
            OperationRequest::Format { .. } => OperationKind::Format,
        }
    }

    pub fn device(&self) -> &Path {
        match self {
            OperationRequest::Flash { device, .. }
            | OperationRequest::Erase { device, .. }
            | OperationRequest::Format { device, .. } => device,
        }
    }
}

impl fmt::Display for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationRequest::Flash { image, device } => {
                write!(f, "flash {} -> {}", image.display(), device.display())
            }
            OperationRequest::Erase { device, mode } => {
                write!(f, "erase ({mode}) {}", device.display())
            }
            OperationRequest::Format {
                device,
                filesystem,
                label,
            } => write!(f, "format {} as {filesystem} '{label}'", device.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationState {
    #[default]
    Idle,
    AwaitingConfirmation,
    Running,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_active(self) -> bool {
        matches!(self, OperationState::Running | OperationState::Validating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a started operation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    /// The error a front-end should surface for an unsuccessful outcome.
    pub fn error(&self) -> Option<Error> {
        match self {
            Outcome::Completed => None,
            Outcome::Failed(message) => Some(Error::IoFailure(message.clone())),
            Outcome::Cancelled => Some(Error::UserCancelled),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub request: Option<OperationRequest>,
    pub state: OperationState,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        self.request
            .as_ref()
            .map_or(OperationKind::None, OperationRequest::kind)
    }
}

#[derive(Debug, Default)]
pub struct OperationMachine {
    current: Operation,
    last_id: u64,
}

impl OperationMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Operation {
        &self.current
    }

    pub fn state(&self) -> OperationState {
        self.current.state
    }

    /// Start entry points are only enabled while this holds.
    pub fn can_start(&self) -> bool {
        matches!(
            self.current.state,
            OperationState::Idle | OperationState::AwaitingConfirmation
        )
    }

    /// Why a new request cannot be accepted right now.
    pub fn busy_error(&self) -> Error {
        if self.current.state.is_active() {
            Error::OperationInProgress(self.current.kind())
        } else {
            Error::InvalidTransition(format!(
                "the previous {} ({}) has not been acknowledged",
                self.current.kind(),
                self.current.state
            ))
        }
    }

    /// Opens the confirmation step for `request`. A pending confirmation for
    /// another request is replaced.
    pub fn open(&mut self, request: OperationRequest) -> Result<OperationId> {
        if !self.can_start() {
            return Err(self.busy_error());
        }
        self.last_id += 1;
        self.current = Operation {
            id: OperationId(self.last_id),
            request: Some(request),
            state: OperationState::AwaitingConfirmation,
            cancel_requested: false,
            error: None,
        };
        Ok(self.current.id)
    }

    /// The confirmation dialog was closed without confirming.
    pub fn dismiss(&mut self) -> Result<()> {
        if self.current.state != OperationState::AwaitingConfirmation {
            return Err(Error::InvalidTransition(format!(
                "nothing to dismiss while {}",
                self.current.state
            )));
        }
        self.current = Operation::default();
        Ok(())
    }

    /// Moves the pending request to `Running` and hands it back for dispatch.
    pub fn confirm(&mut self) -> Result<OperationRequest> {
        if self.current.state != OperationState::AwaitingConfirmation {
            return Err(if self.can_start() {
                Error::InvalidTransition("no operation is awaiting confirmation".into())
            } else {
                self.busy_error()
            });
        }
        let request = self
            .current
            .request
            .clone()
            .ok_or_else(|| Error::InvalidTransition("confirmation has no request".into()))?;
        self.current.state = OperationState::Running;
        Ok(request)
    }

    /// Records a cooperative cancel. The state stays `Running` until the
    /// executor reports completion.
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.current.state != OperationState::Running {
            return Err(Error::InvalidTransition(format!(
                "cannot cancel while {}",
                self.current.state
            )));
        }
        self.current.cancel_requested = true;
        Ok(())
    }

    /// The executor refused to start the operation.
    pub fn fail_to_start(&mut self, error: &Error) {
        if self.current.state == OperationState::Running {
            self.current.state = OperationState::Failed;
            self.current.error = Some(error.to_string());
        }
    }

    /// Applies a completion event. Returns `None` when the event does not
    /// belong to the running operation: another kind, a duplicate for an
    /// operation that has already finished, or a late event from an earlier
    /// operation.
    pub fn complete(&mut self, kind: OperationKind, completion: &Completion) -> Option<Outcome> {
        if self.current.state != OperationState::Running
            || self.current.kind() != kind
            || completion.operation != self.current.id
        {
            return None;
        }
        let outcome = if completion.ok {
            Outcome::Completed
        } else if self.current.cancel_requested {
            Outcome::Cancelled
        } else {
            Outcome::Failed(
                completion
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{kind} failed")),
            )
        };
        let next = match &outcome {
            Outcome::Completed => OperationState::Completed,
            Outcome::Cancelled => OperationState::Cancelled,
            Outcome::Failed(msg) => {
                self.current.error = Some(msg.clone());
                OperationState::Failed
            }
        };
        self.current.state = next;
        Some(outcome)
    }

    pub fn begin_validation(&mut self) -> Result<()> {
        if self.current.state != OperationState::Completed
            || self.current.kind() != OperationKind::Flash
        {
            return Err(Error::InvalidTransition(format!(
                "cannot validate a {} that is {}",
                self.current.kind(),
                self.current.state
            )));
        }
        self.current.state = OperationState::Validating;
        Ok(())
    }

    /// Validation never rolls back the flash: the operation ends `Completed`.
    pub fn finish_validation(&mut self) {
        if self.current.state == OperationState::Validating {
            self.current.state = OperationState::Completed;
        }
    }

    /// The UI has observed the terminal state; the slot returns to `Idle`.
    pub fn acknowledge(&mut self) -> Result<Operation> {
        if !self.current.state.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "nothing to acknowledge while {}",
                self.current.state
            )));
        }
        Ok(std::mem::take(&mut self.current))
    }
}
