//! The safety gate in front of every destructive action.
//!
//! The gate is a hard stop, not a warning: a [`ConfirmationRequest`] that has
//! not collected every required acknowledgment cannot be confirmed, and a
//! blocked confirmation never produces an executor command.
use crate::device::Device;
use crate::error::{Error, Result};
use crate::operation::{OperationKind, OperationRequest};
use std::path::Path;

/// The phrase that must be typed to confirm an erase.
pub const ERASE_PHRASE: &str = "ERASE";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiskClass {
    pub risky: bool,
}

/// What the user must do before the confirm control is enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequiredAcknowledgment {
    /// "I understand this may wipe my system disk."
    pub checkbox: bool,
    /// Literal phrase to type, compared trimmed and case-insensitively.
    pub phrase: Option<&'static str>,
}

impl RequiredAcknowledgment {
    pub fn is_none(&self) -> bool {
        !self.checkbox && self.phrase.is_none()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SafetyGate;

impl SafetyGate {
    pub fn classify(&self, device: &Device) -> RiskClass {
        RiskClass {
            risky: device.is_risky(),
        }
    }

    /// Flash, format and erase on a risky device need the checkbox. Erase
    /// always needs the typed phrase, whatever the device.
    pub fn required_acknowledgment(
        &self,
        action: OperationKind,
        risky: bool,
    ) -> RequiredAcknowledgment {
        match action {
            OperationKind::Flash | OperationKind::Format => RequiredAcknowledgment {
                checkbox: risky,
                phrase: None,
            },
            OperationKind::Erase => RequiredAcknowledgment {
                checkbox: risky,
                phrase: Some(ERASE_PHRASE),
            },
            OperationKind::None => RequiredAcknowledgment::default(),
        }
    }

    /// Builds the confirmation a dialog for `request` on `device` will collect.
    pub fn prepare(&self, request: OperationRequest, device: &Device) -> ConfirmationRequest {
        let risky = self.classify(device).risky;
        let required = self.required_acknowledgment(request.kind(), risky);
        ConfirmationRequest {
            request,
            risky,
            required,
            checkbox_ticked: false,
            typed_phrase: String::new(),
        }
    }

    /// Checks the request itself and its acknowledgments.
    pub fn evaluate(&self, confirmation: &ConfirmationRequest) -> Result<()> {
        validate_request(&confirmation.request)?;
        if confirmation.required.checkbox && !confirmation.checkbox_ticked {
            return Err(Error::PrecheckBlocked(format!(
                "{} looks like an internal disk and the risk was not acknowledged",
                confirmation.request.device().display()
            )));
        }
        if let Some(phrase) = confirmation.required.phrase {
            if !phrase_matches(&confirmation.typed_phrase, phrase) {
                return Err(Error::PrecheckBlocked(format!(
                    "type {phrase} to confirm"
                )));
            }
        }
        Ok(())
    }
}

fn validate_request(request: &OperationRequest) -> Result<()> {
    if request.device().as_os_str().is_empty() {
        return Err(Error::PrecheckBlocked("no device selected".into()));
    }
    match request {
        OperationRequest::Flash { image, .. } if is_blank(image) => {
            Err(Error::PrecheckBlocked("no image selected".into()))
        }
        OperationRequest::Format { label, .. } if label.trim().is_empty() => {
            Err(Error::PrecheckBlocked("a volume label is required".into()))
        }
        _ => Ok(()),
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

pub fn phrase_matches(typed: &str, phrase: &str) -> bool {
    typed.trim().eq_ignore_ascii_case(phrase)
}

/// The state of one open confirmation dialog.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationRequest {
    pub request: OperationRequest,
    pub risky: bool,
    pub required: RequiredAcknowledgment,
    pub checkbox_ticked: bool,
    pub typed_phrase: String,
}

impl ConfirmationRequest {
    pub fn set_checkbox(&mut self, ticked: bool) {
        self.checkbox_ticked = ticked;
    }

    pub fn set_typed_phrase(&mut self, text: impl Into<String>) {
        self.typed_phrase = text.into();
    }

    /// Whether the confirm control should be enabled.
    pub fn is_satisfied(&self) -> bool {
        SafetyGate.evaluate(self).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Transport;
    use crate::operation::{EraseMode, Filesystem};
    use std::path::PathBuf;

    fn usb_stick() -> Device {
        Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            vendor: None,
            model: None,
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
            removable: false,
            transport: Transport::Sata,
            ..usb_stick()
        }
    }

    fn flash_to(device: &Device) -> OperationRequest {
        OperationRequest::Flash {
            image: PathBuf::from("/tmp/alpine.iso"),
            device: device.path.clone(),
        }
    }

    fn erase_of(device: &Device) -> OperationRequest {
        OperationRequest::Erase {
            device: device.path.clone(),
            mode: EraseMode::Auto,
        }
    }

    #[test]
    fn removable_usb_flash_needs_nothing() {
        let gate = SafetyGate;
        let dev = usb_stick();
        assert!(!gate.classify(&dev).risky);
        let confirmation = gate.prepare(flash_to(&dev), &dev);
        assert!(confirmation.required.is_none());
        assert!(confirmation.is_satisfied());
    }

    #[test]
    fn risky_flash_and_format_need_the_checkbox() {
        let gate = SafetyGate;
        let dev = internal_disk();
        for request in [
            flash_to(&dev),
            OperationRequest::Format {
                device: dev.path.clone(),
                filesystem: Filesystem::Exfat,
                label: "DATA".into(),
            },
        ] {
            let mut confirmation = gate.prepare(request, &dev);
            assert!(confirmation.risky);
            assert!(!confirmation.is_satisfied());
            assert!(matches!(
                gate.evaluate(&confirmation),
                Err(Error::PrecheckBlocked(_))
            ));
            confirmation.set_checkbox(true);
            assert!(confirmation.is_satisfied());
        }
    }

    #[test]
    fn erase_always_needs_the_phrase() {
        let gate = SafetyGate;
        let dev = usb_stick();
        let mut confirmation = gate.prepare(erase_of(&dev), &dev);
        assert_eq!(confirmation.required.phrase, Some("ERASE"));
        assert!(!confirmation.required.checkbox);
        assert!(!confirmation.is_satisfied());

        confirmation.set_typed_phrase("eras");
        assert!(!confirmation.is_satisfied());
        confirmation.set_typed_phrase("  erase \n");
        assert!(confirmation.is_satisfied());
    }

    #[test]
    fn risky_erase_needs_phrase_and_checkbox() {
        let gate = SafetyGate;
        let dev = internal_disk();
        let mut confirmation = gate.prepare(erase_of(&dev), &dev);
        confirmation.set_typed_phrase("ERASE");
        assert!(!confirmation.is_satisfied());
        confirmation.set_checkbox(true);
        assert!(confirmation.is_satisfied());
        confirmation.set_typed_phrase("ERASE ALL");
        assert!(!confirmation.is_satisfied());
    }

    #[test]
    fn incomplete_requests_are_blocked() {
        let gate = SafetyGate;
        let dev = usb_stick();
        let confirmation = gate.prepare(
            OperationRequest::Flash {
                image: PathBuf::new(),
                device: dev.path.clone(),
            },
            &dev,
        );
        assert!(!confirmation.is_satisfied());

        let confirmation = gate.prepare(
            OperationRequest::Format {
                device: dev.path.clone(),
                filesystem: Filesystem::Ext4,
                label: "   ".into(),
            },
            &dev,
        );
        assert!(!confirmation.is_satisfied());
    }

    #[test]
    fn phrase_comparison_trims_and_ignores_case() {
        assert!(phrase_matches("Erase", ERASE_PHRASE));
        assert!(phrase_matches("\tERASE  ", ERASE_PHRASE));
        assert!(!phrase_matches("E R A S E", ERASE_PHRASE));
        assert!(!phrase_matches("", ERASE_PHRASE));
    }
}
