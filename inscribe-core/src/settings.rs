//! Process-wide user settings and the small key/value port they persist
//! through.
//!
//! Settings are loaded once at startup and written through on every change.
//! Each setting is stored under its own key as a plain string, so a bad value
//! only resets that one setting to its default.
use crate::error::Result;
use crate::operation::EraseMode;
use crate::refresh::RefreshMode;
use log::warn;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
    Dim,
    Oled,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::System => "system",
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::Dim => "dim",
            Theme::Oled => "oled",
        }
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [Theme::System, Theme::Light, Theme::Dark, Theme::Dim, Theme::Oled]
            .into_iter()
            .find(|theme| theme.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown theme '{s}'"))
    }
}

/// What happens after an operation finishes successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostAction {
    #[default]
    None,
    /// Switch to the log view.
    Logs,
    /// Switch to the device view and refresh the registry.
    Devices,
}

impl PostAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PostAction::None => "none",
            PostAction::Logs => "logs",
            PostAction::Devices => "devices",
        }
    }
}

impl FromStr for PostAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PostAction::None),
            "logs" => Ok(PostAction::Logs),
            "devices" => Ok(PostAction::Devices),
            other => Err(format!("unknown post-action '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    EraseMode,
    Theme,
    HideInternal,
    RefreshMode,
    PostAction,
    DownloadDir,
    ValidateAfterFlash,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        SettingKey::EraseMode,
        SettingKey::Theme,
        SettingKey::HideInternal,
        SettingKey::RefreshMode,
        SettingKey::PostAction,
        SettingKey::DownloadDir,
        SettingKey::ValidateAfterFlash,
    ];

    /// The key the value is stored under.
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::EraseMode => "eraseMode",
            SettingKey::Theme => "theme",
            SettingKey::HideInternal => "hideInternal",
            SettingKey::RefreshMode => "autoRefresh",
            SettingKey::PostAction => "afterAction",
            SettingKey::DownloadDir => "downloadDir",
            SettingKey::ValidateAfterFlash => "validateAfterFlash",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown setting '{s}'"))
    }
}

fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub erase_mode: EraseMode,
    pub theme: Theme,
    pub hide_internal_devices: bool,
    pub refresh_mode: RefreshMode,
    pub post_action: PostAction,
    pub download_dir: Option<PathBuf>,
    pub validate_after_flash: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            erase_mode: EraseMode::Auto,
            theme: Theme::System,
            hide_internal_devices: true,
            refresh_mode: RefreshMode::Hotplug,
            post_action: PostAction::None,
            download_dir: None,
            validate_after_flash: true,
        }
    }
}

impl Settings {
    /// Reads every key from `store`. Missing keys keep their default; invalid
    /// ones are logged and also keep their default.
    pub fn load(store: &dyn SettingsStore) -> Self {
        let mut settings = Settings::default();
        for key in SettingKey::ALL {
            match store.get(key.as_str()) {
                Ok(Some(raw)) => {
                    if let Err(e) = settings.apply(key, &raw) {
                        warn!("ignoring stored {key}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("could not read setting {key}: {e}"),
            }
        }
        settings
    }

    /// The stored form of `key`, or `None` when the setting is unset.
    pub fn value_of(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::EraseMode => Some(self.erase_mode.as_str().to_string()),
            SettingKey::Theme => Some(self.theme.as_str().to_string()),
            SettingKey::HideInternal => Some(self.hide_internal_devices.to_string()),
            SettingKey::RefreshMode => Some(self.refresh_mode.as_str().to_string()),
            SettingKey::PostAction => Some(self.post_action.as_str().to_string()),
            SettingKey::DownloadDir => self
                .download_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            SettingKey::ValidateAfterFlash => Some(self.validate_after_flash.to_string()),
        }
    }

    /// Parses `raw` and sets `key`. On error nothing changes.
    pub fn apply(&mut self, key: SettingKey, raw: &str) -> std::result::Result<(), String> {
        match key {
            SettingKey::EraseMode => self.erase_mode = raw.parse()?,
            SettingKey::Theme => self.theme = raw.parse()?,
            SettingKey::HideInternal => self.hide_internal_devices = parse_bool(raw)?,
            SettingKey::RefreshMode => self.refresh_mode = raw.parse()?,
            SettingKey::PostAction => self.post_action = raw.parse()?,
            SettingKey::DownloadDir => {
                let raw = raw.trim();
                self.download_dir = (!raw.is_empty()).then(|| PathBuf::from(raw));
            }
            SettingKey::ValidateAfterFlash => self.validate_after_flash = parse_bool(raw)?,
        }
        Ok(())
    }

    /// Writes the current value of `key`, removing it when unset.
    pub fn persist(&self, key: SettingKey, store: &mut dyn SettingsStore) -> Result<()> {
        match self.value_of(key) {
            Some(value) => store.set(key.as_str(), &value),
            None => store.remove(key.as_str()),
        }
    }
}

/// Key/value persistence for [`Settings`].
pub trait SettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// A store that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/inscribe/settings.json`, falling back to `~/.config`.
pub fn default_settings_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("inscribe").join("settings.json"))
}
