//! Named image sources, their resolution to a concrete URL, and the
//! checksum bookkeeping around downloading them.
use crate::error::{Error, Result};
use log::{debug, info};
use regex::Regex;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const KALI_BASE_URL: &str = "https://cdimage.kali.org/current/";
const KALI_ISO_PATTERN: &str = r#"(?i)href="(kali-linux-[^"]*-live-amd64\.iso)""#;
const SUMS_FILE: &str = "SHA256SUMS";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Presets whose URL has to be looked up at the time of use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DynamicKind {
    KaliLatest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresetSource {
    Static { url: String },
    Dynamic(DynamicKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preset {
    pub label: String,
    pub source: PresetSource,
    pub expected_hash: Option<String>,
}

impl Preset {
    fn fixed(label: &str, url: &str) -> Self {
        Self {
            label: label.to_string(),
            source: PresetSource::Static {
                url: url.to_string(),
            },
            expected_hash: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPreset {
    pub url: String,
    pub expected_hash: Option<String>,
}

pub fn builtin_presets() -> Vec<Preset> {
    vec![
        Preset::fixed(
            "Ubuntu 24.04.1 Desktop",
            "https://releases.ubuntu.com/24.04/ubuntu-24.04.1-desktop-amd64.iso",
        ),
        Preset::fixed(
            "Fedora 40 Workstation",
            "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Workstation/x86_64/iso/Fedora-Workstation-Live-x86_64-40-1.14.iso",
        ),
        Preset {
            label: "Kali Linux Live (latest)".to_string(),
            source: PresetSource::Dynamic(DynamicKind::KaliLatest),
            expected_hash: None,
        },
        Preset::fixed(
            "Arch Linux (latest)",
            "https://geo.mirror.pkgbuild.com/iso/latest/archlinux-x86_64.iso",
        ),
        Preset::fixed(
            "Tails (latest)",
            "https://mirrors.edge.kernel.org/tails/stable/tails-amd64-latest/tails-amd64-latest.iso",
        ),
        Preset::fixed(
            "Alpine Linux (latest stable)",
            "https://dl-cdn.alpinelinux.org/alpine/latest-stable/releases/x86_64/alpine-standard-latest-x86_64.iso",
        ),
        Preset::fixed(
            "openSUSE Tumbleweed DVD (Current)",
            "https://download.opensuse.org/tumbleweed/iso/openSUSE-Tumbleweed-DVD-x86_64-Current.iso",
        ),
    ]
}

/// Looks up the concrete URL (and, if published, the hash) of a dynamic preset.
pub trait Resolver: Send + Sync {
    fn resolve(&self) -> Result<ResolvedPreset>;
}

/// Scrapes a directory listing for the first file matching `pattern` and
/// reads its hash from a `SHA256SUMS` manifest next to it.
pub struct DirectoryIndexResolver {
    client: Client,
    base_url: String,
    pattern: Regex,
}

impl DirectoryIndexResolver {
    pub fn new(base_url: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::NetworkFailure(format!("bad resolver pattern: {e}")))?;
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("inscribe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            pattern,
        })
    }

    pub fn kali() -> Result<Self> {
        Self::with_kali_base(KALI_BASE_URL)
    }

    pub fn with_kali_base(base_url: &str) -> Result<Self> {
        Self::new(base_url, KALI_ISO_PATTERN)
    }

    fn fetch(&self, url: &str) -> Result<String> {
        let text = self.client.get(url).send()?.error_for_status()?.text()?;
        Ok(text)
    }

    fn published_hash(&self, file_name: &str) -> Option<String> {
        let url = format!("{}{SUMS_FILE}", self.base_url);
        match self.fetch(&url) {
            Ok(sums) => hash_from_sums(&sums, file_name),
            Err(err) => {
                debug!("no checksum manifest at {url}: {err}");
                None
            }
        }
    }
}

impl Resolver for DirectoryIndexResolver {
    fn resolve(&self) -> Result<ResolvedPreset> {
        let index = self.fetch(&self.base_url)?;
        let file_name = self
            .pattern
            .captures(&index)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                Error::NetworkFailure(format!("no matching image listed at {}", self.base_url))
            })?;
        let expected_hash = self.published_hash(&file_name);
        Ok(ResolvedPreset {
            url: format!("{}{file_name}", self.base_url),
            expected_hash,
        })
    }
}

/// The hash column of the first manifest line mentioning `file_name`.
pub fn hash_from_sums(sums: &str, file_name: &str) -> Option<String> {
    sums.lines()
        .find(|line| line.contains(file_name))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Case-insensitive comparison of two hex digests.
pub fn checksums_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

/// The most specific hash available: what the user typed, else what the
/// resolver found, else what the preset ships with.
pub fn effective_expected_hash(
    user: Option<&str>,
    discovered: Option<&str>,
    preset: Option<&str>,
) -> Option<String> {
    [user, discovered, preset]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|h| !h.is_empty())
        .map(str::to_string)
}

/// Where a download of `url` lands inside `dir`.
pub fn destination(dir: &Path, url: &str) -> PathBuf {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path
        .rsplit('/')
        .find(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("download.iso");
    dir.join(name)
}

pub struct PresetPipeline {
    resolvers: HashMap<DynamicKind, Box<dyn Resolver>>,
}

impl PresetPipeline {
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    /// A pipeline with the network resolvers for every dynamic preset.
    pub fn with_default_resolvers() -> Result<Self> {
        let mut pipeline = Self::new();
        pipeline.register(DynamicKind::KaliLatest, Box::new(DirectoryIndexResolver::kali()?));
        Ok(pipeline)
    }

    pub fn register(&mut self, kind: DynamicKind, resolver: Box<dyn Resolver>) {
        self.resolvers.insert(kind, resolver);
    }

    pub fn resolve(&self, preset: &Preset) -> Result<ResolvedPreset> {
        match &preset.source {
            PresetSource::Static { url } => Ok(ResolvedPreset {
                url: url.clone(),
                expected_hash: preset.expected_hash.clone(),
            }),
            PresetSource::Dynamic(kind) => {
                let resolver = self.resolvers.get(kind).ok_or_else(|| {
                    Error::NetworkFailure(format!("no resolver for '{}'", preset.label))
                })?;
                let mut resolved = resolver.resolve()?;
                resolved.expected_hash = effective_expected_hash(
                    None,
                    resolved.expected_hash.as_deref(),
                    preset.expected_hash.as_deref(),
                );
                info!("resolved '{}' to {}", preset.label, resolved.url);
                Ok(resolved)
            }
        }
    }
}

impl Default for PresetPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares a computed digest with `expected`, if one is set. Returns the
/// digest in lowercase.
pub fn verify_checksum(actual: &str, expected: Option<&str>) -> Result<String> {
    match expected.map(str::trim).filter(|e| !e.is_empty()) {
        Some(expected) if !checksums_match(actual, expected) => Err(Error::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual: actual.trim().to_ascii_lowercase(),
        }),
        _ => Ok(actual.trim().to_ascii_lowercase()),
    }
}
