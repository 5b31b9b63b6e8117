use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use inscribe_core::device::{Device, DeviceNode};
use inscribe_core::executor::{Executor, TaskId};
use inscribe_core::operation::{EraseMode, Filesystem, OperationState, Outcome};
use inscribe_core::orchestrator::{
    Notification, OperationReport, Orchestrator, TaskOutput, TaskReport,
};
use inscribe_core::preset::{self, PresetPipeline, PresetSource};
use inscribe_core::settings::{JsonFileStore, MemoryStore, SettingKey, SettingsStore};
use inscribe_core::validation::ValidationOutcome;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "inscribe")]
#[command(about = "Flash, erase and format removable drives, safely", version)]
struct Cli {
    /// Privileged helper that performs device writes
    #[arg(long, global = true, value_name = "PATH")]
    helper: Option<PathBuf>,

    /// Run the helper through `sudo -n`
    #[arg(long, global = true)]
    sudo: bool,

    /// Settings file (defaults to $XDG_CONFIG_HOME/inscribe/settings.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices
    List {
        /// Include internal disks even when they are hidden by settings
        #[arg(short, long)]
        all: bool,
    },
    /// Show disks with their partitions and filesystems
    Details {
        /// Only this disk or partition
        device: Option<PathBuf>,
    },
    /// Write an image to a device
    Flash {
        /// Image file to write
        image: PathBuf,
        /// Target device; prompts when omitted
        device: Option<PathBuf>,
        /// Expected SHA-256 of the image, checked before writing
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Securely erase a device
    Erase {
        /// Target device; prompts when omitted
        device: Option<PathBuf>,
        /// auto, zero, random, blkdiscard or wipefs (defaults to the setting)
        #[arg(short, long)]
        mode: Option<EraseMode>,
    },
    /// Repartition a device with a single filesystem
    Format {
        /// Target device; prompts when omitted
        device: Option<PathBuf>,
        /// ext4, fat32, exfat or ntfs
        #[arg(short, long, default_value = "exfat")]
        filesystem: Filesystem,
        /// Volume label
        #[arg(short, long, default_value = "INSCRIBE")]
        label: String,
    },
    /// Print the SHA-256 of an image, optionally checking it
    Hash {
        image: PathBuf,
        #[arg(long)]
        expected: Option<String>,
    },
    /// List the built-in image presets
    Presets,
    /// Download an image by URL or preset number
    Download {
        #[arg(required_unless_present = "preset")]
        url: Option<String>,
        /// Preset number from `inscribe presets`
        #[arg(short, long, conflicts_with = "url")]
        preset: Option<usize>,
        /// Where to save the image (defaults to the download directory setting)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Expected SHA-256; overrides any published checksum
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Check or install the tools the helper shells out to
    Deps {
        #[command(subcommand)]
        action: Option<DepsAction>,
    },
    /// Check that the helper is installed and executable
    Setup,
    /// Print the device list whenever it changes, until Ctrl+C
    Watch,
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set { key: SettingKey, value: String },
    Clear { key: SettingKey },
}

#[derive(Subcommand)]
enum DepsAction {
    Check,
    Install,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bar intact while a cancel is in flight.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original_termios) = &self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

#[cfg(target_os = "linux")]
fn executor(cli: &Cli) -> Result<Arc<dyn Executor>> {
    use inscribe_core::helper::{HelperConfig, HelperExecutor};

    let mut config = HelperConfig::default();
    if let Some(helper) = &cli.helper {
        config.program = helper.clone();
    }
    config.use_sudo = cli.sudo;
    Ok(Arc::new(HelperExecutor::new(config)))
}

#[cfg(not(target_os = "linux"))]
fn executor(_cli: &Cli) -> Result<Arc<dyn Executor>> {
    Err(anyhow!("inscribe only supports Linux"))
}

fn settings_store(cli: &Cli) -> Result<Box<dyn SettingsStore>> {
    match cli.config.clone().or_else(inscribe_core::settings::default_settings_path) {
        Some(path) => Ok(Box::new(JsonFileStore::open(path)?)),
        None => {
            log::warn!("no config directory; settings will not persist");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

fn build_orchestrator(cli: &Cli) -> Result<Orchestrator> {
    let presets = PresetPipeline::with_default_resolvers()?;
    let mut orch = Orchestrator::new(executor(cli)?, settings_store(cli)?, presets);
    orch.startup()?;
    print_notifications(&mut orch, None);
    Ok(orch)
}

/// Reports pulled out of the notification queue.
#[derive(Default)]
struct Reports {
    operation: Option<OperationReport>,
    tasks: Vec<TaskReport>,
}

/// Prints queued notifications, above `bar` when one is on screen, and
/// returns the reports among them.
fn print_notifications(orch: &mut Orchestrator, bar: Option<&ProgressBar>) -> Reports {
    let mut reports = Reports::default();
    for note in orch.drain_notifications() {
        let line = match note {
            Notification::Info(msg) => format!("{} {msg}", style("info:").cyan()),
            Notification::Success(msg) => format!("{} {msg}", style("ok:").green()),
            Notification::Warning(msg) => format!("{} {msg}", style("warning:").yellow().bold()),
            Notification::Error(msg) => format!("{} {msg}", style("error:").red().bold()),
            Notification::Finished(r) => {
                reports.operation = Some(r);
                continue;
            }
            Notification::TaskFinished(r) => {
                reports.tasks.push(r);
                continue;
            }
        };
        match bar {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }
    reports
}

/// Spins until `task` reports. Ctrl+C stops waiting; the task itself runs to
/// its end in the background.
fn await_task(
    orch: &mut Orchestrator,
    task: TaskId,
    message: String,
    running: &AtomicBool,
) -> Result<TaskOutput> {
    let spinner = ProgressBar::new_spinner().with_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    loop {
        orch.wait_event(POLL);
        let reports = print_notifications(orch, Some(&spinner));
        if let Some(report) = reports.tasks.into_iter().find(|r| r.task == task) {
            spinner.finish_and_clear();
            return Ok(report.result?);
        }
        if !running.load(Ordering::SeqCst) {
            spinner.abandon_with_message("interrupted");
            bail!("interrupted while waiting for {task}");
        }
    }
}

/// Hashes `image`, checking it against the expected hash if one is set.
fn hash_image(orch: &mut Orchestrator, image: &Path, running: &AtomicBool) -> Result<String> {
    let task = orch.verify_image(image)?;
    match await_task(orch, task, format!("hashing {}", image.display()), running)? {
        TaskOutput::Hashed { sha256, .. } => Ok(sha256),
        TaskOutput::Downloaded(_) => Err(anyhow!("{task} reported a download")),
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[&Device], prompt: &str) -> Result<PathBuf> {
    if devices.is_empty() {
        bail!("No devices found. Plug one in or pass --all to `inscribe list`.");
    }
    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;
    Ok(devices[selection].path.clone())
}

fn target(orch: &Orchestrator, device: Option<PathBuf>, prompt: &str) -> Result<PathBuf> {
    match device {
        Some(path) => Ok(path),
        None => select_device(&orch.devices(), prompt),
    }
}

/// Walks the user through the acknowledgments the open confirmation needs.
/// Returns whether the operation may start.
fn acknowledge_risks(orch: &mut Orchestrator) -> Result<bool> {
    let Some(confirmation) = orch.confirmation().cloned() else {
        return Err(anyhow!("no operation is awaiting confirmation"));
    };
    let theme = ColorfulTheme::default();
    let device = confirmation.request.device().to_path_buf();

    println!(
        "{} {} will destroy all data on {}.",
        style("WARNING:").red().bold(),
        confirmation.request,
        style(device.display()).cyan()
    );
    if confirmation.risky {
        println!(
            "{} {} does not look removable. It may be an internal or system disk.",
            style("DANGER:").red().bold().reverse(),
            device.display()
        );
    }
    println!();

    if confirmation.required.checkbox {
        let ticked = Confirm::with_theme(&theme)
            .with_prompt("I understand this may wipe my system disk")
            .default(false)
            .interact()?;
        if let Some(c) = orch.confirmation_mut() {
            c.set_checkbox(ticked);
        }
    }
    match confirmation.required.phrase {
        Some(phrase) => {
            let typed: String = Input::with_theme(&theme)
                .with_prompt(format!("Type {phrase} to confirm"))
                .allow_empty(true)
                .interact_text()?;
            if let Some(c) = orch.confirmation_mut() {
                c.set_typed_phrase(typed);
            }
        }
        None => {
            let proceed = Confirm::with_theme(&theme)
                .with_prompt("Are you sure you want to proceed?")
                .default(false)
                .interact()?;
            if !proceed {
                return Ok(false);
            }
        }
    }
    Ok(orch.can_confirm())
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos:>3}}% {{msg}}"
        ))?
        .progress_chars("■ "))
}

/// Confirms the open operation, then follows it to its single report.
fn run_operation(orch: &mut Orchestrator, running: &AtomicBool) -> Result<Option<OperationReport>> {
    if !acknowledge_risks(orch)? {
        orch.dismiss()?;
        println!("Operation cancelled.");
        return Ok(None);
    }
    // Ctrl+C during the prompts only means "not now".
    running.store(true, Ordering::SeqCst);

    let kind = orch.operation().kind();
    let bar = ProgressBar::new(100);
    bar.set_prefix(capitalize(&kind.to_string()));
    bar.set_style(bar_style("green")?);
    bar.enable_steady_tick(POLL);

    if let Err(e) = orch.confirm() {
        bar.finish_and_clear();
        print_notifications(orch, None);
        return Err(e.into());
    }

    loop {
        orch.wait_event(POLL);
        if !running.load(Ordering::SeqCst) && !orch.operation().cancel_requested {
            bar.set_message("cancelling...");
            if let Err(e) = orch.cancel() {
                bar.println(format!("{} {e}", style("error:").red()));
            }
        }
        let progress = orch.progress();
        if let Some(percent) = progress.percent() {
            bar.set_position(u64::from(percent));
        }
        if orch.state() == OperationState::Validating {
            bar.set_prefix("Validating");
            bar.set_message("reading back samples...");
        } else if let Some(speed) = progress.speed_mbs() {
            bar.set_message(format!("{speed:.1} MiB/s"));
        }
        if let Some(report) = print_notifications(orch, Some(&bar)).operation {
            match &report.outcome {
                Outcome::Completed => bar.finish_with_message("done"),
                Outcome::Cancelled => bar.abandon_with_message("cancelled"),
                Outcome::Failed(_) => bar.abandon_with_message("failed"),
            }
            orch.acknowledge()?;
            return Ok(Some(report));
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn describe(report: &OperationReport) -> Result<()> {
    match &report.outcome {
        Outcome::Completed => {
            println!("\n✨ {} finished successfully.", capitalize(&report.kind.to_string()));
            match &report.validation {
                Some(ValidationOutcome::Passed) => println!("   Sampled read-back matched the image."),
                Some(ValidationOutcome::Mismatch) => println!(
                    "   {} sampled read-back did not match the image.",
                    style("Warning:").yellow()
                ),
                Some(ValidationOutcome::Error(e)) => {
                    println!("   Sampled read-back could not run: {e}")
                }
                Some(ValidationOutcome::Skipped) | None => {}
            }
            Ok(())
        }
        Outcome::Cancelled | Outcome::Failed(_) => match report.outcome.error() {
            Some(e) => Err(anyhow::Error::new(e).context(format!("{} did not finish", report.kind))),
            None => Ok(()),
        },
    }
}

fn print_node(node: &DeviceNode, depth: usize) {
    let size = node
        .size_bytes
        .map(|b| format!("{:.2} GiB", b as f64 / (1024.0 * 1024.0 * 1024.0)))
        .unwrap_or_default();
    println!(
        "{:indent$}{:<14} {:<5} {:>11}  {:<6} {:<16} {}",
        "",
        node.name,
        node.kind,
        size,
        node.fstype.as_deref().unwrap_or(""),
        node.label.as_deref().unwrap_or(""),
        node.mountpoints.join(","),
        indent = depth * 2
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn print_devices(devices: &[&Device]) {
    if devices.is_empty() {
        println!("No devices found.");
        return;
    }
    println!("  {:<15} {:>12}  {:<24} {}", "DEVICE", "SIZE", "NAME", "TRANSPORT");
    println!("  {:-<15} {:->12}  {:-<24} {:-<10}", "", "", "", "");
    for device in devices {
        println!("  {device}");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();
    let mut orch = build_orchestrator(&cli)?;
    let result = dispatch(&cli, &mut orch, &running);
    print_notifications(&mut orch, None);
    orch.shutdown();
    result
}

fn dispatch(cli: &Cli, orch: &mut Orchestrator, running: &AtomicBool) -> Result<()> {
    match &cli.command {
        Commands::List { all } => {
            let devices: Vec<&Device> = if *all {
                orch.all_devices().iter().collect()
            } else {
                orch.devices()
            };
            print_devices(&devices);
        }
        Commands::Details { device: Some(device) } => match orch.device_details_for(device) {
            Some(node) => print_node(node, 0),
            None => bail!("no details for {}", device.display()),
        },
        Commands::Details { device: None } => match orch.device_details() {
            Some(tree) if !tree.is_empty() => {
                for disk in tree.iter() {
                    print_node(disk, 0);
                }
            }
            _ => println!("No device details available."),
        },
        Commands::Flash {
            image,
            device,
            sha256,
        } => {
            if sha256.is_some() {
                orch.set_expected_hash(sha256.clone());
                hash_image(orch, image, running)?;
            }
            let device = target(orch, device.clone(), "Select the device to FLASH")?;
            orch.open_flash(image.clone(), device)?;
            if let Some(report) = run_operation(orch, running)? {
                describe(&report)?;
            }
        }
        Commands::Erase { device, mode } => {
            let device = target(orch, device.clone(), "Select the device to ERASE")?;
            orch.open_erase(device, *mode)?;
            if let Some(report) = run_operation(orch, running)? {
                describe(&report)?;
            }
        }
        Commands::Format {
            device,
            filesystem,
            label,
        } => {
            let device = target(orch, device.clone(), "Select the device to FORMAT")?;
            orch.open_format(device, *filesystem, label.clone())?;
            if let Some(report) = run_operation(orch, running)? {
                describe(&report)?;
            }
        }
        Commands::Hash { image, expected } => {
            orch.set_expected_hash(expected.clone());
            let sha256 = hash_image(orch, image, running)?;
            println!("{sha256}  {}", image.display());
        }
        Commands::Presets => {
            for (index, preset) in preset::builtin_presets().iter().enumerate() {
                let source = match &preset.source {
                    PresetSource::Static { url } => url.clone(),
                    PresetSource::Dynamic(_) => "(latest, resolved at download time)".to_string(),
                };
                println!("  {:>2}  {:<32} {}", index + 1, preset.label, style(source).dim());
            }
        }
        Commands::Download {
            url,
            preset,
            output,
            sha256,
        } => {
            orch.set_expected_hash(sha256.clone());
            let url = match (url, preset) {
                (_, Some(number)) => {
                    let presets = preset::builtin_presets();
                    let chosen = number
                        .checked_sub(1)
                        .and_then(|i| presets.get(i))
                        .ok_or_else(|| anyhow!("no preset #{number}; see `inscribe presets`"))?;
                    orch.resolve_preset(chosen)?.url
                }
                (Some(url), None) => url.clone(),
                (None, None) => bail!("give a URL or --preset"),
            };
            let task = orch.download_image(&url, output.clone())?;
            let TaskOutput::Downloaded(image) =
                await_task(orch, task, format!("downloading {url}"), running)?
            else {
                bail!("{task} did not report a download");
            };
            println!("Saved {}", style(image.path.display()).cyan());
            println!("sha256 {}", image.sha256);
        }
        Commands::Settings { action } => match action {
            None | Some(SettingsAction::Show) => {
                for key in SettingKey::ALL {
                    let value = orch
                        .settings()
                        .value_of(key)
                        .unwrap_or_else(|| "(unset)".to_string());
                    println!("  {:<20} {value}", key.as_str());
                }
            }
            Some(SettingsAction::Set { key, value }) => {
                orch.update_setting(*key, value)?;
                println!("{key} = {value}");
            }
            Some(SettingsAction::Clear { key }) => {
                orch.clear_setting(*key)?;
                println!("{key} reset to default");
            }
        },
        Commands::Deps { action } => match action {
            None | Some(DepsAction::Check) => {
                for dep in orch.check_dependencies()? {
                    let mark = if dep.installed {
                        style("✔").green()
                    } else {
                        style("✘").red()
                    };
                    println!("  {mark} {:<12} ({})", dep.tool, dep.package);
                }
            }
            Some(DepsAction::Install) => orch.install_dependencies()?,
        },
        Commands::Setup => {
            orch.ensure_setup()?;
            println!("The helper is ready.");
        }
        Commands::Watch => {
            println!("Watching for device changes. Press Ctrl+C to stop.");
            let mut last: Option<Vec<PathBuf>> = None;
            while running.load(Ordering::SeqCst) {
                let current: Vec<PathBuf> = orch.devices().iter().map(|d| d.path.clone()).collect();
                if last.as_ref() != Some(&current) {
                    println!();
                    print_devices(&orch.devices());
                    last = Some(current);
                }
                orch.wait_event(Duration::from_millis(500));
                print_notifications(orch, None);
            }
        }
    }
    Ok(())
}
