use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use unplug_core::catalog::{CatalogConfig, FilterPolicy, VolumeCatalog};
use unplug_core::device::DeviceRecord;
use unplug_core::eject::EjectCoordinator;
use unplug_core::error::EjectError;
use unplug_core::executor::UiQueue;
use unplug_core::notify::ChangeNotifier;
use unplug_core::platform::{self, SystemVolumes};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

type Catalog = VolumeCatalog<SystemVolumes>;

#[derive(Parser)]
#[command(name = "unplug")]
#[command(about = "List and safely eject removable volumes", version)]
struct Cli {
    /// Which volumes count as external
    #[arg(long, value_enum, default_value_t = Policy::Broad, global = true)]
    policy: Policy,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List external volumes
    List,
    /// Unmount and eject a volume
    Eject {
        /// Mount path or name of the volume; prompts when omitted
        target: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the volume list again whenever a volume is mounted or unmounted
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Removable media plus disk images, network shares and anything under
    /// the external mount roots
    Broad,
    /// Only ejectable, non-internal media
    Strict,
}

impl From<Policy> for FilterPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Broad => FilterPolicy::Broad,
            Policy::Strict => FilterPolicy::Strict,
        }
    }
}

/// Logs go to stderr so listings on stdout stay clean. `RUST_LOG` wins over
/// `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("unplug={level},unplug_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `watch` runs until Ctrl+C. Without this the terminal would echo `^C` into
/// the middle of the last listing. The original state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let original = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(stdout().as_raw_fd()).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(stdout().as_raw_fd(), TCSANOW, &quiet).is_ok()
                });
            Self { original }
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
        if let Some(ref original) = self.original {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

fn print_devices(devices: &[DeviceRecord]) {
    if devices.is_empty() {
        println!("No external volumes found.");
        return;
    }

    println!("Found {} external volumes:", devices.len());
    println!("\n  {:<25} {}", "NAME", "MOUNTED AT");
    println!("  {:-<25} {:-<30}", "", "");
    for device in devices {
        let location = device.detail.as_deref().unwrap_or("(path not displayable)");
        println!("  {:<25} {}", device.display_name, style(location).cyan());
    }
}

/// Picks the device named by `target`, matching the mount path exactly or
/// the display name case-insensitively.
fn find_target<'a>(devices: &'a [DeviceRecord], target: &str) -> Result<&'a DeviceRecord> {
    let by_path = devices.iter().find(|d| d.mount_path == Path::new(target));
    let found = by_path.or_else(|| {
        let wanted = target.to_lowercase();
        devices
            .iter()
            .find(|d| d.display_name.to_lowercase() == wanted)
    });

    match found {
        Some(device) => {
            debug!(
                "'{target}' matched {} by {}",
                device.mount_path.display(),
                if by_path.is_some() { "path" } else { "name" }
            );
            Ok(device)
        }
        None => Err(anyhow!("No external volume matches '{target}'.")),
    }
}

/// Lets the user pick a volume. `None` when they back out with Esc.
fn pick_device(devices: &[DeviceRecord]) -> Result<Option<&DeviceRecord>> {
    if devices.is_empty() {
        return Err(anyhow!("No external volumes found."));
    }

    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which volume should be ejected? (Esc to cancel)")
        .items(devices)
        .default(0)
        .interact_opt()?;

    Ok(choice.map(|index| &devices[index]))
}

fn confirm_eject(device: &DeviceRecord) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Unmount and eject {}?", device.display_name))
        .default(true)
        .interact()?)
}

fn eject(catalog: Arc<Catalog>, target: Option<String>, yes: bool) -> Result<()> {
    let devices = catalog.enumerate();
    let device = match &target {
        Some(target) => find_target(&devices, target)?,
        None => match pick_device(&devices)? {
            Some(device) => device,
            None => {
                println!("Eject cancelled.");
                return Ok(());
            }
        },
    };

    println!("  Volume: {}", style(&device.display_name).cyan());
    println!("  Path:   {}", style(device.mount_path.display()).cyan());
    println!();

    if !yes && !confirm_eject(device)? {
        println!("Eject cancelled.");
        return Ok(());
    }

    let queue = UiQueue::new();
    let ui = queue.handle();
    let coordinator = EjectCoordinator::new(SystemVolumes, ui.clone());
    let failure: Arc<OnceLock<EjectError>> = Arc::new(OnceLock::new());

    let name = device.display_name.clone();
    let outcome = Arc::clone(&failure);
    coordinator.eject(device, move |result| {
        match result {
            Ok(()) => println!("\n✨ {} can be safely removed.", style(&name).cyan()),
            Err(e) => {
                let _ = outcome.set(e);
            }
        }
        // The list may have changed even if the eject reported a failure.
        println!();
        print_devices(&catalog.enumerate());
        ui.quit();
    });

    // Completions are delivered here, on the main thread.
    queue.run();

    match failure.get() {
        Some(e) => Err(anyhow!("Eject failed: {e}")),
        None => Ok(()),
    }
}

fn watch(catalog: Arc<Catalog>) -> Result<()> {
    // This guard will be dropped when watch() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let queue = UiQueue::new();
    let ui = queue.handle();

    print_devices(&catalog.enumerate());

    let notifier = ChangeNotifier::new(ui.clone());
    let monitor = platform::mount_monitor()?;
    let refresh = Arc::clone(&catalog);
    let subscription = notifier.subscribe(monitor, move || {
        println!();
        print_devices(&refresh.enumerate());
    })?;
    info!("watching for mount changes");

    // Set up the Ctrl+C handler to stop the UI loop.
    let stop = ui.clone();
    ctrlc::set_handler(move || stop.quit())?;

    queue.run();
    subscription.unsubscribe();
    println!("\nStopped watching.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CatalogConfig {
        policy: cli.policy.into(),
        ..Default::default()
    };
    debug!(
        "policy: {}, external roots: {:?}",
        config.policy, config.external_roots
    );
    let catalog = Arc::new(VolumeCatalog::new(SystemVolumes, config));

    match cli.command {
        Commands::List => print_devices(&catalog.enumerate()),
        Commands::Eject { target, yes } => eject(catalog, target, yes)?,
        Commands::Watch => watch(catalog)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use unplug_core::catalog::VolumeAttributes;

    fn record(path: &str, name: &str) -> DeviceRecord {
        let attributes = VolumeAttributes {
            localized_name: Some(name.to_owned()),
            ..Default::default()
        };
        DeviceRecord::from_attributes(path.into(), &attributes)
    }

    #[test]
    fn target_matches_mount_path_or_name() {
        let devices = [
            record("/media/me/USB", "Backup"),
            record("/media/me/CARD", "Photos"),
        ];

        assert_eq!(
            find_target(&devices, "/media/me/CARD").unwrap().display_name,
            "Photos"
        );
        assert_eq!(
            find_target(&devices, "backup").unwrap().mount_path,
            Path::new("/media/me/USB")
        );
        assert!(find_target(&devices, "USB").is_err());
    }

    #[test]
    fn mount_path_wins_over_a_matching_name() {
        let devices = [
            record("/media/a", "/media/b"),
            record("/media/b", "Stick"),
        ];
        assert_eq!(
            find_target(&devices, "/media/b").unwrap().display_name,
            "Stick"
        );
    }

    #[test]
    fn policy_flag_maps_onto_the_catalog_policy() {
        let cli = Cli::parse_from(["unplug", "--policy", "strict", "list"]);
        assert_eq!(FilterPolicy::from(cli.policy), FilterPolicy::Strict);
        let cli = Cli::parse_from(["unplug", "eject", "-v", "--yes", "Photos"]);
        assert_eq!(FilterPolicy::from(cli.policy), FilterPolicy::Broad);
        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.command, Commands::Eject { yes: true, target: Some(_) }));
    }
}
