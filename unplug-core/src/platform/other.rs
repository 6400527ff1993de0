use crate::catalog::{MountedVolume, VolumeAttributes, VolumeSource};
use crate::eject::Ejector;
use crate::error::EjectError;
use crate::notify::{MountEvent, MountMonitor};
use anyhow::{Result, bail};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_EXTERNAL_ROOTS: &[&str] = if cfg!(target_os = "macos") {
    &["/Volumes"]
} else {
    &[]
};

/// Placeholder for targets without a volume backend.
///
/// Discovery reports no volumes and every eject fails with
/// [`EjectError::Unsupported`], so front-ends still build and run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemVolumes;

impl VolumeSource for SystemVolumes {
    fn mounted_volumes(&self) -> Result<Vec<MountedVolume>> {
        // TODO: Query the Disk Arbitration framework on macOS and
        // `GetLogicalDriveStringsW` on Windows.
        bail!("volume discovery is not supported on this platform")
    }

    fn resolve(&self, volume: &MountedVolume) -> Result<VolumeAttributes> {
        bail!(
            "cannot resolve {}: volume discovery is not supported on this platform",
            volume.mount_path.display()
        )
    }
}

impl Ejector for SystemVolumes {
    fn unmount_and_eject(&self, _mount_path: &Path) -> Result<(), EjectError> {
        Err(EjectError::Unsupported)
    }
}

#[derive(Debug)]
pub struct SystemMonitor;

pub fn mount_monitor() -> Result<SystemMonitor> {
    bail!("mount notifications are not supported on this platform")
}

impl MountMonitor for SystemMonitor {
    fn wait(&mut self, _timeout: Duration) -> Result<Vec<MountEvent>> {
        bail!("mount notifications are not supported on this platform")
    }
}
