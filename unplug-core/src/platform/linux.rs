use crate::catalog::{MountedVolume, VolumeAttributes, VolumeSource};
use crate::eject::Ejector;
use crate::error::EjectError;
use crate::notify::{MountEvent, MountMonitor};
use crate::os_options::open_device_nonblocking;
use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::bounded;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::statvfs::statvfs;
use nix::ioctl_none_bad;
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use sysinfo::Disks;
use tracing::{debug, info};

mod udisks;

use self::udisks::{Failure, Released, Udisks, Unavailable};

/// Where udisks and friends mount external volumes.
pub const DEFAULT_EXTERNAL_ROOTS: &[&str] = &["/media", "/run/media", "/mnt"];

const SYS_BLOCK: &str = "/sys/block";
const SYS_CLASS_BLOCK: &str = "/sys/class/block";
const BY_LABEL: &str = "/dev/disk/by-label";
const BY_PARTLABEL: &str = "/dev/disk/by-partlabel";
const PROC_MOUNTS: &str = "/proc/self/mounts";

// A `hard` NFS mount whose server is gone blocks stat calls indefinitely.
const NETWORK_STAT_TIMEOUT: Duration = Duration::from_secs(2);

// Device-mapper stacks (LUKS on LVM on USB) are rarely deeper than this.
const MAX_SLAVE_DEPTH: usize = 4;

ioctl_none_bad!(cdrom_eject, 0x5309);
ioctl_none_bad!(loop_clr_fd, 0x4C01);

/// The live Linux volume subsystem: the mount table via `sysinfo`, device
/// properties via sysfs and udev, and `umount2(2)` for ejecting.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemVolumes;

impl VolumeSource for SystemVolumes {
    /// `sysinfo` already drops pseudo filesystems; mounts under the kernel's
    /// own trees are dropped here as well.
    fn mounted_volumes(&self) -> Result<Vec<MountedVolume>> {
        let disks = Disks::new_with_refreshed_list();
        Ok(disks
            .iter()
            .filter(|disk| !is_hidden_mount_point(disk.mount_point()))
            .map(|disk| MountedVolume {
                mount_path: disk.mount_point().to_path_buf(),
                source: non_empty(disk.name()),
                fs_type: non_empty(disk.file_system()),
            })
            .collect())
    }

    /// Fails when the mount point cannot be stat'ed (stale network mount,
    /// yanked device). Volumes without a backing block device are internal
    /// unless they are network or user (FUSE) mounts.
    fn resolve(&self, volume: &MountedVolume) -> Result<VolumeAttributes> {
        let fs_type = volume.fs_type.as_deref().unwrap_or_default();
        if is_network_fs(fs_type) {
            stat_within(&volume.mount_path, NETWORK_STAT_TIMEOUT)?;
        } else {
            statvfs(volume.mount_path.as_path())
                .with_context(|| format!("cannot stat {}", volume.mount_path.display()))?;
        }

        let Some(device) = volume.source.as_deref().and_then(block_device) else {
            return Ok(non_block_attributes(fs_type));
        };

        let disk = BlockDisk::probe(&device);
        Ok(VolumeAttributes {
            localized_name: find_link_name(Path::new(BY_LABEL), &device),
            name: find_link_name(Path::new(BY_PARTLABEL), &device),
            is_ejectable: Some(disk.ejectable()),
            is_internal: Some(!disk.ejectable()),
        })
    }
}

impl Ejector for SystemVolumes {
    /// Goes through udisks when it manages the device, so that polkit can
    /// authorize an unprivileged user. Otherwise unmounts directly, which
    /// needs `CAP_SYS_ADMIN`. Either way the disk is only released once
    /// nothing else on it is mounted.
    fn unmount_and_eject(&self, mount_path: &Path) -> Result<(), EjectError> {
        let source = Disks::new_with_refreshed_list()
            .iter()
            .find(|disk| disk.mount_point() == mount_path)
            .map(|disk| disk.name().to_string_lossy().into_owned());
        let Some(source) = source else {
            return Err(EjectError::NotMounted {
                path: mount_path.to_path_buf(),
            });
        };
        let device = block_device(&source);

        if let Some(device) = &device {
            match Udisks::connect().and_then(|udisks| {
                let block = udisks.block_for(device)?;
                Ok((udisks, block))
            }) {
                Ok((udisks, block)) => return eject_with_udisks(&udisks, &block, mount_path, device),
                Err(Unavailable(reason)) => {
                    debug!("{reason}; unmounting {} directly", mount_path.display())
                }
            }
        }

        umount2(mount_path, MntFlags::empty()).map_err(|errno| unmount_error(mount_path, errno))?;
        info!("unmounted {} ({source})", mount_path.display());

        let Some(device) = device else {
            return Ok(());
        };
        let disk = backing_disk(&device_name(&device), 0);
        if disk_still_mounted(&disk) {
            debug!("{disk} still has mounted volumes, leaving it attached");
            return Ok(());
        }

        release_disk(&disk).map_err(|e| EjectError::Detach {
            path: mount_path.to_path_buf(),
            device: format!("/dev/{disk}"),
            reason: format!("{e:#}"),
        })
    }
}

fn eject_with_udisks(
    udisks: &Udisks,
    block: &zbus::zvariant::OwnedObjectPath,
    mount_path: &Path,
    device: &Path,
) -> Result<(), EjectError> {
    udisks
        .unmount(block)
        .map_err(|failure| udisks_error(mount_path, &failure))?;
    info!("unmounted {} through udisks", mount_path.display());

    let name = device_name(device);
    if name.starts_with("dm-") {
        // The mapping still holds the disk open until it is locked or removed.
        debug!("{} is a mapped device, leaving its disk attached", device.display());
        return Ok(());
    }

    let disk = backing_disk(&name, 0);
    if disk_still_mounted(&disk) {
        debug!("{disk} still has mounted volumes, leaving it attached");
        return Ok(());
    }

    let node = Path::new("/dev").join(&disk);
    let detach = |reason: String| EjectError::Detach {
        path: mount_path.to_path_buf(),
        device: node.display().to_string(),
        reason,
    };
    let whole = udisks
        .block_for(&node)
        .map_err(|Unavailable(reason)| detach(reason))?;
    match udisks.release(&whole) {
        Ok(Released::Nothing) => debug!("{} can now be unplugged", node.display()),
        Ok(released) => info!("{}: {released:?}", node.display()),
        Err(failure) => return Err(detach(failure.to_string())),
    }
    Ok(())
}

/// Maps a failed udisks call onto the eject error kinds.
fn udisks_error(path: &Path, failure: &Failure) -> EjectError {
    let path = path.to_path_buf();
    match failure.kind() {
        "DeviceBusy" => EjectError::Busy { path },
        "NotMounted" => EjectError::NotMounted { path },
        "NotAuthorized" | "NotAuthorizedCanObtain" | "NotAuthorizedDismissed" => {
            EjectError::PermissionDenied { path }
        }
        _ => EjectError::Os {
            path,
            message: failure.to_string(),
        },
    }
}

fn disk_still_mounted(disk: &str) -> bool {
    Disks::new_with_refreshed_list().iter().any(|other| {
        block_device(&other.name().to_string_lossy())
            .is_some_and(|d| backing_disk(&device_name(&d), 0) == disk)
    })
}

/// Filesystems served over the network or by a user-space daemon.
fn is_network_fs(fs_type: &str) -> bool {
    fs_type.starts_with("nfs")
        || matches!(
            fs_type,
            "cifs" | "smb3" | "smbfs" | "ncpfs" | "afs" | "9p" | "ceph" | "glusterfs" | "davfs"
        )
        || fs_type.starts_with("fuse.")
}

/// Attributes of a mount with no block device behind it (ZFS datasets,
/// overlays, tmpfs, network shares).
fn non_block_attributes(fs_type: &str) -> VolumeAttributes {
    VolumeAttributes {
        is_ejectable: Some(false),
        is_internal: Some(!is_network_fs(fs_type)),
        ..Default::default()
    }
}

/// `statvfs` on a helper thread, giving up after `timeout`. A thread stuck
/// on an unresponsive server is left behind.
fn stat_within(path: &Path, timeout: Duration) -> Result<()> {
    let (tx, rx) = bounded(1);
    let target = path.to_path_buf();
    thread::Builder::new()
        .name("unplug-stat".to_owned())
        .spawn(move || {
            let _ = tx.send(statvfs(target.as_path()).map(drop));
        })
        .context("failed to start stat thread")?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result.with_context(|| format!("cannot stat {}", path.display())),
        Err(_) => bail!("{} did not respond within {timeout:?}", path.display()),
    }
}

fn release_disk(disk: &str) -> Result<()> {
    let node = Path::new("/dev").join(disk);
    if disk.starts_with("sr") {
        let file = open_device_nonblocking(&node)?;
        unsafe { cdrom_eject(file.as_raw_fd()) }.context("CDROMEJECT failed")?;
        info!("ejected media from {}", node.display());
    } else if disk.starts_with("loop") {
        let file = open_device_nonblocking(&node)?;
        unsafe { loop_clr_fd(file.as_raw_fd()) }.context("LOOP_CLR_FD failed")?;
        info!("detached disk image from {}", node.display());
    } else {
        debug!("{} can now be unplugged", node.display());
    }
    Ok(())
}

fn unmount_error(path: &Path, errno: Errno) -> EjectError {
    let path = path.to_path_buf();
    match errno {
        Errno::EBUSY => EjectError::Busy { path },
        Errno::EINVAL | Errno::ENOENT => EjectError::NotMounted { path },
        Errno::EPERM | Errno::EACCES => EjectError::PermissionDenied { path },
        other => EjectError::Os {
            path,
            message: other.desc().to_string(),
        },
    }
}

/// Mount points under the kernel's own trees, which are never user volumes.
fn is_hidden_mount_point(path: &Path) -> bool {
    ["/proc", "/sys", "/dev"]
        .iter()
        .any(|root| path.starts_with(root))
        || (path.starts_with("/run") && !path.starts_with("/run/media"))
}

fn non_empty(value: &OsStr) -> Option<String> {
    Some(value.to_string_lossy().into_owned()).filter(|v| !v.is_empty())
}

/// The canonical device node behind a mount source, if it is a block device.
fn block_device(source: &str) -> Option<PathBuf> {
    if !source.starts_with("/dev/") {
        return None;
    }
    Some(fs::canonicalize(source).unwrap_or_else(|_| PathBuf::from(source)))
}

fn device_name(device: &Path) -> String {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(disk: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from(SYS_BLOCK).join(disk).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Maps a partition to the disk that holds it (`sdb1` -> `sdb`,
/// `mmcblk0p1` -> `mmcblk0`). Whole disks map to themselves.
fn whole_disk_name(name: &str) -> String {
    let class = Path::new(SYS_CLASS_BLOCK).join(name);
    if class.join("partition").exists() {
        if let Some(parent) = fs::canonicalize(&class)
            .ok()
            .and_then(|real| real.parent().and_then(Path::file_name).map(OsStr::to_owned))
        {
            return parent.to_string_lossy().into_owned();
        }
    }
    name.to_string()
}

/// Follows device-mapper `slaves/` links down to the physical disk.
fn backing_disk(name: &str, depth: usize) -> String {
    let disk = whole_disk_name(name);
    if depth >= MAX_SLAVE_DEPTH {
        return disk;
    }

    let slave = fs::read_dir(Path::new(SYS_BLOCK).join(&disk).join("slaves"))
        .ok()
        .and_then(|entries| entries.filter_map(Result::ok).next())
        .map(|entry| entry.file_name().to_string_lossy().into_owned());

    match slave {
        Some(slave) => backing_disk(&slave, depth + 1),
        None => disk,
    }
}

/// What sysfs says about the disk behind a volume.
#[derive(Debug)]
struct BlockDisk {
    name: String,
    removable: bool,
    hotplug_bus: bool,
}

impl BlockDisk {
    fn probe(device: &Path) -> Self {
        let name = backing_disk(&device_name(device), 0);

        let removable = read_sys_file(&name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let hotplug_bus = fs::canonicalize(Path::new(SYS_BLOCK).join(&name))
            .map(|real| is_hotplug_path(&real))
            .unwrap_or(false);

        let disk = Self {
            name,
            removable,
            hotplug_bus,
        };
        debug!("{} -> {disk:?}", device.display());
        disk
    }

    /// Loop devices are disk images; `sr` devices are optical drives.
    fn ejectable(&self) -> bool {
        self.removable
            || self.hotplug_bus
            || self.name.starts_with("loop")
            || self.name.starts_with("sr")
    }
}

fn is_hotplug_path(sysfs_path: &Path) -> bool {
    let path = sysfs_path.to_string_lossy();
    ["/usb", "/mmc_host/", "/firewire", "/thunderbolt"]
        .iter()
        .any(|bus| path.contains(bus))
}

/// Finds the udev symlink in `dir` that points at `device` and returns its
/// decoded name.
fn find_link_name(dir: &Path, device: &Path) -> Option<String> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| fs::canonicalize(entry.path()).is_ok_and(|target| target == device))
        .map(|entry| decode_udev_name(&entry.file_name().to_string_lossy()))
        .filter(|name| !name.is_empty())
}

/// Undoes udev's `\xHH` escaping of label symlink names.
fn decode_udev_name(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            if let Some(byte) = raw
                .get(i + 2..i + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Watches `/proc/self/mounts`, which the kernel flags with `POLLPRI` on
/// every mount table change, and reports which visible mount points came
/// and went.
pub struct ProcMountsMonitor {
    file: File,
    known: BTreeSet<PathBuf>,
}

pub type SystemMonitor = ProcMountsMonitor;

/// Opens the platform's mount table monitor.
pub fn mount_monitor() -> Result<SystemMonitor> {
    ProcMountsMonitor::open()
}

impl ProcMountsMonitor {
    pub fn open() -> Result<Self> {
        let mut file = File::open(PROC_MOUNTS).with_context(|| format!("cannot open {PROC_MOUNTS}"))?;
        let known = read_mount_points(&mut file)?;
        Ok(Self { file, known })
    }
}

impl MountMonitor for ProcMountsMonitor {
    fn wait(&mut self, timeout: Duration) -> Result<Vec<MountEvent>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLPRI)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => 0,
                Err(e) => return Err(anyhow!("poll on {PROC_MOUNTS} failed: {e}")),
            }
        };
        if ready == 0 {
            return Ok(Vec::new());
        }

        let current = read_mount_points(&mut self.file)?;
        let events = diff_mount_points(&self.known, &current);
        self.known = current;
        Ok(events)
    }
}

fn read_mount_points(file: &mut File) -> Result<BTreeSet<PathBuf>> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)
        .with_context(|| format!("cannot read {PROC_MOUNTS}"))?;
    Ok(parse_mount_points(&contents))
}

/// Extracts the visible mount points (second field) from `/proc/mounts`
/// formatted text.
fn parse_mount_points(contents: &[u8]) -> BTreeSet<PathBuf> {
    contents
        .split(|b| *b == b'\n')
        .filter_map(|line| line.split(|b| *b == b' ').nth(1))
        .map(|field| PathBuf::from(OsString::from_vec(unescape_octal(field))))
        .filter(|path| !is_hidden_mount_point(path))
        .collect()
}

/// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        if field[i] == b'\\' && i + 3 < field.len() {
            let digits = &field[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(field[i]);
        i += 1;
    }
    out
}

fn diff_mount_points(before: &BTreeSet<PathBuf>, after: &BTreeSet<PathBuf>) -> Vec<MountEvent> {
    after
        .difference(before)
        .cloned()
        .map(MountEvent::Mounted)
        .chain(before.difference(after).cloned().map(MountEvent::Unmounted))
        .collect()
}
