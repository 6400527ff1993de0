//! Unmounting and ejecting through the udisks2 daemon on the system bus.
//!
//! udisks checks polkit on the caller's behalf, so a desktop user can release
//! their own removable media without `CAP_SYS_ADMIN`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::debug;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedObjectPath, Value};

const SERVICE: &str = "org.freedesktop.UDisks2";
const MANAGER_PATH: &str = "/org/freedesktop/UDisks2/Manager";
const MANAGER: &str = "org.freedesktop.UDisks2.Manager";
const BLOCK: &str = "org.freedesktop.UDisks2.Block";
const FILESYSTEM: &str = "org.freedesktop.UDisks2.Filesystem";
const DRIVE: &str = "org.freedesktop.UDisks2.Drive";
const LOOP: &str = "org.freedesktop.UDisks2.Loop";

/// Object path udisks uses for "no drive" (loop devices, for one).
const NO_DRIVE: &str = "/";

type Options<'a> = HashMap<&'a str, Value<'a>>;

/// udisks cannot handle the request at all; the caller should fall back to
/// unmounting directly.
#[derive(Debug)]
pub(super) struct Unavailable(pub String);

/// A udisks call that reached the daemon and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Failure {
    /// D-Bus error name, e.g. `org.freedesktop.UDisks2.Error.DeviceBusy`.
    pub name: String,
    pub message: String,
}

impl Failure {
    /// The last segment of the error name (`DeviceBusy`).
    pub fn kind(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or_default()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.name.is_empty(), self.message.is_empty()) {
            (true, _) => f.write_str(&self.message),
            (false, true) => f.write_str(&self.name),
            (false, false) => write!(f, "{} ({})", self.message, self.kind()),
        }
    }
}

impl From<zbus::Error> for Failure {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, detail, _) => Failure {
                name: name.to_string(),
                message: detail.unwrap_or_default(),
            },
            other => Failure {
                name: String::new(),
                message: other.to_string(),
            },
        }
    }
}

/// What [`Udisks::release`] did with the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Released {
    LoopDeleted,
    Ejected,
    PoweredOff,
    /// Media ejected and the drive powered down.
    EjectedAndPoweredOff,
    /// The drive supports neither; it can simply be unplugged.
    Nothing,
}

pub(super) struct Udisks {
    connection: Connection,
}

impl Udisks {
    pub(super) fn connect() -> Result<Self, Unavailable> {
        Connection::system()
            .map(|connection| Self { connection })
            .map_err(|e| Unavailable(format!("no system bus: {e}")))
    }

    fn proxy<'a>(&'a self, path: &'a str, interface: &'a str) -> zbus::Result<Proxy<'a>> {
        Proxy::new(&self.connection, SERVICE, path, interface)
    }

    /// Finds the block object udisks manages for `device` (`/dev/sdb1`).
    pub(super) fn block_for(&self, device: &Path) -> Result<OwnedObjectPath, Unavailable> {
        let unavailable = |e: zbus::Error| Unavailable(format!("udisks: {e}"));

        let manager = self.proxy(MANAGER_PATH, MANAGER).map_err(unavailable)?;
        let mut spec: Options<'_> = HashMap::new();
        spec.insert("path", Value::from(device.to_string_lossy().into_owned()));
        let options: Options<'_> = HashMap::new();

        let blocks: Vec<OwnedObjectPath> = manager
            .call("ResolveDevice", &(spec, options))
            .map_err(unavailable)?;

        blocks
            .into_iter()
            .next()
            .ok_or_else(|| Unavailable(format!("udisks does not know {}", device.display())))
    }

    /// Unmounts the filesystem on `block`, asking polkit for permission if
    /// needed.
    pub(super) fn unmount(&self, block: &OwnedObjectPath) -> Result<(), Failure> {
        let proxy = self.proxy(block.as_str(), FILESYSTEM)?;
        let options: Options<'_> = HashMap::new();
        let () = proxy.call("Unmount", &(options))?;
        Ok(())
    }

    /// Detaches the disk behind the whole-disk object `disk`: deletes loop
    /// devices, ejects media and powers the drive down where supported.
    pub(super) fn release(&self, disk: &OwnedObjectPath) -> Result<Released, Failure> {
        let block = self.proxy(disk.as_str(), BLOCK)?;
        let drive: OwnedObjectPath = block.get_property("Drive")?;

        if drive.as_str() == NO_DRIVE {
            let loop_device = self.proxy(disk.as_str(), LOOP)?;
            let options: Options<'_> = HashMap::new();
            return match loop_device.call::<_, _, ()>("Delete", &(options)) {
                Ok(()) => Ok(Released::LoopDeleted),
                Err(e) => {
                    let failure = Failure::from(e);
                    // Not a loop device after all; nothing to detach.
                    if matches!(failure.kind(), "UnknownMethod" | "UnknownInterface") {
                        Ok(Released::Nothing)
                    } else {
                        Err(failure)
                    }
                }
            };
        }

        let drive = self.proxy(drive.as_str(), DRIVE)?;
        let ejectable: bool = drive.get_property("Ejectable")?;
        let can_power_off: bool = drive.get_property("CanPowerOff")?;
        debug!("drive {}: ejectable={ejectable} can_power_off={can_power_off}", disk.as_str());

        if ejectable {
            let options: Options<'_> = HashMap::new();
            let () = drive.call("Eject", &(options))?;
        }
        if can_power_off {
            let options: Options<'_> = HashMap::new();
            let () = drive.call("PowerOff", &(options))?;
        }

        Ok(match (ejectable, can_power_off) {
            (true, true) => Released::EjectedAndPoweredOff,
            (true, false) => Released::Ejected,
            (false, true) => Released::PoweredOff,
            (false, false) => Released::Nothing,
        })
    }
}
