use std::fmt;
use std::path::{Path, PathBuf};

use crate::catalog::VolumeAttributes;

/// Opaque, stable handle to a mounted volume.
///
/// Two records from the same enumeration never share an identity. Across
/// enumerations, equal identities only mean the same mount path was seen again.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(PathBuf);

impl VolumeId {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A mounted volume eligible for display and ejection.
///
/// Records are value objects. They are rebuilt wholesale by every call to
/// [`crate::catalog::VolumeCatalog::enumerate`] and are never patched in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Identity key for list diffing, and the eject target.
    pub identity: VolumeId,
    /// Human-readable label. Never empty.
    pub display_name: String,
    /// Secondary text: the mount path, when it can be shown as text.
    pub detail: Option<String>,
    /// Absolute filesystem path the volume is mounted at.
    pub mount_path: PathBuf,
}

impl DeviceRecord {
    /// Builds a record for `mount_path` from its resolved attributes.
    ///
    /// The display name falls back from the localized name to the raw volume
    /// name, then to the last component of the mount path. Empty names are
    /// treated as missing.
    pub fn from_attributes(mount_path: PathBuf, attributes: &VolumeAttributes) -> Self {
        let display_name = non_empty(attributes.localized_name.as_deref())
            .or_else(|| non_empty(attributes.name.as_deref()))
            .map(str::to_owned)
            .unwrap_or_else(|| fallback_name(&mount_path));

        Self {
            identity: VolumeId(mount_path.clone()),
            display_name,
            detail: mount_path.to_str().map(str::to_owned),
            mount_path,
        }
    }
}

fn non_empty(name: Option<&str>) -> Option<&str> {
    name.filter(|n| !n.trim().is_empty())
}

fn fallback_name(mount_path: &Path) -> String {
    mount_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| mount_path.display().to_string())
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match &self.detail {
            Some(detail) => format!("[{detail}]"),
            None => "[path not displayable]".to_string(),
        };

        write!(f, "{:<25} {}", self.display_name, location)
    }
}
