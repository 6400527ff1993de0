//! Volume discovery and classification.
//!
//! The catalog asks a [`VolumeSource`] for the mounted volumes, resolves each
//! one's attributes, and keeps the ones its [`FilterPolicy`] considers
//! external. Discovery never fails from the caller's point of view: an
//! unreadable volume is skipped, and a failed query yields an empty list.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use icu_collator::options::{CollatorOptions, Strength};
use icu_collator::{Collator, CollatorBorrowed};
use tracing::{debug, warn};

use crate::device::DeviceRecord;
use crate::platform;

/// One row of the OS mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountedVolume {
    pub mount_path: PathBuf,
    /// Device node or remote share the volume is mounted from (e.g. `/dev/sdb1`).
    pub source: Option<String>,
    pub fs_type: Option<String>,
}

impl MountedVolume {
    pub fn new(mount_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_path: mount_path.into(),
            source: None,
            fs_type: None,
        }
    }
}

/// Per-volume attributes resolved from the OS. Missing flags read as `false`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeAttributes {
    pub localized_name: Option<String>,
    pub name: Option<String>,
    pub is_ejectable: Option<bool>,
    pub is_internal: Option<bool>,
}

impl VolumeAttributes {
    pub fn ejectable(&self) -> bool {
        self.is_ejectable.unwrap_or(false)
    }

    pub fn internal(&self) -> bool {
        self.is_internal.unwrap_or(false)
    }
}

/// Read-only access to the OS volume subsystem.
pub trait VolumeSource: Send + Sync {
    /// Lists the currently mounted, non-hidden volumes.
    fn mounted_volumes(&self) -> Result<Vec<MountedVolume>>;

    /// Resolves the attributes of one volume. May fail for stale or
    /// unreadable mounts.
    fn resolve(&self, volume: &MountedVolume) -> Result<VolumeAttributes>;
}

/// Decides which volumes count as external.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterPolicy {
    /// Keep a volume unless it is internal, not ejectable, and mounted outside
    /// every external-mount root. Surfaces disk images, network mounts and
    /// folder mounts as well as removable media.
    #[default]
    Broad,
    /// Keep only volumes that are ejectable and not internal.
    Strict,
}

impl FilterPolicy {
    pub fn includes(self, attributes: &VolumeAttributes, under_external_root: bool) -> bool {
        let internal = attributes.internal();
        let ejectable = attributes.ejectable();
        match self {
            FilterPolicy::Broad => !(internal && !ejectable && !under_external_root),
            FilterPolicy::Strict => ejectable && !internal,
        }
    }
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPolicy::Broad => f.write_str("broad"),
            FilterPolicy::Strict => f.write_str("strict"),
        }
    }
}

/// Catalog settings. Fixed for the lifetime of a [`VolumeCatalog`].
#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub policy: FilterPolicy,
    /// The root volume, never listed.
    pub root: PathBuf,
    /// Directories under which the OS mounts external volumes.
    pub external_roots: Vec<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            policy: FilterPolicy::default(),
            root: PathBuf::from("/"),
            external_roots: platform::DEFAULT_EXTERNAL_ROOTS
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl CatalogConfig {
    /// `true` when `path` is strictly inside one of the external-mount roots.
    pub fn is_under_external_root(&self, path: &Path) -> bool {
        self.external_roots
            .iter()
            .any(|root| path != root && path.starts_with(root))
    }
}

pub struct VolumeCatalog<S> {
    source: S,
    config: CatalogConfig,
}

impl<S: VolumeSource> VolumeCatalog<S> {
    pub fn new(source: S, config: CatalogConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Lists the external volumes currently mounted, sorted by display name.
    ///
    /// Blocks on filesystem metadata calls; expect a few milliseconds per
    /// mounted volume.
    pub fn enumerate(&self) -> Vec<DeviceRecord> {
        let volumes = match self.source.mounted_volumes() {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!("volume query failed, reporting no devices: {e:#}");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for volume in volumes {
            if !seen.insert(volume.mount_path.clone()) {
                continue;
            }

            let attributes = match self.source.resolve(&volume) {
                Ok(attributes) => attributes,
                Err(e) => {
                    debug!("skipping {}: {e:#}", volume.mount_path.display());
                    continue;
                }
            };

            if volume.mount_path == self.config.root {
                continue;
            }

            let under_root = self.config.is_under_external_root(&volume.mount_path);
            if !self.config.policy.includes(&attributes, under_root) {
                debug!(
                    "{} excluded by {} policy (internal: {}, ejectable: {})",
                    volume.mount_path.display(),
                    self.config.policy,
                    attributes.internal(),
                    attributes.ejectable(),
                );
                continue;
            }

            records.push(DeviceRecord::from_attributes(volume.mount_path, &attributes));
        }

        records.sort_by(|a, b| compare_names(&a.display_name, &b.display_name));
        records
    }
}

thread_local! {
    // Secondary strength: accents count, case does not.
    static COLLATOR: Option<CollatorBorrowed<'static>> = {
        let mut options = CollatorOptions::default();
        options.strength = Some(Strength::Secondary);
        Collator::try_new(Default::default(), options)
            .inspect_err(|e| warn!("collation data unavailable, sorting by code point: {e}"))
            .ok()
    };
}

/// Locale-aware, case-insensitive ordering, with the raw string as a
/// tie-break so the result is deterministic.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    COLLATOR
        .with(|collator| match collator {
            Some(collator) => collator.compare(a, b),
            None => a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase)),
        })
        .then_with(|| a.cmp(b))
}
