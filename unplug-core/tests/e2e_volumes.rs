//! End-to-end tests for discovery and ejection.
//!
//! These drive `VolumeCatalog` and `EjectCoordinator` through their public
//! API against an in-memory mount table shared by a fake `VolumeSource` and
//! a fake `Ejector`, so that an eject is visible to the next enumeration the
//! same way it would be on a real system. Completions are delivered on a
//! real `UiQueue` drained by the test thread.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use unplug_core::catalog::{
    CatalogConfig, FilterPolicy, MountedVolume, VolumeAttributes, VolumeCatalog, VolumeSource,
    compare_names,
};
use unplug_core::eject::{EjectCoordinator, Ejector};
use unplug_core::error::EjectError;
use unplug_core::executor::UiQueue;

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct FakeVolume {
    path: &'static str,
    localized: Option<&'static str>,
    name: Option<&'static str>,
    internal: bool,
    ejectable: bool,
    unreadable: bool,
    busy: bool,
}

fn volume(path: &'static str) -> FakeVolume {
    FakeVolume {
        path,
        localized: None,
        name: None,
        internal: false,
        ejectable: true,
        unreadable: false,
        busy: false,
    }
}

fn internal(path: &'static str) -> FakeVolume {
    FakeVolume {
        internal: true,
        ejectable: false,
        ..volume(path)
    }
}

/// A mount table shared between the discovery and eject sides.
#[derive(Clone, Default)]
struct FakeOs {
    table: Arc<Mutex<Vec<FakeVolume>>>,
    query_fails: Arc<AtomicBool>,
}

impl FakeOs {
    fn with(volumes: Vec<FakeVolume>) -> Self {
        Self {
            table: Arc::new(Mutex::new(volumes)),
            ..Default::default()
        }
    }
}

impl VolumeSource for FakeOs {
    fn mounted_volumes(&self) -> Result<Vec<MountedVolume>> {
        if self.query_fails.load(Ordering::SeqCst) {
            bail!("mount table unavailable");
        }
        let table = self.table.lock().unwrap();
        Ok(table.iter().map(|v| MountedVolume::new(v.path)).collect())
    }

    fn resolve(&self, mounted: &MountedVolume) -> Result<VolumeAttributes> {
        let table = self.table.lock().unwrap();
        let Some(v) = table.iter().find(|v| Path::new(v.path) == mounted.mount_path) else {
            bail!("vanished");
        };
        if v.unreadable {
            bail!("stale file handle");
        }
        Ok(VolumeAttributes {
            localized_name: v.localized.map(String::from),
            name: v.name.map(String::from),
            is_ejectable: Some(v.ejectable),
            is_internal: Some(v.internal),
        })
    }
}

impl Ejector for FakeOs {
    fn unmount_and_eject(&self, mount_path: &Path) -> Result<(), EjectError> {
        let mut table = self.table.lock().unwrap();
        let path = mount_path.to_path_buf();
        match table.iter().position(|v| Path::new(v.path) == mount_path) {
            None => Err(EjectError::NotMounted { path }),
            Some(i) if table[i].busy => Err(EjectError::Busy { path }),
            Some(i) => {
                table.remove(i);
                Ok(())
            }
        }
    }
}

fn catalog(os: &FakeOs, policy: FilterPolicy) -> VolumeCatalog<FakeOs> {
    let config = CatalogConfig {
        policy,
        external_roots: vec![PathBuf::from("/Volumes")],
        ..Default::default()
    };
    VolumeCatalog::new(os.clone(), config)
}

fn mac_table() -> Vec<FakeVolume> {
    vec![
        internal("/"),
        FakeVolume {
            localized: Some("USB Stick"),
            name: Some("USB1"),
            ..volume("/Volumes/USB1")
        },
        internal("/Volumes/Macintosh HD"),
    ]
}

fn paths(records: &[unplug_core::DeviceRecord]) -> Vec<&Path> {
    records.iter().map(|r| r.mount_path.as_path()).collect()
}

/// Ejects `path` and drains the UI queue until the completion has run.
fn eject_and_wait(os: &FakeOs, path: &'static str) -> Vec<Result<(), EjectError>> {
    let queue = UiQueue::new();
    let coordinator = EjectCoordinator::new(os.clone(), queue.handle());
    let device = catalog(os, FilterPolicy::Broad)
        .enumerate()
        .into_iter()
        .find(|d| d.mount_path == Path::new(path))
        .expect("device is listed before the eject");

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    coordinator.eject(&device, move |result| sink.lock().unwrap().push(result));

    assert!(queue.run_next(TIMEOUT), "completion was not delivered");
    assert_eq!(queue.run_pending(), 0, "completion was delivered twice");
    let results = results.lock().unwrap().clone();
    results
}

// ── Discovery ────────────────────────────────────────────────────────────────

#[test]
fn strict_policy_lists_only_removable_media() {
    let os = FakeOs::with(mac_table());
    let devices = catalog(&os, FilterPolicy::Strict).enumerate();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].display_name, "USB Stick");
    assert_eq!(devices[0].mount_path, Path::new("/Volumes/USB1"));
    assert_eq!(devices[0].detail.as_deref(), Some("/Volumes/USB1"));
}

#[test]
fn broad_policy_keeps_internal_volumes_under_the_external_root() {
    let os = FakeOs::with(mac_table());
    let devices = catalog(&os, FilterPolicy::Broad).enumerate();

    assert_eq!(
        paths(&devices),
        vec![Path::new("/Volumes/Macintosh HD"), Path::new("/Volumes/USB1")]
    );
}

#[test]
fn broad_policy_drops_internal_volumes_elsewhere() {
    let mut table = mac_table();
    table.push(internal("/System/Volumes/Data"));
    table.push(FakeVolume {
        ejectable: false,
        ..volume("/net/share")
    });
    let os = FakeOs::with(table);

    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    let listed = paths(&devices);
    assert!(!listed.contains(&Path::new("/System/Volumes/Data")));
    assert!(listed.contains(&Path::new("/net/share")));

    let strict = catalog(&os, FilterPolicy::Strict).enumerate();
    assert!(!paths(&strict).contains(&Path::new("/net/share")));
}

#[test]
fn root_volume_is_never_listed() {
    // Even a root that claims to be removable stays hidden.
    let os = FakeOs::with(vec![volume("/"), volume("/Volumes/USB1")]);
    for policy in [FilterPolicy::Broad, FilterPolicy::Strict] {
        let devices = catalog(&os, policy).enumerate();
        assert!(devices.iter().all(|d| d.mount_path != Path::new("/")));
        assert_eq!(devices.len(), 1);
    }
}

#[test]
fn unreadable_volume_is_skipped_without_failing_the_rest() {
    let mut table = mac_table();
    table[1].unreadable = true;
    table.push(volume("/Volumes/SDCARD"));
    let os = FakeOs::with(table);

    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    assert_eq!(
        paths(&devices),
        vec![Path::new("/Volumes/Macintosh HD"), Path::new("/Volumes/SDCARD")]
    );
}

#[test]
fn failed_query_reports_an_empty_list() {
    let os = FakeOs::with(mac_table());
    os.query_fails.store(true, Ordering::SeqCst);
    assert!(catalog(&os, FilterPolicy::Broad).enumerate().is_empty());
}

#[test]
fn records_are_sorted_by_name_and_never_unnamed() {
    let os = FakeOs::with(vec![
        FakeVolume {
            localized: Some("zeta"),
            ..volume("/Volumes/z")
        },
        FakeVolume {
            name: Some("Alpha"),
            ..volume("/Volumes/a")
        },
        FakeVolume {
            localized: Some(""),
            ..volume("/Volumes/Gamma")
        },
        FakeVolume {
            localized: Some("beta"),
            ..volume("/Volumes/b")
        },
    ]);

    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    let names: Vec<&str> = devices.iter().map(|d| d.display_name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "beta", "Gamma", "zeta"]);
    assert!(devices.iter().all(|d| !d.display_name.is_empty()));
    assert!(
        devices
            .windows(2)
            .all(|w| compare_names(&w[0].display_name, &w[1].display_name).is_le())
    );
}

#[test]
fn duplicate_mount_paths_yield_one_record() {
    let os = FakeOs::with(vec![volume("/Volumes/USB1"), volume("/Volumes/USB1")]);
    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    assert_eq!(devices.len(), 1);
}

// ── Ejection ─────────────────────────────────────────────────────────────────

#[test]
fn successful_eject_completes_once_and_the_device_disappears() {
    let os = FakeOs::with(mac_table());
    let results = eject_and_wait(&os, "/Volumes/USB1");

    assert_eq!(results, vec![Ok(())]);
    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    assert!(!paths(&devices).contains(&Path::new("/Volumes/USB1")));
}

#[test]
fn busy_eject_reports_a_descriptive_error_and_the_device_stays() {
    let mut table = mac_table();
    table[1].busy = true;
    let os = FakeOs::with(table);

    let results = eject_and_wait(&os, "/Volumes/USB1");
    assert_eq!(results.len(), 1);
    let err = results[0].clone().unwrap_err();
    assert!(matches!(err, EjectError::Busy { .. }));
    assert!(err.to_string().contains("busy"), "{err}");

    let devices = catalog(&os, FilterPolicy::Broad).enumerate();
    assert!(paths(&devices).contains(&Path::new("/Volumes/USB1")));
}

#[test]
fn stale_device_fails_through_the_callback() {
    let os = FakeOs::with(mac_table());
    let queue = UiQueue::new();
    let coordinator = EjectCoordinator::new(os.clone(), queue.handle());
    let device = catalog(&os, FilterPolicy::Strict).enumerate().remove(0);

    // The stick is pulled between enumeration and eject.
    os.table.lock().unwrap().retain(|v| v.path != "/Volumes/USB1");

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    coordinator.eject(&device, move |result| sink.lock().unwrap().push(result));

    assert!(queue.run_next(TIMEOUT));
    assert_eq!(
        *results.lock().unwrap(),
        vec![Err(EjectError::NotMounted {
            path: PathBuf::from("/Volumes/USB1")
        })]
    );
}

/// An ejector that holds the unmount until the test lets it go.
struct Gated {
    inner: FakeOs,
    gate: crossbeam_channel::Receiver<()>,
}

impl Ejector for Gated {
    fn unmount_and_eject(&self, mount_path: &Path) -> Result<(), EjectError> {
        let _ = self.gate.recv_timeout(TIMEOUT);
        self.inner.unmount_and_eject(mount_path)
    }
}

#[test]
fn eject_returns_before_the_unmount_and_completes_on_the_ui_thread() {
    let os = FakeOs::with(mac_table());
    let (release, gate) = crossbeam_channel::bounded(1);
    let queue = UiQueue::new();
    let coordinator = EjectCoordinator::new(
        Gated {
            inner: os.clone(),
            gate,
        },
        queue.handle(),
    );
    let device = catalog(&os, FilterPolicy::Strict).enumerate().remove(0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    coordinator.eject(&device, move |result| {
        sink.lock().unwrap().push((result, thread::current().id()));
    });

    // The unmount is still gated, so nothing can have completed yet.
    assert!(seen.lock().unwrap().is_empty());
    release.send(()).unwrap();

    assert!(queue.run_next(TIMEOUT));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Ok(()));
    assert_eq!(seen[0].1, thread::current().id());
}

#[test]
fn concurrent_ejects_of_one_device_both_complete() {
    let os = FakeOs::with(mac_table());
    let queue = UiQueue::new();
    let coordinator = EjectCoordinator::new(os.clone(), queue.handle());
    let device = catalog(&os, FilterPolicy::Strict).enumerate().remove(0);

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let sink = Arc::clone(&results);
        coordinator.eject(&device, move |result| sink.lock().unwrap().push(result));
    }

    assert!(queue.run_next(TIMEOUT));
    assert!(queue.run_next(TIMEOUT));

    let mut results = results.lock().unwrap().clone();
    results.sort_by_key(|r| r.is_err());
    assert_eq!(
        results,
        vec![
            Ok(()),
            Err(EjectError::NotMounted {
                path: PathBuf::from("/Volumes/USB1")
            })
        ]
    );
}
