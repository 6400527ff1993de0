//! The core, UI-agnostic library for the `unplug` volume ejector.
//!
//! `unplug-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `unplug`) or a tray menu. It handles
//! discovering which mounted volumes are external, ejecting them without
//! blocking the caller, and noticing when volumes come and go.
//!
//! The library is structured into several key modules:
//! - [`device`]: Contains the `DeviceRecord` value type.
//! - [`catalog`]: Discovers mounted volumes and decides which ones to show.
//! - [`eject`]: Unmounts and ejects a volume on a worker thread.
//! - [`notify`]: Turns mount table changes into refresh callbacks.
//! - [`executor`]: The designated execution context callbacks are delivered on.
//! - [`platform`]: The operating system backend for all of the above.
//!
//! All callbacks run on an [`executor::Executor`] chosen by the caller. A
//! front-end typically drains a [`executor::UiQueue`] on its main thread so
//! that its visible state is only ever touched from there.
//!
//! ## Example: Ejecting the First Volume
//!
//! ```rust,no_run
//! use unplug_core::catalog::{CatalogConfig, VolumeCatalog};
//! use unplug_core::eject::EjectCoordinator;
//! use unplug_core::executor::UiQueue;
//! use unplug_core::platform::SystemVolumes;
//! use std::sync::Arc;
//!
//! let catalog = Arc::new(VolumeCatalog::new(SystemVolumes, CatalogConfig::default()));
//! let devices = catalog.enumerate();
//! let device = devices.first().expect("No external volumes found.");
//!
//! let queue = UiQueue::new();
//! let ui = queue.handle();
//! let coordinator = EjectCoordinator::new(SystemVolumes, ui.clone());
//!
//! let refresh = Arc::clone(&catalog);
//! coordinator.eject(device, move |result| {
//!     if let Err(e) = result {
//!         eprintln!("Eject failed: {e}");
//!     }
//!     // The device list may have changed either way.
//!     println!("{} volumes left", refresh.enumerate().len());
//!     ui.quit();
//! });
//!
//! // This thread is the designated context: the completion runs here.
//! queue.run();
//! ```

pub mod catalog;
pub mod device;
pub mod eject;
pub mod error;
pub mod executor;
pub mod notify;
#[cfg(target_os = "linux")]
mod os_options;
pub mod platform;

pub use catalog::{CatalogConfig, FilterPolicy, VolumeCatalog};
pub use device::DeviceRecord;
pub use eject::EjectCoordinator;
pub use error::EjectError;
pub use notify::{ChangeNotifier, Subscription};
