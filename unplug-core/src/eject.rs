//! Asynchronous unmount-and-eject.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::device::DeviceRecord;
use crate::error::EjectError;
use crate::executor::Executor;

/// The blocking OS primitive behind an eject.
pub trait Ejector: Send + Sync + 'static {
    fn unmount_and_eject(&self, mount_path: &Path) -> Result<(), EjectError>;
}

impl<E: Ejector + ?Sized> Ejector for Arc<E> {
    fn unmount_and_eject(&self, mount_path: &Path) -> Result<(), EjectError> {
        (**self).unmount_and_eject(mount_path)
    }
}

/// Runs ejects on worker threads and reports back on the designated executor.
///
/// Concurrent ejects are neither serialized nor coalesced; the OS call is the
/// serialization point.
pub struct EjectCoordinator {
    ejector: Arc<dyn Ejector>,
    executor: Arc<dyn Executor>,
}

impl EjectCoordinator {
    pub fn new(ejector: impl Ejector, executor: impl Executor) -> Self {
        Self {
            ejector: Arc::new(ejector),
            executor: Arc::new(executor),
        }
    }

    /// Requests an unmount and eject of `device`.
    ///
    /// Returns immediately. `on_complete` runs exactly once, on the executor,
    /// with `Ok(())` when the volume was released or the error the OS
    /// reported. A device that has already disappeared is an ordinary
    /// failure. The caller should re-enumerate afterwards either way.
    pub fn eject<F>(&self, device: &DeviceRecord, on_complete: F)
    where
        F: FnOnce(Result<(), EjectError>) + Send + 'static,
    {
        let mount_path = device.mount_path.clone();
        let completion = Completion {
            callback: Some(on_complete),
            executor: Arc::clone(&self.executor),
            mount_path: mount_path.clone(),
        };
        let ejector = Arc::clone(&self.ejector);

        info!("ejecting {} ({})", device.display_name, mount_path.display());

        let spawned = thread::Builder::new()
            .name("unplug-eject".to_owned())
            .spawn(move || {
                let result = ejector.unmount_and_eject(&completion.mount_path);
                completion.deliver(result);
            });

        // On failure the closure, and the completion inside it, is already
        // dropped; its Drop impl reports the abandoned eject.
        if let Err(e) = spawned {
            warn!("could not start eject worker for {}: {e}", mount_path.display());
        }
    }
}

/// Delivers the outcome of one eject. If it is dropped before
/// [`Completion::deliver`] runs (spawn failure, worker panic) the callback
/// still fires once with [`EjectError::Abandoned`].
struct Completion<F>
where
    F: FnOnce(Result<(), EjectError>) + Send + 'static,
{
    callback: Option<F>,
    executor: Arc<dyn Executor>,
    mount_path: PathBuf,
}

impl<F> Completion<F>
where
    F: FnOnce(Result<(), EjectError>) + Send + 'static,
{
    fn deliver(mut self, result: Result<(), EjectError>) {
        self.send(result);
    }

    fn send(&mut self, result: Result<(), EjectError>) {
        if let Some(callback) = self.callback.take() {
            match &result {
                Ok(()) => info!("ejected {}", self.mount_path.display()),
                Err(e) => warn!("eject failed: {e}"),
            }
            self.executor.execute(Box::new(move || callback(result)));
        }
    }
}

impl<F> Drop for Completion<F>
where
    F: FnOnce(Result<(), EjectError>) + Send + 'static,
{
    fn drop(&mut self) {
        let path = self.mount_path.clone();
        self.send(Err(EjectError::Abandoned { path }));
    }
}
