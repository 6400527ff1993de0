//! Mount/unmount change notifications.
//!
//! [`ChangeNotifier::subscribe`] starts a watcher thread that waits on a
//! [`MountMonitor`] and turns every event it reports into one call of a
//! payload-less refresh callback, delivered on the designated executor.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::executor::Executor;

/// How long a single monitor wait may block. Bounds how long
/// [`Subscription::unsubscribe`] takes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountEvent {
    Mounted(PathBuf),
    Unmounted(PathBuf),
}

/// A source of OS mount table events.
pub trait MountMonitor: Send + 'static {
    /// Blocks for at most `timeout` and returns the events observed, which
    /// may be none.
    fn wait(&mut self, timeout: Duration) -> Result<Vec<MountEvent>>;
}

pub struct ChangeNotifier {
    executor: Arc<dyn Executor>,
}

impl ChangeNotifier {
    pub fn new(executor: impl Executor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Starts delivering `on_change` for every mount and unmount event
    /// `monitor` reports, until the returned [`Subscription`] is released.
    pub fn subscribe<M, F>(&self, mut monitor: M, on_change: F) -> Result<Subscription>
    where
        M: MountMonitor,
        F: Fn() + Send + Sync + 'static,
    {
        let armed = Arc::new(AtomicBool::new(true));
        let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(on_change);
        let executor = Arc::clone(&self.executor);
        let flag = Arc::clone(&armed);

        let worker = thread::Builder::new()
            .name("unplug-notify".to_owned())
            .spawn(move || {
                let mut failing = false;
                while flag.load(Ordering::Acquire) {
                    let events = match monitor.wait(POLL_INTERVAL) {
                        Ok(events) => {
                            failing = false;
                            events
                        }
                        Err(e) => {
                            // Only the first failure of a streak is worth a warning.
                            if !failing {
                                warn!("mount monitor failed: {e:#}");
                            }
                            failing = true;
                            thread::sleep(POLL_INTERVAL);
                            continue;
                        }
                    };

                    for event in events {
                        debug!("{event:?}");
                        let armed = Arc::clone(&flag);
                        let on_change = Arc::clone(&on_change);
                        executor.execute(Box::new(move || {
                            if armed.load(Ordering::Acquire) {
                                on_change();
                            }
                        }));
                    }
                }
                debug!("change notifier stopped");
            })
            .context("failed to start the mount watcher thread")?;

        Ok(Subscription {
            armed,
            worker: Some(worker),
        })
    }
}

/// Keeps a change subscription alive. Dropping it unsubscribes.
#[must_use = "dropping the subscription stops change notifications"]
pub struct Subscription {
    armed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Stops the watcher. Refreshes that were queued but have not run yet
    /// are suppressed. Blocks for up to [`POLL_INTERVAL`].
    pub fn unsubscribe(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        self.armed.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            // Released from inside `on_change` on a synchronous executor: the
            // watcher is this thread and exits once the callback returns.
            if worker.thread().id() == thread::current().id() {
                debug!("subscription released from its own watcher");
                return;
            }
            if worker.join().is_err() {
                warn!("mount watcher thread panicked");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disarm();
    }
}
