//! The designated execution context.
//!
//! Every callback the core hands back to its caller (eject completions and
//! change notifications) is routed through an [`Executor`]. A front-end picks
//! one thread to own its visible state and drains a [`UiQueue`] there; tests
//! can use [`Immediate`] to run callbacks inline.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::debug;

/// A unit of work scheduled onto the designated context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

/// Runs every job immediately on the thread that submits it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl Executor for Immediate {
    fn execute(&self, job: Job) {
        job()
    }
}

enum Message {
    Run(Job),
    Quit,
}

/// A FIFO of jobs drained by whichever thread calls [`UiQueue::run`] or
/// [`UiQueue::run_pending`]. That thread is the designated context.
pub struct UiQueue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

/// Cloneable, thread-safe submitter for a [`UiQueue`].
#[derive(Clone)]
pub struct UiHandle {
    sender: Sender<Message>,
}

impl UiHandle {
    /// Asks the thread inside [`UiQueue::run`] to return once the jobs queued
    /// before this call have run.
    pub fn quit(&self) {
        let _ = self.sender.send(Message::Quit);
    }
}

impl Executor for UiHandle {
    fn execute(&self, job: Job) {
        if self.sender.send(Message::Run(job)).is_err() {
            debug!("ui queue is gone, dropping job");
        }
    }
}

impl Default for UiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UiQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn handle(&self) -> UiHandle {
        UiHandle {
            sender: self.sender.clone(),
        }
    }

    /// Runs jobs as they arrive until [`UiHandle::quit`] is called.
    pub fn run(&self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Run(job) => job(),
                Message::Quit => break,
            }
        }
    }

    /// Runs the jobs already queued without waiting for more. Stops early at
    /// a quit request. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(Message::Run(job)) => {
                    job();
                    ran += 1;
                }
                Ok(Message::Quit) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    return ran;
                }
            }
        }
    }

    /// Waits up to `timeout` for one job and runs it. Returns `false` on
    /// timeout or on a quit request.
    pub fn run_next(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(Message::Run(job)) => {
                job();
                true
            }
            Ok(Message::Quit) => false,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
