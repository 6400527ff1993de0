use std::path::PathBuf;

use thiserror::Error;

/// Why an eject did not complete.
///
/// A device that vanished between enumeration and eject is reported as
/// [`EjectError::NotMounted`], like any other missing mount.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EjectError {
    #[error("{} is busy; close any programs using it and try again", .path.display())]
    Busy { path: PathBuf },

    #[error("{} is not mounted", .path.display())]
    NotMounted { path: PathBuf },

    #[error("not permitted to unmount {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("{} was unmounted but {device} could not be released: {reason}", .path.display())]
    Detach {
        path: PathBuf,
        device: String,
        reason: String,
    },

    #[error("failed to unmount {}: {message}", .path.display())]
    Os { path: PathBuf, message: String },

    #[error("ejecting volumes is not supported on this platform")]
    Unsupported,

    #[error("the eject of {} was abandoned before it reported a result", .path.display())]
    Abandoned { path: PathBuf },
}
