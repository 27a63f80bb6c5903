//! Error types for nsinit-core

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NsinitError {
    #[error("namespace launch failed: {0}")]
    Launch(Errno),

    #[error("wait on init process failed: {0}")]
    Wait(Errno),

    #[error("control channel error: {0}")]
    Control(String),

    #[error("stack is still owned by a running init process")]
    StackInUse,

    #[error("stack was already taken back from this handle")]
    StackReclaimed,

    #[error("workload error: {0}")]
    Workload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl NsinitError {
    /// The OS error behind a launch or wait failure, if any
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Launch(errno) | Self::Wait(errno) | Self::Nix(errno) => Some(*errno),
            _ => None,
        }
    }

    /// True for the "no such process" condition returned by a handle
    /// that has already been reaped
    #[must_use]
    pub fn is_no_such_process(&self) -> bool {
        self.errno() == Some(Errno::ESRCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_carries_errno() {
        let err = NsinitError::Launch(Errno::EPERM);
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert!(err.to_string().starts_with("namespace launch failed"));
    }

    #[test]
    fn reaped_handle_reports_no_such_process() {
        assert!(NsinitError::Wait(Errno::ESRCH).is_no_such_process());
        assert!(!NsinitError::Wait(Errno::ECHILD).is_no_such_process());
        assert!(!NsinitError::StackInUse.is_no_such_process());
        assert!(!NsinitError::StackReclaimed.is_no_such_process());
    }
}
