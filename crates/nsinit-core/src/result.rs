//! Outcome of a namespace's init process

use crate::protocol::SupervisorReport;
use crate::supervisor::SUPERVISOR_FAULT_EXIT;
use serde::{Deserialize, Serialize};

/// How the init process itself ended, as seen from the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStatus {
    /// Exited with the given code
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

/// Result of waiting on a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceExit {
    /// Status of pid 1
    pub status: InitStatus,

    /// Report sent by a supervised init process before it exited
    pub report: Option<SupervisorReport>,
}

impl NamespaceExit {
    /// Exit code of the init process, if it exited normally
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self.status {
            InitStatus::Exited(code) => Some(code),
            InitStatus::Signaled(_) => None,
        }
    }

    /// Whether the init process exited because the supervisor failed.
    ///
    /// With a report the answer is exact; without one the fault sentinel
    /// exit code is the only evidence.
    #[must_use]
    pub fn is_supervisor_fault(&self) -> bool {
        match &self.report {
            Some(report) => report.is_fault(),
            None => self.code() == Some(SUPERVISOR_FAULT_EXIT),
        }
    }

    /// Check if the namespace finished cleanly (exit code 0, no fault)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code() == Some(0) && !self.is_supervisor_fault()
    }
}
