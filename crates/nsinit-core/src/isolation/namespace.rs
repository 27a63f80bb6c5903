//! Namespaces requested for a new init process

use crate::{NsinitError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Configuration for namespace isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Create new user namespace
    pub user: bool,
    /// Create new PID namespace
    pub pid: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: true,
            pid: true,
            ipc: false,
            uts: false,
        }
    }
}

impl NamespaceConfig {
    /// Convert to nix CloneFlags
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// An init process only makes sense in a fresh pid namespace
    pub fn validate(&self) -> Result<()> {
        if !self.pid {
            return Err(NsinitError::Config(
                "a new pid namespace is required for an init process".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requests_user_and_pid() {
        let flags = NamespaceConfig::default().to_clone_flags();
        assert_eq!(flags, CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID);
    }

    #[test]
    fn optional_namespaces_are_added() {
        let config = NamespaceConfig {
            ipc: true,
            uts: true,
            ..NamespaceConfig::default()
        };
        let flags = config.to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn pid_namespace_is_mandatory() {
        let config = NamespaceConfig {
            pid: false,
            ..NamespaceConfig::default()
        };
        assert!(matches!(config.validate(), Err(NsinitError::Config(_))));
    }
}
