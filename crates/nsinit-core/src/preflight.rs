//! Host checks: can this process create user and pid namespaces?
//!
//! Purely informational. Launching never depends on this report; a refused
//! `clone(2)` is reported by the launcher itself.

use caps::{CapSet, Capability};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostReport {
    /// Kernel release (`uname -r`)
    pub kernel: Option<String>,
    /// Effective uid is 0
    pub root: bool,
    /// CAP_SYS_ADMIN is in the effective set
    pub cap_sys_admin: bool,
    /// `kernel.unprivileged_userns_clone`, on kernels that have it
    pub unprivileged_userns_clone: Option<bool>,
    /// `user.max_user_namespaces`
    pub max_user_namespaces: Option<u64>,
}

impl HostReport {
    /// Best guess whether a user namespace can be created by this process
    #[must_use]
    pub fn userns_allowed(&self) -> bool {
        if self.max_user_namespaces == Some(0) {
            return false;
        }
        self.root || self.cap_sys_admin || self.unprivileged_userns_clone.unwrap_or(true)
    }
}

pub fn inspect_host() -> HostReport {
    let report = HostReport {
        kernel: nix::sys::utsname::uname()
            .ok()
            .map(|u| u.release().to_string_lossy().into_owned()),
        root: nix::unistd::geteuid().is_root(),
        cap_sys_admin: caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)
            .unwrap_or(false),
        unprivileged_userns_clone: read_sysctl("/proc/sys/kernel/unprivileged_userns_clone")
            .map(|v| v != 0),
        max_user_namespaces: read_sysctl("/proc/sys/user/max_user_namespaces"),
    };

    tracing::debug!(?report, "host inspected");
    report
}

fn read_sysctl(path: impl AsRef<Path>) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_namespace_limit_forbids_userns() {
        let report = HostReport {
            root: true,
            max_user_namespaces: Some(0),
            ..HostReport::default()
        };
        assert!(!report.userns_allowed());
    }

    #[test]
    fn disabled_unprivileged_clone_needs_privilege() {
        let mut report = HostReport {
            unprivileged_userns_clone: Some(false),
            max_user_namespaces: Some(1024),
            ..HostReport::default()
        };
        assert!(!report.userns_allowed());

        report.cap_sys_admin = true;
        assert!(report.userns_allowed());
    }

    #[test]
    fn report_matches_euid() {
        let report = inspect_host();
        assert_eq!(report.root, nix::unistd::geteuid().is_root());
        assert!(report.kernel.is_some());
    }
}
