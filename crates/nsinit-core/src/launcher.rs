//! Creates new user and pid namespaces with a Rust entry point as pid 1

use crate::config::LaunchConfig;
use crate::handle::NamespaceHandle;
use crate::isolation::Stack;
use crate::isolation::clone::{CloneEntry, clone_with_stack};
use crate::pipe::{self, ControlSender, ReportReader};
use crate::supervisor::{InitSupervisor, SUPERVISOR_FAULT_EXIT};
use crate::workload::CommandSpec;
use crate::Result;
use nix::sys::signal::Signal;

/// Launches init processes into fresh namespaces
#[derive(Debug, Clone, Default)]
pub struct NamespaceLauncher {
    config: LaunchConfig,
}

impl NamespaceLauncher {
    #[must_use]
    pub const fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run `entry` as pid 1 of new namespaces on a freshly allocated stack.
    ///
    /// `entry` runs in the child process only; its return value becomes the
    /// init process's exit code. Returns as soon as the child exists.
    ///
    /// The child is created with a raw `clone(2)`, which skips `fork`
    /// handlers: call this while the process is single-threaded, or make
    /// sure no other thread can hold the allocator or stdio locks.
    pub fn launch<F>(&self, entry: F) -> Result<NamespaceHandle>
    where
        F: FnMut() -> i32,
    {
        self.config.validate()?;
        let stack = Stack::new(self.config.stack_size)?;
        self.launch_on(stack, entry)
    }

    /// Like [`launch`](Self::launch), reusing a stack reclaimed from a
    /// handle that has already been waited on
    pub fn launch_on<F>(&self, stack: Stack, entry: F) -> Result<NamespaceHandle>
    where
        F: FnMut() -> i32,
    {
        self.config.namespaces.validate()?;
        self.clone_init(stack, Box::new(entry), None, None)
    }

    /// Start `workload` under an [`InitSupervisor`].
    ///
    /// The handle gets a control channel (`terminate`, `add_proc`) and
    /// receives the supervisor's report on `wait`.
    pub fn spawn(&self, workload: CommandSpec) -> Result<NamespaceHandle> {
        self.config.validate()?;
        let stack = Stack::new(self.config.stack_size)?;

        let (control_tx, control_rx) = pipe::control_channel()?;
        let (report_rx, report_tx) = pipe::report_channel()?;

        // Parent ends, closed in the child before supervising
        let parent_fds = [control_tx.raw_fd(), report_rx.raw_fd()];
        let mut init = Some((control_rx, report_tx, workload));

        let entry = move || {
            for fd in parent_fds {
                // SAFETY: these descriptors are this process's copies of the
                // parent's ends and nothing in the child refers to them
                unsafe { libc::close(fd) };
            }

            let Some((control, report, workload)) = init.take() else {
                return SUPERVISOR_FAULT_EXIT;
            };

            tracing::debug!(pid = std::process::id(), "init supervisor starting");
            InitSupervisor::new(Some(control), Some(report))
                .run(move || workload.spawn().map(drop))
        };

        self.clone_init(stack, Box::new(entry), Some(control_tx), Some(report_rx))
    }

    fn clone_init(
        &self,
        mut stack: Stack,
        entry: CloneEntry<'_>,
        control: Option<ControlSender>,
        report: Option<ReportReader>,
    ) -> Result<NamespaceHandle> {
        let flags = self.config.namespaces.to_clone_flags();

        // SAFETY: flags never include CLONE_VM and the stack moves into the
        // handle, which keeps it alive until the child is reaped
        let pid = unsafe { clone_with_stack(entry, &mut stack, flags, Some(Signal::SIGCHLD)) }
            .inspect_err(|e| tracing::warn!(error = %e, ?flags, "failed to create namespace"))?;

        tracing::info!(
            pid = pid.as_raw(),
            ?flags,
            stack_size = stack.len(),
            "namespace init process started"
        );

        Ok(NamespaceHandle::new(
            pid,
            stack,
            control,
            report,
            self.config.terminate_grace,
        ))
    }
}
