//! Init process that runs as pid 1 inside the new namespace
//!
//! The supervisor starts the workload and then reaps every process in the
//! namespace, not only the one it started: orphans are re-parented to pid 1,
//! so waiting on a single pid would leave zombies behind. It exits once
//! `waitpid(-1)` reports `ECHILD`.

use crate::pipe::{ControlReceiver, ReportWriter};
use crate::protocol::{ChildExit, ChildOutcome, ControlMessage, SupervisorReport};
use crate::{NsinitError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Instant;

/// Exit code of an init process whose reap loop failed
pub const SUPERVISOR_FAULT_EXIT: i32 = 255;

/// Highest aggregate exit code; sums above it are clamped so they can
/// neither wrap to 0 nor collide with `SUPERVISOR_FAULT_EXIT`
pub const MAX_AGGREGATE_EXIT: i32 = 254;

/// Running total of reaped children's exit codes
#[derive(Debug, Default)]
pub struct ExitAccumulator {
    total: i64,
    children: Vec<ChildExit>,
}

impl ExitAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state change reported by `waitpid`.
    ///
    /// Only normal exits contribute to the aggregate; signal deaths are
    /// recorded per child. Returns false for statuses that are not a
    /// termination (stop, continue, ptrace events).
    pub fn record(&mut self, status: WaitStatus) -> bool {
        let (pid, outcome) = match status {
            WaitStatus::Exited(pid, code) => {
                self.total += i64::from(code);
                (pid, ChildOutcome::Exited(code))
            }
            WaitStatus::Signaled(pid, signal, _) => (pid, ChildOutcome::Signaled(signal as i32)),
            _ => return false,
        };

        tracing::debug!(pid = pid.as_raw(), ?outcome, "reaped child");
        self.children.push(ChildExit {
            pid: pid.as_raw(),
            outcome,
        });
        true
    }

    /// Aggregate exit code for the init process
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::try_from(self.total.clamp(0, i64::from(MAX_AGGREGATE_EXIT)))
            .unwrap_or(MAX_AGGREGATE_EXIT)
    }

    #[must_use]
    pub fn children(&self) -> &[ChildExit] {
        &self.children
    }

    fn into_report(self) -> SupervisorReport {
        SupervisorReport {
            exit_code: self.exit_code(),
            children: self.children,
            ..SupervisorReport::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Workload started, children may still be added
    Running,
    /// Terminate requested; SIGTERM sent, SIGKILL pending at the deadline
    Terminating { deadline: Instant, escalated: bool },
    /// No children left
    Drained,
}

/// `waitpid(-1, flags)`, replaceable so the reap loops can be driven
/// without real children
type WaitFn = fn(Option<WaitPidFlag>) -> nix::Result<WaitStatus>;

fn wait_any(flags: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
    waitpid(None::<Pid>, flags)
}

/// Outcome of one non-blocking reap pass
enum Reap {
    Pending,
    Drained,
}

/// Body of the namespace's pid 1
#[derive(Debug)]
pub struct InitSupervisor {
    control: Option<ControlReceiver>,
    report: Option<ReportWriter>,
    state: SupervisorState,
    acc: ExitAccumulator,
    terminated: bool,
    spawn_failures: Vec<String>,
    wait: WaitFn,
}

impl InitSupervisor {
    #[must_use]
    pub fn new(control: Option<ControlReceiver>, report: Option<ReportWriter>) -> Self {
        Self {
            control,
            report,
            state: SupervisorState::Running,
            acc: ExitAccumulator::new(),
            terminated: false,
            spawn_failures: Vec::new(),
            wait: wait_any,
        }
    }

    #[cfg(test)]
    fn with_wait(mut self, wait: WaitFn) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Start the workload and reap until the namespace is empty.
    ///
    /// Returns the exit code for the init process: the aggregate of the
    /// children's exit codes, or `SUPERVISOR_FAULT_EXIT` if the workload
    /// could not be started or the reap loop failed.
    pub fn run(mut self, start: impl FnOnce() -> Result<()>) -> i32 {
        let outcome = self.supervise(start);

        let mut report = std::mem::take(&mut self.acc).into_report();
        report.terminated = self.terminated;
        report.spawn_failures = std::mem::take(&mut self.spawn_failures);

        if let Err(e) = outcome {
            tracing::error!(error = %e, "init supervisor fault");
            report.fault = Some(e.to_string());
            report.exit_code = SUPERVISOR_FAULT_EXIT;
        } else {
            tracing::info!(
                exit_code = report.exit_code,
                reaped = report.children.len(),
                "namespace drained"
            );
        }

        if let Some(writer) = self.report.take() {
            if let Err(e) = writer.send(&report) {
                tracing::warn!(error = %e, "failed to send supervisor report");
            }
        }

        report.exit_code
    }

    fn supervise(&mut self, start: impl FnOnce() -> Result<()>) -> Result<()> {
        // SIGCHLD must be routed to the self-pipe before the first child exists
        let sigchld = match self.control {
            Some(_) => Some(ChildSignal::install()?),
            None => None,
        };

        start()?;

        match sigchld {
            Some(sigchld) => self.reap_multiplexed(&sigchld),
            None => self.reap_blocking(),
        }
    }

    /// Plain reap loop: block on any child until none remain
    fn reap_blocking(&mut self) -> Result<()> {
        loop {
            match (self.wait)(None) {
                Ok(status) => {
                    self.acc.record(status);
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(NsinitError::Nix(e)),
            }
        }

        self.state = SupervisorState::Drained;
        Ok(())
    }

    /// Reap loop that also serves the control channel
    fn reap_multiplexed(&mut self, sigchld: &ChildSignal) -> Result<()> {
        loop {
            if matches!(self.reap_ready()?, Reap::Drained) {
                break;
            }

            let timeout = match self.state {
                SupervisorState::Terminating {
                    deadline,
                    escalated: false,
                } => {
                    // Long grace periods wake up early and poll again
                    let ms = deadline.saturating_duration_since(Instant::now()).as_millis();
                    PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
                }
                _ => PollTimeout::NONE,
            };

            let (child_ready, control_ready) = {
                let mut fds = vec![PollFd::new(sigchld.as_fd(), PollFlags::POLLIN)];
                if let Some(control) = &self.control {
                    fds.push(PollFd::new(control.as_fd(), PollFlags::POLLIN));
                }

                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(NsinitError::Nix(e)),
                }

                let ready = |fd: &PollFd<'_>| {
                    fd.revents().is_some_and(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                };
                (ready(&fds[0]), fds.get(1).is_some_and(ready))
            };

            if child_ready {
                sigchld.drain()?;
            }
            if control_ready {
                self.handle_control();
            }
            self.escalate_if_due();
        }

        self.state = SupervisorState::Drained;
        Ok(())
    }

    /// Reap every child that has already terminated
    fn reap_ready(&mut self) -> Result<Reap> {
        loop {
            match (self.wait)(Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(Reap::Pending),
                Ok(status) => {
                    self.acc.record(status);
                }
                Err(Errno::ECHILD) => return Ok(Reap::Drained),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(NsinitError::Nix(e)),
            }
        }
    }

    fn handle_control(&mut self) {
        let Some(control) = self.control.as_mut() else {
            return;
        };

        match control.recv() {
            Ok(Some(ControlMessage::Terminate { grace })) => {
                tracing::info!(?grace, "terminate requested");
                self.terminated = true;
                if matches!(self.state, SupervisorState::Running) {
                    signal_namespace(Signal::SIGTERM);
                    self.state = SupervisorState::Terminating {
                        deadline: Instant::now() + grace,
                        escalated: false,
                    };
                }
            }
            Ok(Some(ControlMessage::AddProc(spec))) => {
                if !matches!(self.state, SupervisorState::Running) {
                    tracing::warn!(program = %spec.program.display(), "namespace is terminating, process rejected");
                    self.spawn_failures.push(format!(
                        "{}: namespace is terminating",
                        spec.program.display()
                    ));
                } else if let Err(e) = spec.spawn() {
                    tracing::warn!(error = %e, "failed to add process");
                    self.spawn_failures.push(e.to_string());
                }
            }
            Ok(None) => {
                tracing::debug!("control channel closed");
                self.control = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping broken control channel");
                self.control = None;
            }
        }
    }

    fn escalate_if_due(&mut self) {
        if let SupervisorState::Terminating {
            deadline,
            escalated: false,
        } = self.state
        {
            if Instant::now() >= deadline {
                tracing::warn!("grace period expired, killing namespace");
                signal_namespace(Signal::SIGKILL);
                self.state = SupervisorState::Terminating {
                    deadline,
                    escalated: true,
                };
            }
        }
    }
}

/// Signal every process in the namespace except pid 1 itself
fn signal_namespace(signal: Signal) {
    match kill(Pid::from_raw(-1), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(error = %e, ?signal, "failed to signal namespace"),
    }
}

/// SIGCHLD delivered through a self-pipe so it can be polled
struct ChildSignal {
    rx: UnixStream,
}

impl ChildSignal {
    fn install() -> Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, tx)?;
        Ok(Self { rx })
    }

    fn drain(&self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for ChildSignal {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.rx.as_fd()
    }
}
