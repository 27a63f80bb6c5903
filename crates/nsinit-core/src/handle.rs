//! Parent-side handle on a namespace's init process

use crate::isolation::Stack;
use crate::pipe::{ControlSender, ReportReader};
use crate::protocol::ControlMessage;
use crate::result::{InitStatus, NamespaceExit};
use crate::workload::CommandSpec;
use crate::{NsinitError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct HandleState {
    /// Set once the init process's exit status has been collected; the pid
    /// may belong to an unrelated process after that
    reaped: bool,
    /// Stack the init process was started on
    stack: Option<Stack>,
}

/// Handle on one namespace, identified by the pid of its init process.
///
/// All operations take `&self` so the handle can be shared between a thread
/// blocked in [`wait`](Self::wait) and code that terminates the namespace.
#[derive(Debug)]
pub struct NamespaceHandle {
    pid: Pid,
    state: Mutex<HandleState>,
    /// Serializes waiters; held across the blocking part of `wait`
    waiter: Mutex<Option<ReportReader>>,
    control: Mutex<Option<ControlSender>>,
    grace: Duration,
}

impl NamespaceHandle {
    pub(crate) fn new(
        pid: Pid,
        stack: Stack,
        control: Option<ControlSender>,
        report: Option<ReportReader>,
        grace: Duration,
    ) -> Self {
        Self {
            pid,
            state: Mutex::new(HandleState {
                reaped: false,
                stack: Some(stack),
            }),
            waiter: Mutex::new(report),
            control: Mutex::new(control),
            grace,
        }
    }

    /// Pid of the init process in the caller's pid namespace
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the init process has been waited on
    #[must_use]
    pub fn is_reaped(&self) -> bool {
        self.state.lock().reaped
    }

    /// Whether `terminate` and `add_proc` can reach the init process
    #[must_use]
    pub fn has_control(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Block until the init process exits, then reap it.
    ///
    /// Must be called once per handle. A second call fails with `ESRCH`.
    pub fn wait(&self) -> Result<NamespaceExit> {
        let mut waiter = self.waiter.lock();
        if self.is_reaped() {
            return Err(NsinitError::Wait(Errno::ESRCH));
        }

        let report = match waiter.take() {
            Some(reader) => reader.recv().unwrap_or_else(|e| {
                tracing::warn!(pid = self.pid.as_raw(), error = %e, "unreadable supervisor report");
                None
            }),
            None => None,
        };

        // Wait without reaping so the pid stays ours while `kill` may still
        // be signalling it from another thread
        loop {
            match waitid(Id::Pid(self.pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => break,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(self.fail_wait(e)),
            }
        }

        let mut state = self.state.lock();
        let status = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break InitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break InitStatus::Signaled(signal as i32),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    drop(state);
                    return Err(self.fail_wait(e));
                }
            }
        };
        state.reaped = true;
        drop(state);

        self.control.lock().take();

        tracing::info!(pid = self.pid.as_raw(), ?status, "namespace init process reaped");

        Ok(NamespaceExit { status, report })
    }

    /// Ask the init process to shut the namespace down.
    ///
    /// Every process in the namespace gets SIGTERM, then SIGKILL after the
    /// configured grace period; `wait` returns once they are all reaped.
    pub fn terminate(&self) -> Result<()> {
        self.terminate_with_grace(self.grace)
    }

    pub fn terminate_with_grace(&self, grace: Duration) -> Result<()> {
        self.send_control(&ControlMessage::Terminate { grace })
    }

    /// Start another process inside the running namespace, as a child of
    /// its init process
    pub fn add_proc(&self, workload: CommandSpec) -> Result<()> {
        self.send_control(&ControlMessage::AddProc(workload))
    }

    /// SIGKILL the init process; the kernel then kills the rest of the
    /// namespace. Works without a control channel.
    pub fn kill(&self) -> Result<()> {
        let state = self.state.lock();
        if state.reaped {
            return Err(NsinitError::Wait(Errno::ESRCH));
        }

        tracing::warn!(pid = self.pid.as_raw(), "killing namespace init process");
        kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }

    /// Take back the stack once the init process has been reaped, so it
    /// can be reused for another launch
    pub fn reclaim_stack(&self) -> Result<Stack> {
        let mut state = self.state.lock();
        if !state.reaped {
            return Err(NsinitError::StackInUse);
        }
        state
            .stack
            .take()
            .ok_or(NsinitError::StackReclaimed)
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        if self.is_reaped() {
            return Err(NsinitError::Wait(Errno::ESRCH));
        }

        let mut control = self.control.lock();
        let sender = control
            .as_mut()
            .ok_or_else(|| NsinitError::Control("namespace has no control channel".into()))?;

        tracing::debug!(pid = self.pid.as_raw(), ?msg, "sending control message");
        sender.send(msg)
    }

    fn fail_wait(&self, errno: Errno) -> NsinitError {
        // ECHILD: the status is gone (reaped elsewhere), never touch the pid again
        if errno == Errno::ECHILD {
            self.state.lock().reaped = true;
        }
        NsinitError::Wait(errno)
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.reaped {
            return;
        }

        // The stack must not be released under a live process, and an
        // un-waited child would stay a zombie
        tracing::warn!(
            pid = self.pid.as_raw(),
            "namespace handle dropped before wait, killing init process"
        );
        if kill(self.pid, Signal::SIGKILL).is_ok() {
            loop {
                match waitpid(self.pid, None) {
                    Err(Errno::EINTR) => {}
                    Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
        state.reaped = true;
    }
}
