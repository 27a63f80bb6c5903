//! clone(2) wrapper that runs a Rust closure as the entry point of a new process

use super::stack::Stack;
use crate::supervisor::SUPERVISOR_FAULT_EXIT;
use crate::{NsinitError, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

/// Entry point run by the cloned process; its return value is the exit code
pub type CloneEntry<'a> = Box<dyn FnMut() -> i32 + 'a>;

/// C-compatible entry point handed to the kernel.
///
/// `arg` points to the `CloneEntry` owned by `clone_with_stack` in the
/// parent. Without `CLONE_VM` the child runs on a private copy of the
/// parent's memory, so the pointer is valid here and the copy is reclaimed
/// when the child exits.
extern "C" fn trampoline(arg: *mut c_void) -> c_int {
    // SAFETY: see above; the parent's frame is frozen in this address space
    let entry = unsafe { &mut *arg.cast::<CloneEntry<'_>>() };

    panic::catch_unwind(AssertUnwindSafe(entry)).unwrap_or(SUPERVISOR_FAULT_EXIT)
}

/// Wrapper around the clone syscall
///
/// Starts `entry` in a new process running on `stack`, with `flags`
/// selecting the namespaces and `exit_signal` delivered to the parent when
/// the child terminates. Returns the child's pid as seen by the caller.
///
/// # Safety
/// The child starts with a copy of the caller's memory but only the calling
/// thread. If other threads hold locks (allocator, stdio) at the time of the
/// call the child may deadlock on them, exactly as after `fork(2)`.
/// `flags` must not contain `CLONE_VM`.
pub unsafe fn clone_with_stack(
    mut entry: CloneEntry<'_>,
    stack: &mut Stack,
    flags: CloneFlags,
    exit_signal: Option<Signal>,
) -> Result<Pid> {
    if flags.contains(CloneFlags::CLONE_VM) {
        return Err(NsinitError::Config(
            "CLONE_VM would share the parent's address space with the init process".into(),
        ));
    }

    let signal = exit_signal.map_or(0, |s| s as c_int);
    let arg: *mut CloneEntry<'_> = &mut entry;

    // SAFETY: the stack top points into a live buffer owned by the caller,
    // `arg` outlives the call, and the trampoline matches the C signature
    let ret = unsafe {
        libc::clone(
            trampoline,
            stack.top(),
            flags.bits() | signal,
            arg.cast::<c_void>(),
        )
    };

    // The parent's copy of the closure is dropped here; the child owns its own
    drop(entry);

    Errno::result(ret).map(Pid::from_raw).map_err(NsinitError::Launch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::stack::MIN_STACK_SIZE;

    #[test]
    fn refuses_shared_address_space() {
        let mut stack = Stack::new(MIN_STACK_SIZE).unwrap();
        // SAFETY: rejected before any syscall is made
        let result = unsafe {
            clone_with_stack(Box::new(|| 0), &mut stack, CloneFlags::CLONE_VM, None)
        };
        assert!(matches!(result, Err(NsinitError::Config(_))));
    }

    #[test]
    fn invalid_flag_combination_surfaces_errno() {
        // clone(2): CLONE_NEWUSER together with CLONE_FS is always EINVAL
        let mut stack = Stack::new(MIN_STACK_SIZE).unwrap();
        // SAFETY: the kernel rejects the flags, no process is created
        let result = unsafe {
            clone_with_stack(
                Box::new(|| 0),
                &mut stack,
                CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_FS,
                Some(Signal::SIGCHLD),
            )
        };
        match result {
            Err(NsinitError::Launch(errno)) => assert_eq!(errno, Errno::EINVAL),
            other => panic!("expected EINVAL, got {other:?}"),
        }
    }
}
