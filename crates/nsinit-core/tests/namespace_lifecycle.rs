//! Integration tests for launching, supervising and reaping namespaces
//!
//! These need a kernel that lets this process create user namespaces. When
//! the host refuses (sysctl, AppArmor, seccomp in CI containers) the tests
//! print a note and return early.

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{Pid, getpid};
use nsinit_core::{
    ChildOutcome, CommandSpec, InitStatus, InitSupervisor, LaunchConfig, NamespaceConfig,
    NamespaceHandle, NamespaceLauncher, NsinitError, SUPERVISOR_FAULT_EXIT, Stack,
};
use nsinit_core::isolation::clone::clone_with_stack;
use nsinit_core::isolation::stack::MIN_STACK_SIZE;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

/// clone(2) runs no fork handlers; keep launches away from each other
static LAUNCH: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    LAUNCH.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn launcher() -> NamespaceLauncher {
    NamespaceLauncher::new(
        LaunchConfig::builder()
            .terminate_grace(Duration::from_secs(1))
            .build(),
    )
}

/// Unwrap a launch, or `None` if the host does not allow namespaces
fn launched(result: nsinit_core::Result<NamespaceHandle>) -> Option<NamespaceHandle> {
    match result {
        Ok(handle) => Some(handle),
        Err(NsinitError::Launch(
            errno @ (Errno::EPERM | Errno::EACCES | Errno::EINVAL | Errno::ENOSPC | Errno::EUSERS),
        )) => {
            println!("skipping: namespaces unavailable on this host ({errno})");
            None
        }
        Err(e) => panic!("unexpected launch error: {e}"),
    }
}

#[test]
fn entry_runs_as_pid_one() {
    let _guard = serial();
    let Some(handle) = launched(launcher().launch(|| i32::from(getpid() != Pid::from_raw(1))))
    else {
        return;
    };

    assert!(handle.pid().as_raw() > 0);
    assert_ne!(handle.pid(), getpid());

    let exit = handle.wait().unwrap();
    assert_eq!(exit.status, InitStatus::Exited(0));
    assert!(exit.report.is_none());
}

#[test]
fn blocking_supervisor_sums_child_exit_codes() {
    let _guard = serial();
    let entry = || {
        InitSupervisor::new(None, None).run(|| {
            for code in 0..4 {
                Command::new("/bin/sh")
                    .arg("-c")
                    .arg(format!("exit {code}"))
                    .spawn()?;
            }
            Ok(())
        })
    };
    let Some(handle) = launched(launcher().launch(entry)) else {
        return;
    };

    let exit = handle.wait().unwrap();
    assert_eq!(exit.code(), Some(1 + 2 + 3));
}

#[test]
fn orphaned_children_are_reaped_and_summed() {
    let _guard = serial();
    // The shell exits at once; its background jobs are re-parented to pid 1
    let script = "for i in 0 1 2 3 4; do (sleep 0.2; exit $i) & done; exit 0";
    let Some(handle) = launched(launcher().spawn(CommandSpec::shell(script))) else {
        return;
    };

    let exit = handle.wait().unwrap();
    assert_eq!(exit.code(), Some(10));

    let report = exit.report.expect("supervised namespace sends a report");
    assert!(!report.is_fault());
    assert_eq!(report.exit_code, 10);
    for code in 0..5 {
        assert!(
            report
                .children
                .iter()
                .any(|c| c.outcome == ChildOutcome::Exited(code)),
            "no child exited with {code}"
        );
    }
}

#[test]
fn grandchild_outliving_its_parent_is_reaped() {
    let _guard = serial();
    let script = "sh -c '(sleep 0.3; exit 7) & exit 0'; exit 0";
    let Some(handle) = launched(launcher().spawn(CommandSpec::shell(script))) else {
        return;
    };

    let exit = handle.wait().unwrap();
    assert_eq!(exit.code(), Some(7));
}

#[test]
fn second_wait_is_no_such_process() {
    let _guard = serial();
    let Some(handle) = launched(launcher().launch(|| 0)) else {
        return;
    };

    handle.wait().unwrap();
    assert!(handle.is_reaped());

    let err = handle.wait().unwrap_err();
    assert!(err.is_no_such_process(), "got {err}");
    assert!(handle.kill().unwrap_err().is_no_such_process());
}

#[test]
fn refused_launch_creates_no_child() {
    let _guard = serial();
    let report = nsinit_core::preflight::inspect_host();
    if report.root || report.cap_sys_admin {
        println!("skipping: privileged process can create a pid namespace");
        return;
    }

    // A pid namespace without a user namespace needs CAP_SYS_ADMIN
    let launcher = NamespaceLauncher::new(
        LaunchConfig::builder()
            .namespaces(NamespaceConfig {
                user: false,
                ..NamespaceConfig::default()
            })
            .build(),
    );

    match launcher.launch(|| 0) {
        Err(NsinitError::Launch(errno)) => assert_eq!(errno, Errno::EPERM),
        other => panic!("expected EPERM, got {other:?}"),
    }
    assert_eq!(
        waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn rejected_clone_leaves_no_child() {
    let _guard = serial();
    let mut stack = Stack::new(MIN_STACK_SIZE).unwrap();

    // clone(2) refuses CLONE_NEWUSER with CLONE_FS for every caller
    // SAFETY: the kernel rejects the flags before creating a process
    let result = unsafe {
        clone_with_stack(
            Box::new(|| 0),
            &mut stack,
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_FS,
            Some(Signal::SIGCHLD),
        )
    };

    assert!(matches!(result, Err(NsinitError::Launch(Errno::EINVAL))));
    assert_eq!(
        waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn stack_is_reclaimable_only_after_wait() {
    let _guard = serial();
    let launcher = launcher();
    let Some(handle) = launched(launcher.launch(|| {
        std::thread::sleep(Duration::from_millis(100));
        3
    })) else {
        return;
    };

    assert!(matches!(handle.reclaim_stack(), Err(NsinitError::StackInUse)));
    assert_eq!(handle.wait().unwrap().code(), Some(3));

    let stack = handle.reclaim_stack().unwrap();
    assert!(matches!(handle.reclaim_stack(), Err(NsinitError::StackReclaimed)));

    let again = launcher.launch_on(stack, || 4).unwrap();
    assert_eq!(again.wait().unwrap().code(), Some(4));
}

#[test]
fn live_handles_have_distinct_pids() {
    let _guard = serial();
    let launcher = launcher();
    let nap = || {
        std::thread::sleep(Duration::from_millis(200));
        0
    };
    let Some(first) = launched(launcher.launch(nap)) else {
        return;
    };
    let second = launcher.launch(nap).unwrap();

    assert_ne!(first.pid(), second.pid());
    assert!(first.wait().unwrap().is_success());
    assert!(second.wait().unwrap().is_success());
}

#[test]
fn terminate_signals_the_namespace() {
    let _guard = serial();
    let Some(handle) = launched(launcher().spawn(CommandSpec::shell("sleep 30"))) else {
        return;
    };

    handle.terminate().unwrap();
    let exit = handle.wait().unwrap();

    assert_eq!(exit.code(), Some(0));
    let report = exit.report.unwrap();
    assert!(report.terminated);
    assert!(
        report
            .children
            .iter()
            .all(|c| matches!(c.outcome, ChildOutcome::Signaled(_)))
    );
    assert!(handle.terminate().unwrap_err().is_no_such_process());
}

#[test]
fn add_proc_joins_a_running_namespace() {
    let _guard = serial();
    let Some(handle) = launched(launcher().spawn(CommandSpec::shell("sleep 0.5; exit 1"))) else {
        return;
    };

    handle.add_proc(CommandSpec::shell("exit 2")).unwrap();
    let exit = handle.wait().unwrap();

    assert_eq!(exit.code(), Some(3));
    assert_eq!(exit.report.unwrap().children.len(), 2);
}

#[test]
fn failed_workload_is_a_supervisor_fault() {
    let _guard = serial();
    let workload = CommandSpec::new("/nonexistent/nsinit-workload");
    let Some(handle) = launched(launcher().spawn(workload)) else {
        return;
    };

    let exit = handle.wait().unwrap();
    assert_eq!(exit.code(), Some(SUPERVISOR_FAULT_EXIT));
    assert!(exit.is_supervisor_fault());
}

#[test]
fn raw_launch_has_no_control_channel() {
    let _guard = serial();
    let Some(handle) = launched(launcher().launch(|| {
        std::thread::sleep(Duration::from_secs(30));
        0
    })) else {
        return;
    };

    assert!(!handle.has_control());
    assert!(matches!(handle.terminate(), Err(NsinitError::Control(_))));
    assert!(matches!(
        handle.add_proc(CommandSpec::shell("true")),
        Err(NsinitError::Control(_))
    ));

    handle.kill().unwrap();
    assert_eq!(handle.wait().unwrap().status, InitStatus::Signaled(9));
}

#[test]
fn dropped_handle_leaves_no_zombie() {
    let _guard = serial();
    let Some(handle) = launched(launcher().launch(|| {
        std::thread::sleep(Duration::from_secs(30));
        0
    })) else {
        return;
    };

    let pid = handle.pid();
    drop(handle);

    assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
}
