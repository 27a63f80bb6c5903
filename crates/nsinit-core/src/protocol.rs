//! Messages exchanged between a namespace handle and its init process
//!
//! Both directions use msgpack bodies framed by `pipe`.

use crate::workload::CommandSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requests sent from the parent to the running init process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Signal every process in the namespace, escalating to SIGKILL
    /// once `grace` has elapsed
    Terminate { grace: Duration },
    /// Start another workload as a child of the init process
    AddProc(CommandSpec),
}

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildOutcome {
    /// Normal exit with the given code
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

/// One reaped process, with its pid inside the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExit {
    pub pid: i32,
    pub outcome: ChildOutcome,
}

/// Summary the init process sends back right before it exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorReport {
    /// Every reaped descendant, in the order the kernel reported them
    pub children: Vec<ChildExit>,
    /// Exit code the init process is about to exit with
    pub exit_code: i32,
    /// Whether a terminate request was received
    pub terminated: bool,
    /// Workloads that could not be started
    pub spawn_failures: Vec<String>,
    /// Internal supervisor failure, if that is why the init process exits
    pub fault: Option<String>,
}

impl SupervisorReport {
    /// Whether the exit code comes from a supervisor failure rather than
    /// from the workload
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

/// Encode a message to msgpack, with field names so tagged enums decode
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_proc_carries_the_workload() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let bytes = encode(&ControlMessage::AddProc(spec.clone())).unwrap();

        match decode::<ControlMessage>(&bytes).unwrap() {
            ControlMessage::AddProc(decoded) => assert_eq!(decoded, spec),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn report_without_fault_is_not_a_fault() {
        let report = SupervisorReport {
            exit_code: 3,
            ..SupervisorReport::default()
        };
        assert!(!report.is_fault());
    }
}
