//! Execution stack handed to a cloned process

use crate::{NsinitError, Result};
use std::ffi::c_void;
use std::pin::Pin;

/// Default stack size for the init process (1 MiB)
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack accepted; the supervisor and `std::process::Command`
/// need a few pages before the workload execs onto its own stack
pub const MIN_STACK_SIZE: usize = 64 * 1024;

const STACK_ALIGN: usize = 16;

/// Fixed-size, heap-allocated stack region.
///
/// The buffer is pinned: it is never resized or moved for as long as the
/// `Stack` exists, so the address handed to `clone(2)` stays valid.
#[derive(Debug)]
pub struct Stack {
    buf: Pin<Box<[u8]>>,
}

impl Stack {
    /// Allocate a zeroed stack of `size` bytes
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(NsinitError::Config(format!(
                "stack size {size} is below the minimum of {MIN_STACK_SIZE} bytes"
            )));
        }

        Ok(Self {
            buf: Box::into_pin(vec![0u8; size].into_boxed_slice()),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Address the new process starts from.
    ///
    /// Stacks grow downward, so this is the high end of the buffer rounded
    /// down to the ABI alignment.
    pub fn top(&mut self) -> *mut c_void {
        let base = self.buf.as_mut_ptr();
        let end = base as usize + self.buf.len();
        let aligned = end & !(STACK_ALIGN - 1);
        // SAFETY: `aligned` lies within [base, base + len], so the offset
        // stays inside (or one past the end of) the allocation
        unsafe { base.add(aligned - base as usize).cast() }
    }
}
