//! Native stack support.
//!
//! Natively compiled code runs on its own per-process stack. This module
//! interprets that stack using the frame descriptors emitted by the code
//! generator:
//! - Walking frames from the innermost outward
//! - Maintaining the stack trap that bounds incremental stack scanning
//! - Locating exception handlers across native frames
//! - Dumping stack contents for introspection
//!
//! None of these operations lock anything. The scheduler guarantees that a
//! process's native stack is only touched by the process itself, or by the
//! runtime while the process is stopped.

pub mod descriptor;
pub mod dump;
pub mod native;
pub mod runtime;
pub mod trap;
pub mod unwind;
pub mod walker;

pub use descriptor::{DescriptorMap, DescriptorTable, FrameDescriptor, LiveBits};
pub use dump::{DumpRow, StackDump};
pub use native::{NativeContext, NativeStack, stack_trap_ra};
pub use walker::{FrameRecord, StackWalker};

use crate::config::NativeConfig;

/// Internal consistency violation on a native stack.
///
/// These never describe a user error. They mean the stack contents and the
/// descriptors disagree, i.e. the stack is corrupt or the code generator
/// broke its contract with the runtime. Runtime entry points treat them as
/// fatal (see [`StackError::fatal`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// A frame walk stepped past the end of the stack
    Overrun { index: usize, end: usize },
    /// No descriptor is registered for a return address found on the stack
    MissingDescriptor { return_address: usize },
    /// The stack trap sentinel was found but no original return address is saved
    StrayTrap,
    /// The unwinder reached the end of the stack without an acceptable handler
    NoHandler,
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackError::Overrun { index, end } => {
                write!(f, "passed end of stack (index {}, end {})", index, end)
            }
            StackError::MissingDescriptor { return_address } => {
                write!(f, "no frame descriptor for return address {:#x}", return_address)
            }
            StackError::StrayTrap => write!(f, "stack trap hit with no saved return address"),
            StackError::NoHandler => write!(f, "no native CATCH found"),
        }
    }
}

impl std::error::Error for StackError {}

impl StackError {
    /// Report the violation and abort the process.
    pub fn fatal(&self, operation: &str) -> ! {
        tracing::error!(operation, error = %self, "native stack consistency violation");
        eprintln!("{}: {}", operation, self);
        std::process::abort()
    }
}

/// Native stack operations over one descriptor table.
///
/// Bundles what every operation needs besides the process state: the
/// descriptor table, the configuration, and the address of the
/// uncaught-exception terminator, whose handler is accepted even when the
/// process has no active catch.
pub struct NativeSupport<'t, T: DescriptorTable> {
    table: &'t T,
    config: &'t NativeConfig,
    fail_handler: usize,
}

impl<'t, T: DescriptorTable> NativeSupport<'t, T> {
    pub fn new(table: &'t T, config: &'t NativeConfig, fail_handler: usize) -> Self {
        Self {
            table,
            config,
            fail_handler,
        }
    }

    pub fn table(&self) -> &'t T {
        self.table
    }

    pub fn config(&self) -> &'t NativeConfig {
        self.config
    }

    pub fn fail_handler(&self) -> usize {
        self.fail_handler
    }

    /// Look up the descriptor for a real (non-sentinel) return address.
    pub(crate) fn lookup(&self, return_address: usize) -> Result<&'t FrameDescriptor, StackError> {
        self.table
            .find(return_address)
            .ok_or(StackError::MissingDescriptor { return_address })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic stacks shared by the unit tests.

    use super::*;

    /// Return address of the mode-switch frame at the stack end.
    pub const MODE_SWITCH_RA: usize = 0x100;
    /// Uncaught-exception terminator.
    pub const FAIL: usize = 0x200;

    /// A frame to place on a synthetic stack.
    pub struct TestFrame {
        pub ra: usize,
        pub descriptor: FrameDescriptor,
    }

    pub fn frame(ra: usize, frame_size: usize, arity: usize) -> TestFrame {
        TestFrame {
            ra,
            descriptor: FrameDescriptor::new(frame_size, arity),
        }
    }

    /// Lay out `frames` (innermost first) on a fresh stack.
    ///
    /// Slot contents are `base + slot` markers except return address slots,
    /// which hold the next frame's return address (the mode switch for the
    /// outermost frame). Returns the stack, a context whose return address
    /// identifies the innermost frame, and the descriptor table.
    pub fn build(frames: Vec<TestFrame>) -> (NativeStack, NativeContext, DescriptorMap) {
        let mut table = DescriptorMap::new().with(
            MODE_SWITCH_RA,
            FrameDescriptor::new(0, 0).with_handler(FAIL),
        );
        let total: usize = frames.iter().map(|f| f.descriptor.size_in_words()).sum();
        let mut words = vec![0usize; total];
        let mut base = 0;
        for (i, f) in frames.iter().enumerate() {
            let d = &f.descriptor;
            for slot in 0..d.size_in_words() {
                words[base + slot] = 0x9000 + base + slot;
            }
            let caller = frames.get(i + 1).map_or(MODE_SWITCH_RA, |next| next.ra);
            words[base + d.frame_size] = caller;
            base += d.size_in_words();
        }
        let ctx = NativeContext::new(frames.first().map_or(MODE_SWITCH_RA, |f| f.ra), 0);
        for f in frames {
            table.insert(f.ra, f.descriptor);
        }
        (NativeStack::from_words(words, 0), ctx, table)
    }
}
