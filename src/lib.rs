//! moca-native - runtime support for natively compiled code
//!
//! This library provides the pieces of the runtime that deal with native
//! frames and native code: walking native stacks, the incremental-scan stack
//! trap, exception handler search, and link-time instruction patching.

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod scenario;
pub mod stack;

// Re-export commonly used types
pub use config::NativeConfig;
pub use stack::{
    DescriptorMap, DescriptorTable, FrameDescriptor, NativeContext, NativeStack, NativeSupport,
    StackError,
};
