//! Native code support: patching emitted code at link time.
//!
//! This module provides:
//! - Executable memory allocation
//! - Word-based code buffers
//! - SPARC and AArch64 instruction encoding and patching
//! - Interpreter-entry stubs
//!
//! Each architecture is a zero-sized type implementing [`Arch`]. The
//! architecture of the running host is [`HostArch`] where one is supported;
//! the others stay available for cross-tooling and tests.
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod aarch64;
pub mod codebuf;
pub mod memory;
pub mod patch;
pub mod sparc;
pub mod stub;

pub use codebuf::CodeBuffer;
pub use memory::{ExecutableMemory, MemoryError, Protection};
pub use patch::{
    Arch, CodeSpace, PatchError, PatchKind, PatchSet, flush_icache_range, patch_call,
    patch_immediate,
};
pub use stub::{StubArena, make_native_stub};

/// The architecture this process runs on.
#[cfg(target_arch = "aarch64")]
pub type HostArch = aarch64::AArch64;

/// The architecture this process runs on.
#[cfg(target_arch = "sparc64")]
pub type HostArch = sparc::Sparc;
