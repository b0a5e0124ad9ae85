//! Runtime entry points.
//!
//! These are what the mode-switch glue calls with a stopped process. A
//! native stack that does not match its descriptors cannot be recovered
//! from, so any [`StackError`](super::StackError) here is reported and the
//! process aborted.

use std::io::{self, Write};

use super::descriptor::DescriptorTable;
use super::native::{NativeContext, NativeStack};
use super::NativeSupport;

/// Entered when native code returns through the stack trap.
/// Returns the real return address to continue at.
pub fn stack_trap_entry<T: DescriptorTable>(
    support: &NativeSupport<'_, T>,
    stack: &mut NativeStack,
    ctx: &mut NativeContext,
) -> usize {
    support
        .handle_stack_trap(stack, ctx)
        .unwrap_or_else(|err| err.fatal("handle_stack_trap"))
}

/// Entered when native code raises an exception.
/// Returns the handler to continue at; `ctx` and the stack pointer are
/// updated to the handler's frame.
pub fn exception_entry<T: DescriptorTable>(
    support: &NativeSupport<'_, T>,
    stack: &mut NativeStack,
    ctx: &mut NativeContext,
    catches: i32,
) -> usize {
    support
        .find_handler(stack, ctx, catches)
        .unwrap_or_else(|err| err.fatal("find_handler"))
}

/// Print the native stack of a process, decoding live words with `decode`.
pub fn show_nstack<T: DescriptorTable, W: Write>(
    support: &NativeSupport<'_, T>,
    stack: &NativeStack,
    ctx: &NativeContext,
    out: &mut W,
    decode: impl Fn(usize) -> String,
) -> io::Result<()> {
    let dump = support
        .dump_stack(stack, ctx)
        .unwrap_or_else(|err| err.fatal("show_nstack"));
    dump.render(out, decode)
}
