//! Exception handler search across native frames.

use tracing::debug;

use super::descriptor::DescriptorTable;
use super::native::{NativeContext, NativeStack};
use super::walker::FrameCursor;
use super::{NativeSupport, StackError};

impl<T: DescriptorTable> NativeSupport<'_, T> {
    /// Find the handler for an exception raised by the current native call.
    ///
    /// The stack must look as it does on entry to a function: the current
    /// call's stack arguments at the stack pointer, then the caller's frame.
    /// `ctx.return_address` and `ctx.arity` describe the current call.
    ///
    /// A handler is accepted if the process has an active catch
    /// (`catches >= 0`) or if it is the uncaught-exception terminator. On
    /// success the stack pointer is cut back to the handler's frame,
    /// `ctx.callee` is set to the handler and the handler address is
    /// returned. Every native call chain ends in the mode-switch frame,
    /// whose handler is the terminator, so running out of frames is an
    /// internal error.
    pub fn find_handler(
        &self,
        stack: &mut NativeStack,
        ctx: &mut NativeContext,
        catches: i32,
    ) -> Result<usize, StackError> {
        let end = stack.end();
        let mut cursor = FrameCursor::start(stack, ctx, self.config)?;

        loop {
            if cursor.sp > end {
                return Err(StackError::Overrun {
                    index: cursor.sp,
                    end,
                });
            }
            let desc = self.lookup(cursor.ra)?;
            let accepted = desc
                .exception_handler
                .filter(|&handler| catches >= 0 || handler == self.fail_handler);
            if let Some(handler) = accepted {
                ctx.callee = Some(handler);
                ctx.arity = 0;
                stack.set_top(cursor.sp);
                debug!(handler, sp = cursor.sp, catches, "native exception handler found");
                // Never leave the boundary pointing past the new stack pointer.
                if ctx.gray_limit.is_some_and(|limit| cursor.sp >= limit) {
                    self.install_or_advance(stack, ctx, desc)?;
                }
                return Ok(handler);
            }
            // The mode-switch frame at the stack end has no caller.
            if cursor.sp == end {
                break;
            }
            cursor.advance(stack, ctx, desc)?;
        }
        Err(StackError::NoHandler)
    }
}
