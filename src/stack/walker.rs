//! Native stack walking.
//!
//! A frame whose descriptor `d` is at base `b` looks like this (lower
//! addresses first):
//!
//! ```text
//! b                      locals[0 .. d.frame_size]
//! b + d.frame_size       return address into the caller
//! b + d.frame_size + 1   incoming stack arguments[0 .. d.arity]
//! ```
//!
//! The caller's frame starts right after the arguments, and its descriptor
//! is the one registered for the return address just read. Walking is
//! complete when the next base is exactly the stack end.

use super::descriptor::{DescriptorTable, FrameDescriptor};
use super::native::{NativeContext, NativeStack};
use super::{NativeSupport, StackError};
use crate::config::NativeConfig;

/// One frame found by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord<'t> {
    /// Stack index of the frame's lowest slot
    pub base: usize,
    /// Descriptor of the frame
    pub descriptor: &'t FrameDescriptor,
    /// Real return address that identified the frame
    pub return_address: usize,
    /// Whether that return address was hidden behind the stack trap
    pub trapped: bool,
}

impl FrameRecord<'_> {
    /// Stack index of the slot holding the return address into the caller.
    pub fn return_slot(&self) -> usize {
        self.base + self.descriptor.frame_size
    }

    /// Base of the caller's frame.
    pub fn next_base(&self) -> usize {
        self.base + self.descriptor.size_in_words()
    }

    /// Stack indices of the frame's reference slots.
    pub fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.descriptor
            .live_bits
            .live_slots(self.descriptor.size_in_words())
            .map(move |slot| self.base + slot)
    }
}

/// Position of a walk: a frame base and the return address identifying it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameCursor {
    pub sp: usize,
    pub ra: usize,
    pub trapped: bool,
}

impl FrameCursor {
    /// Start at the innermost frame, past the current call's stack arguments.
    pub(crate) fn start(
        stack: &NativeStack,
        ctx: &NativeContext,
        config: &NativeConfig,
    ) -> Result<Self, StackError> {
        let (ra, trapped) = ctx.resolve_return(ctx.return_address)?;
        Ok(Self {
            sp: stack.top() + config.stack_arity(ctx.arity),
            ra,
            trapped,
        })
    }

    /// Step over the frame described by `desc` to its caller.
    pub(crate) fn advance(
        &mut self,
        stack: &NativeStack,
        ctx: &NativeContext,
        desc: &FrameDescriptor,
    ) -> Result<(), StackError> {
        let slot = self.sp + desc.frame_size;
        let (ra, trapped) = ctx.resolve_return(stack.get(slot)?)?;
        self.sp = slot + 1 + desc.arity;
        self.ra = ra;
        self.trapped = trapped;
        Ok(())
    }
}

/// Iterator over the frames of a native stack, innermost first.
///
/// Yields an error at most once, after which it is exhausted.
pub struct StackWalker<'a, T: DescriptorTable> {
    stack: &'a NativeStack,
    ctx: &'a NativeContext,
    table: &'a T,
    cursor: Result<FrameCursor, StackError>,
    done: bool,
}

impl<'a, T: DescriptorTable> StackWalker<'a, T> {
    pub fn new(
        stack: &'a NativeStack,
        ctx: &'a NativeContext,
        table: &'a T,
        config: &NativeConfig,
    ) -> Self {
        Self {
            stack,
            ctx,
            table,
            cursor: FrameCursor::start(stack, ctx, config),
            done: false,
        }
    }

    fn fail(&mut self, err: StackError) -> Option<Result<FrameRecord<'a>, StackError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a, T: DescriptorTable> Iterator for StackWalker<'a, T> {
    type Item = Result<FrameRecord<'a>, StackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let cursor = match &mut self.cursor {
            Ok(cursor) => cursor,
            Err(err) => {
                let err = err.clone();
                return self.fail(err);
            }
        };

        let end = self.stack.end();
        if cursor.sp == end {
            self.done = true;
            return None;
        }
        if cursor.sp > end {
            let err = StackError::Overrun {
                index: cursor.sp,
                end,
            };
            return self.fail(err);
        }

        let Some(descriptor) = self.table.find(cursor.ra) else {
            let err = StackError::MissingDescriptor {
                return_address: cursor.ra,
            };
            return self.fail(err);
        };
        let record = FrameRecord {
            base: cursor.sp,
            descriptor,
            return_address: cursor.ra,
            trapped: cursor.trapped,
        };

        if let Err(err) = cursor.advance(self.stack, self.ctx, descriptor) {
            return self.fail(err);
        }
        Some(Ok(record))
    }
}

impl<T: DescriptorTable> NativeSupport<'_, T> {
    /// Walk the stack from the innermost frame.
    pub fn walk<'a>(&'a self, stack: &'a NativeStack, ctx: &'a NativeContext) -> StackWalker<'a, T> {
        StackWalker::new(stack, ctx, self.table, self.config)
    }

    /// Collect every frame, failing on the first inconsistency.
    pub fn frames<'a>(
        &'a self,
        stack: &'a NativeStack,
        ctx: &'a NativeContext,
    ) -> Result<Vec<FrameRecord<'a>>, StackError> {
        self.walk(stack, ctx).collect()
    }

    /// Stack indices of every reference the collector must trace: the
    /// current call's stack arguments plus each frame's live slots.
    pub fn live_roots(&self, stack: &NativeStack, ctx: &NativeContext) -> Result<Vec<usize>, StackError> {
        let args = self.config.stack_arity(ctx.arity);
        let mut roots: Vec<usize> = (stack.top()..stack.top() + args).collect();
        for record in self.walk(stack, ctx) {
            roots.extend(record?.live_slots());
        }
        Ok(roots)
    }
}
