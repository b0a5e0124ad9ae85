//! Stack trap: the gray/white scan boundary of the native stack.
//!
//! An incremental collector only needs to rescan the part of the native
//! stack that has changed since the last scan. Everything from the gray
//! limit to the stack end is known unchanged, as long as the mutator has not
//! returned into it. To detect that return, the return address slot of a
//! frame a few levels down is overwritten with [`stack_trap_ra`]. Returning
//! through it enters [`NativeSupport::handle_stack_trap`], which moves the
//! boundary a few frames further down and resumes at the real return
//! address. Each move costs at most `skip_frames` frames.

use tracing::trace;

use super::descriptor::{DescriptorTable, FrameDescriptor};
use super::native::{NativeContext, NativeStack, stack_trap_ra};
use super::{NativeSupport, StackError};

impl<T: DescriptorTable> NativeSupport<'_, T> {
    /// Install the stack trap, or move it if one is already installed.
    ///
    /// `start` describes the frame at the current stack pointer. Shallow
    /// stacks, and stacks that end within `skip_frames` frames, get no trap.
    pub fn install_or_advance(
        &self,
        stack: &mut NativeStack,
        ctx: &mut NativeContext,
        start: &FrameDescriptor,
    ) -> Result<(), StackError> {
        remove_trap(stack, ctx);

        let end = stack.end();
        let mut sp = stack.top();
        if end - sp < self.config.min_stack_words {
            disable(ctx);
            return Ok(());
        }

        let mut desc = start;
        let mut remaining = self.config.skip_frames;
        let ra = loop {
            sp += desc.frame_size;
            if sp >= end {
                disable(ctx);
                return Ok(());
            }
            let ra = stack.get(sp)?;
            if remaining <= 1 {
                break ra;
            }
            remaining -= 1;
            sp += 1 + desc.arity;
            desc = self.lookup(ra)?;
        };

        let gray_limit = sp + 1 + desc.arity;
        if gray_limit > end {
            return Err(StackError::Overrun {
                index: gray_limit,
                end,
            });
        }
        stack.set(sp, stack_trap_ra())?;
        ctx.gray_limit = Some(gray_limit);
        ctx.saved_return = Some(ra);
        ctx.trap_slot = Some(sp);
        trace!(slot = sp, gray_limit, return_address = ra, "stack trap installed");
        Ok(())
    }

    /// Called when the mutator returns through the sentinel.
    ///
    /// The trapped frame is now at the stack pointer. Moves the boundary
    /// down and returns the real return address to resume at.
    pub fn handle_stack_trap(
        &self,
        stack: &mut NativeStack,
        ctx: &mut NativeContext,
    ) -> Result<usize, StackError> {
        let ra = ctx.saved_return.ok_or(StackError::StrayTrap)?;
        // The return consumed the sentinel slot.
        ctx.trap_slot = None;
        if ctx.return_address == stack_trap_ra() {
            ctx.return_address = ra;
        }
        let desc = self.lookup(ra)?;
        self.install_or_advance(stack, ctx, desc)?;
        Ok(ra)
    }
}

/// Put back the real return address if the sentinel is still installed.
fn remove_trap(stack: &mut NativeStack, ctx: &mut NativeContext) {
    let Some(ra) = ctx.saved_return else {
        ctx.trap_slot = None;
        return;
    };
    if let Some(slot) = ctx.trap_slot.take() {
        if slot >= stack.top() && stack.get(slot) == Ok(stack_trap_ra()) {
            // In bounds: get() just succeeded.
            let _ = stack.set(slot, ra);
        }
    }
    if ctx.return_address == stack_trap_ra() {
        ctx.return_address = ra;
    }
}

fn disable(ctx: &mut NativeContext) {
    ctx.gray_limit = None;
    ctx.saved_return = None;
    ctx.trap_slot = None;
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FAIL, TestFrame, build, frame};
    use super::*;
    use crate::config::NativeConfig;

    fn config(min_stack_words: usize, skip_frames: usize) -> NativeConfig {
        NativeConfig {
            min_stack_words,
            skip_frames,
            ..Default::default()
        }
    }

    /// Ten frames of three words each: one local, the return address, one
    /// argument.
    fn ten_frames() -> Vec<TestFrame> {
        (0..10).map(|i| frame(0x1000 + i * 0x10, 1, 1)).collect()
    }

    fn sentinels(stack: &NativeStack) -> usize {
        stack
            .live_words()
            .iter()
            .filter(|&&w| w == stack_trap_ra())
            .count()
    }

    #[test]
    fn test_install_skips_frames() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();

        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();

        // Fourth frame has base 9, its return address slot is 10.
        assert_eq!(ctx.trap_slot, Some(10));
        assert_eq!(ctx.gray_limit, Some(12));
        assert_eq!(ctx.saved_return, Some(0x1040));
        assert_eq!(stack.get(10), Ok(stack_trap_ra()));
        assert_eq!(sentinels(&stack), 1);
    }

    #[test]
    fn test_shallow_stack_gets_no_trap() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(31, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();

        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();

        assert!(!ctx.has_trap());
        assert_eq!(sentinels(&stack), 0);
    }

    #[test]
    fn test_stack_ending_early_gets_no_trap() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 11);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();

        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();

        assert!(!ctx.has_trap());
        assert_eq!(ctx.saved_return, None);
        assert_eq!(sentinels(&stack), 0);
    }

    #[test]
    fn test_trigger_moves_boundary_down() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();

        // Return down to the trapped frame: pop the three inner frames and
        // the fourth frame's locals, return address and argument.
        stack.set_top(12);
        let resume = support.handle_stack_trap(&mut stack, &mut ctx).unwrap();

        assert_eq!(resume, 0x1040);
        // Frame at 12 is the fifth; four frames further is the eighth (base 21).
        assert_eq!(ctx.trap_slot, Some(22));
        assert_eq!(ctx.gray_limit, Some(24));
        assert_eq!(ctx.saved_return, Some(0x1080));
        assert_eq!(sentinels(&stack), 1);
    }

    #[test]
    fn test_reinstall_never_leaves_two_sentinels() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();

        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();
        assert_eq!(sentinels(&stack), 1);
        assert_eq!(ctx.trap_slot, Some(10));

        // Reinstalling from deeper restores the old slot.
        stack.set_top(3);
        let second = table.find(0x1010).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, second).unwrap();
        assert_eq!(sentinels(&stack), 1);
        assert_eq!(stack.get(10), Ok(0x1040));
        assert_eq!(ctx.trap_slot, Some(13));
    }

    #[test]
    fn test_trap_disabled_once_depth_below_threshold() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();

        stack.set_top(12);
        support.handle_stack_trap(&mut stack, &mut ctx).unwrap();
        assert!(ctx.has_trap());

        // Return to the ninth frame; only six words remain.
        stack.set_top(24);
        let resume = support.handle_stack_trap(&mut stack, &mut ctx).unwrap();
        assert_eq!(resume, 0x1080);
        assert!(!ctx.has_trap());
        assert_eq!(ctx.trap_slot, None);
        assert_eq!(sentinels(&stack), 0);

        let desc = table.find(0x1080).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, desc).unwrap();
        assert!(!ctx.has_trap());
        assert_eq!(sentinels(&stack), 0);
    }

    #[test]
    fn test_boundary_past_stack_end_is_overrun() {
        let (mut stack, mut ctx, mut table) = build(vec![frame(0x1000, 0, 0), frame(0x2000, 1, 0)]);
        // Five arguments claimed by a frame that has none.
        table.insert(0x2000, FrameDescriptor::new(1, 5));
        let config = config(0, 2);
        let support = NativeSupport::new(&table, &config, FAIL);
        let start = table.find(ctx.return_address).unwrap();

        assert_eq!(
            support.install_or_advance(&mut stack, &mut ctx, start),
            Err(StackError::Overrun { index: 8, end: 3 })
        );
        assert_eq!(sentinels(&stack), 0);
    }

    #[test]
    fn test_stray_trap() {
        let (mut stack, mut ctx, table) = build(ten_frames());
        let config = config(8, 4);
        let support = NativeSupport::new(&table, &config, FAIL);
        assert_eq!(
            support.handle_stack_trap(&mut stack, &mut ctx),
            Err(StackError::StrayTrap)
        );
    }
}
