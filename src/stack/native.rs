//! Native stack storage and per-process execution context.

use super::StackError;

/// Marker whose address is the stack trap sentinel.
static STACK_TRAP_RA: u8 = 0;

/// The reserved return address written over a return address slot to mark
/// the scan boundary.
///
/// Returning through it enters the stack trap handler instead of the caller.
/// It is the address of a private static, so no generated code can ever
/// produce it as a genuine return address.
pub fn stack_trap_ra() -> usize {
    std::ptr::addr_of!(STACK_TRAP_RA) as usize
}

/// A process's native stack.
///
/// Words are indexed by position; the stack grows toward index 0. `top` is
/// the current stack pointer and `end` (the buffer length) the fixed
/// historical end. Every access is bounds-checked and reports
/// [`StackError::Overrun`] instead of touching memory outside the stack.
#[derive(Debug, Clone)]
pub struct NativeStack {
    words: Vec<usize>,
    top: usize,
}

impl NativeStack {
    /// Create an empty stack of `size` words.
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size],
            top: size,
        }
    }

    /// Create a stack from existing contents, with the stack pointer at `top`.
    pub fn from_words(words: Vec<usize>, top: usize) -> Self {
        debug_assert!(top <= words.len(), "stack top beyond stack end");
        Self { words, top }
    }

    /// Index of the current stack pointer.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Move the stack pointer.
    pub fn set_top(&mut self, top: usize) {
        debug_assert!(top <= self.words.len(), "stack top beyond stack end");
        self.top = top;
    }

    /// Index one past the outermost word.
    pub fn end(&self) -> usize {
        self.words.len()
    }

    /// Number of words in use.
    pub fn depth(&self) -> usize {
        self.end() - self.top
    }

    /// Read a word.
    pub fn get(&self, index: usize) -> Result<usize, StackError> {
        self.words.get(index).copied().ok_or(StackError::Overrun {
            index,
            end: self.end(),
        })
    }

    /// Overwrite a word.
    pub fn set(&mut self, index: usize, value: usize) -> Result<(), StackError> {
        let end = self.end();
        let slot = self
            .words
            .get_mut(index)
            .ok_or(StackError::Overrun { index, end })?;
        *slot = value;
        Ok(())
    }

    /// Push a word, growing the stack toward index 0.
    pub fn push(&mut self, value: usize) -> Result<(), StackError> {
        if self.top == 0 {
            return Err(StackError::Overrun {
                index: 0,
                end: self.end(),
            });
        }
        self.top -= 1;
        self.words[self.top] = value;
        Ok(())
    }

    /// Words from the stack pointer to the end.
    pub fn live_words(&self) -> &[usize] {
        &self.words[self.top..]
    }

    /// Machine address of a slot, for diagnostics.
    pub fn address_of(&self, index: usize) -> usize {
        self.words.as_ptr() as usize + index * std::mem::size_of::<usize>()
    }
}

/// Per-process native execution state.
///
/// The fields the runtime glue reads and writes when switching between
/// native code and the runtime. Stack operations take it explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeContext {
    /// Return address of the current native frame
    pub return_address: usize,
    /// Number of actuals of the current call, including register arguments
    pub arity: usize,
    /// Entry point to continue at (set to the handler by the unwinder)
    pub callee: Option<usize>,
    /// Real return address hidden behind the stack trap sentinel
    pub saved_return: Option<usize>,
    /// Scan boundary: everything from here to the end is already validated
    pub gray_limit: Option<usize>,
    /// Stack slot currently holding the sentinel
    pub trap_slot: Option<usize>,
}

impl NativeContext {
    pub fn new(return_address: usize, arity: usize) -> Self {
        Self {
            return_address,
            arity,
            ..Default::default()
        }
    }

    /// Map a return address read from the stack to the real one.
    ///
    /// Returns the address and whether it was read through the sentinel.
    pub fn resolve_return(&self, raw: usize) -> Result<(usize, bool), StackError> {
        if raw == stack_trap_ra() {
            self.saved_return
                .map(|ra| (ra, true))
                .ok_or(StackError::StrayTrap)
        } else {
            Ok((raw, false))
        }
    }

    /// Whether a scan boundary is currently set.
    pub fn has_trap(&self) -> bool {
        self.gray_limit.is_some()
    }
}
