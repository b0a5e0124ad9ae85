//! Link-time patching of emitted machine code.
//!
//! Every change to code goes through a [`PatchSet`]. A patch set holds the
//! process-wide patch lock for its whole lifetime and only stages words;
//! nothing is written until [`PatchSet::commit`], which stores each staged
//! word and flushes it from the instruction cache. Dropping a patch set
//! without committing leaves the code untouched, so a failed patch never
//! leaves a half-rewritten instruction sequence behind.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use super::memory::MemoryError;

/// Serializes all code patching in the process.
static PATCH_LOCK: Mutex<()> = Mutex::new(());

/// Size of one instruction word in bytes.
pub const INSN_BYTES: usize = 4;

/// What a patch site refers to, as named by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Address of a function entry (module, function, arity)
    LoadMfa,
    /// Atom table index
    Atom,
    /// Boxed literal constant
    Constant,
    /// Closure entry
    Closure,
    /// Raw constant from the runtime
    CConst,
    /// Entry point loaded by a fun's code, rebound when its module reloads
    FunEntry,
    /// Call to a function in the same module
    CallLocal,
    /// Call to a function in another module
    CallRemote,
}

impl PatchKind {
    /// Whether this kind is bound by rewriting an immediate operand.
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            PatchKind::LoadMfa
                | PatchKind::Atom
                | PatchKind::Constant
                | PatchKind::Closure
                | PatchKind::CConst
                | PatchKind::FunEntry
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PatchKind::LoadMfa => "load_mfa",
            PatchKind::Atom => "atom",
            PatchKind::Constant => "constant",
            PatchKind::Closure => "closure",
            PatchKind::CConst => "c_const",
            PatchKind::FunEntry => "fun_entry",
            PatchKind::CallLocal => "call_local",
            PatchKind::CallRemote => "call_remote",
        }
    }
}

impl FromStr for PatchKind {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load_mfa" => Ok(PatchKind::LoadMfa),
            "atom" => Ok(PatchKind::Atom),
            "constant" => Ok(PatchKind::Constant),
            "closure" => Ok(PatchKind::Closure),
            "c_const" => Ok(PatchKind::CConst),
            "fun_entry" => Ok(PatchKind::FunEntry),
            "call_local" => Ok(PatchKind::CallLocal),
            "call_remote" => Ok(PatchKind::CallRemote),
            other => Err(PatchError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error type for patching. Memory is never modified when one is returned.
#[derive(Debug)]
pub enum PatchError {
    /// The kind is known but cannot be patched as an immediate
    UnsupportedKind(PatchKind),
    /// The loader asked for a kind this runtime does not know
    UnknownKind(String),
    /// A trampoline was requested on an architecture without them
    TrampolineUnsupported,
    /// The call target is out of branch range and no trampoline was given
    CallOutOfRange { call_site: usize, destination: usize },
    /// The value does not fit the immediate field(s)
    ImmediateOutOfRange { value: u64, bits: u32 },
    /// The address is not instruction aligned
    Misaligned(usize),
    /// The address is outside the code space being patched
    OutOfBounds(usize),
    /// The instruction at the patch site is not the expected one
    UnexpectedInstruction { address: usize, word: u32 },
    /// Code memory could not be allocated or protected
    Memory(MemoryError),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::UnsupportedKind(kind) => write!(f, "cannot patch {} as an immediate", kind),
            PatchError::UnknownKind(name) => write!(f, "unknown patch kind: {}", name),
            PatchError::TrampolineUnsupported => {
                write!(f, "trampolines are not supported on this architecture")
            }
            PatchError::CallOutOfRange {
                call_site,
                destination,
            } => write!(
                f,
                "call from {:#x} to {:#x} is out of branch range",
                call_site, destination
            ),
            PatchError::ImmediateOutOfRange { value, bits } => {
                write!(f, "value {:#x} does not fit in {} bits", value, bits)
            }
            PatchError::Misaligned(address) => write!(f, "misaligned patch address {:#x}", address),
            PatchError::OutOfBounds(address) => {
                write!(f, "patch address {:#x} outside code space", address)
            }
            PatchError::UnexpectedInstruction { address, word } => {
                write!(f, "unexpected instruction {:#010x} at {:#x}", word, address)
            }
            PatchError::Memory(err) => write!(f, "code memory: {}", err),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<MemoryError> for PatchError {
    fn from(err: MemoryError) -> Self {
        PatchError::Memory(err)
    }
}

/// Per-architecture patching capabilities.
///
/// Implemented by a zero-sized marker type per target. Generic code is
/// monomorphized for one architecture, so there is no runtime dispatch.
pub trait Arch: Sized {
    const NAME: &'static str;
    /// Number of words in an interpreter-to-native stub.
    const STUB_WORDS: usize;

    /// Make a rewritten instruction word visible to instruction fetch.
    fn flush_icache_word(address: *const u32);

    /// Rewrite the instruction(s) at `address` to load `value`.
    fn patch_immediate(
        patch: &mut PatchSet<'_, '_, Self>,
        address: usize,
        value: u64,
        kind: PatchKind,
    ) -> Result<(), PatchError>;

    /// Rewrite the call at `call_site` to go to `destination`.
    fn patch_call(
        patch: &mut PatchSet<'_, '_, Self>,
        call_site: usize,
        destination: usize,
        trampoline: Option<usize>,
    ) -> Result<(), PatchError>;

    /// Encode a stub placed at `stub_address` that enters the interpreter at
    /// `entry_point` with `arity` arguments via `call_emulator`.
    fn encode_native_stub(
        stub_address: usize,
        entry_point: usize,
        arity: u32,
        call_emulator: usize,
    ) -> Result<Vec<u32>, PatchError>;
}

/// Flush every instruction word in `[address, address + bytes)`.
pub fn flush_icache_range<A: Arch>(address: *const u32, bytes: usize) {
    let words = bytes.div_ceil(INSN_BYTES);
    for i in 0..words {
        A::flush_icache_word(address.wrapping_add(i));
    }
}

/// A region of instruction words that may be patched.
pub struct CodeSpace<'a> {
    words: &'a mut [u32],
}

impl<'a> CodeSpace<'a> {
    pub fn new(words: &'a mut [u32]) -> Self {
        Self { words }
    }

    /// Address of the first word.
    pub fn base(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Address of word `index`.
    pub fn address_of(&self, index: usize) -> usize {
        self.base() + index * INSN_BYTES
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Whether `address` is a word inside this space.
    pub fn contains(&self, address: usize) -> bool {
        self.index_of(address).is_ok()
    }

    /// Read the word at `address`.
    pub fn word_at(&self, address: usize) -> Result<u32, PatchError> {
        Ok(self.words[self.index_of(address)?])
    }

    fn index_of(&self, address: usize) -> Result<usize, PatchError> {
        if address % INSN_BYTES != 0 {
            return Err(PatchError::Misaligned(address));
        }
        let offset = address
            .checked_sub(self.base())
            .ok_or(PatchError::OutOfBounds(address))?;
        let index = offset / INSN_BYTES;
        if index >= self.words.len() {
            return Err(PatchError::OutOfBounds(address));
        }
        Ok(index)
    }
}

/// Staged changes to a code space, applied by [`PatchSet::commit`].
///
/// The patch lock is not reentrant. While a patch set is alive, the same
/// thread must not begin another one (through [`patch_immediate`],
/// [`patch_call`] or stub creation) or it deadlocks. Stage every site of a
/// link step on one patch set with [`PatchSet::immediate`] and
/// [`PatchSet::call`] instead.
#[must_use = "a patch set does nothing until committed"]
pub struct PatchSet<'s, 'a, A: Arch> {
    space: &'s mut CodeSpace<'a>,
    staged: Vec<(usize, u32)>,
    _lock: MutexGuard<'static, ()>,
    _arch: PhantomData<A>,
}

impl<'s, 'a, A: Arch> PatchSet<'s, 'a, A> {
    /// Start patching `space`, waiting for any other patcher to finish.
    /// Blocks forever if this thread already holds a patch set.
    pub fn begin(space: &'s mut CodeSpace<'a>) -> Self {
        // The guarded data is (), so a poisoned lock carries no broken state.
        let lock = PATCH_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        Self {
            space,
            staged: Vec::new(),
            _lock: lock,
            _arch: PhantomData,
        }
    }

    pub fn space(&self) -> &CodeSpace<'a> {
        self.space
    }

    /// Read a word as it will be after commit.
    pub fn read(&self, address: usize) -> Result<u32, PatchError> {
        let index = self.space.index_of(address)?;
        let staged = self.staged.iter().rev().find(|(i, _)| *i == index);
        Ok(staged.map_or(self.space.words[index], |(_, word)| *word))
    }

    /// Stage a new value for the word at `address`.
    pub fn stage(&mut self, address: usize, word: u32) -> Result<(), PatchError> {
        let index = self.space.index_of(address)?;
        self.staged.push((index, word));
        Ok(())
    }

    /// Stage an immediate binding. On error nothing from this site stays
    /// staged.
    pub fn immediate(
        &mut self,
        address: usize,
        value: u64,
        kind: PatchKind,
    ) -> Result<(), PatchError> {
        if !kind.is_immediate() {
            return Err(PatchError::UnsupportedKind(kind));
        }
        let mark = self.staged.len();
        let result = A::patch_immediate(self, address, value, kind);
        if result.is_err() {
            self.staged.truncate(mark);
        }
        result
    }

    /// Stage a call binding. On error nothing from this site stays staged.
    pub fn call(
        &mut self,
        call_site: usize,
        destination: usize,
        trampoline: Option<usize>,
    ) -> Result<(), PatchError> {
        let mark = self.staged.len();
        let result = A::patch_call(self, call_site, destination, trampoline);
        if result.is_err() {
            self.staged.truncate(mark);
        }
        result
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Write all staged words and flush them from the instruction cache.
    /// Returns the number of words written.
    pub fn commit(self) -> usize {
        let count = self.staged.len();
        for &(index, word) in &self.staged {
            self.space.words[index] = word;
            A::flush_icache_word(&self.space.words[index]);
        }
        trace!(arch = A::NAME, words = count, "patch committed");
        count
    }
}

/// Bind an immediate operand. Commit the result to apply it.
pub fn patch_immediate<'s, 'a, A: Arch>(
    space: &'s mut CodeSpace<'a>,
    address: usize,
    value: u64,
    kind: PatchKind,
) -> Result<PatchSet<'s, 'a, A>, PatchError> {
    if !kind.is_immediate() {
        return Err(PatchError::UnsupportedKind(kind));
    }
    let mut patch = PatchSet::begin(space);
    patch.immediate(address, value, kind)?;
    Ok(patch)
}

/// Bind a call site. Commit the result to apply it.
pub fn patch_call<'s, 'a, A: Arch>(
    space: &'s mut CodeSpace<'a>,
    call_site: usize,
    destination: usize,
    trampoline: Option<usize>,
) -> Result<PatchSet<'s, 'a, A>, PatchError> {
    let mut patch = PatchSet::begin(space);
    patch.call(call_site, destination, trampoline)?;
    Ok(patch)
}
