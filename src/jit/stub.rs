//! Interpreter-to-native stubs.
//!
//! A stub is what native code calls when the callee is still interpreted:
//! it loads the callee's entry point, saves the return address and enters
//! the shared `call_emulator` routine with the arity in a fixed register.
//! Stubs are carved out of executable chunks that live as long as the arena.

use tracing::debug;

use super::memory::{ExecutableMemory, MemoryError, Protection};
use super::patch::{Arch, CodeSpace, INSN_BYTES, PatchError, PatchSet};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

/// Bump allocator for stub code.
pub struct StubArena {
    chunks: Vec<ExecutableMemory>,
    /// Words used in the last chunk
    used: usize,
    chunk_bytes: usize,
    call_emulator: usize,
}

impl StubArena {
    /// Create an arena whose stubs enter the interpreter through `call_emulator`.
    pub fn new(call_emulator: usize) -> Self {
        Self::with_chunk_size(call_emulator, DEFAULT_CHUNK_BYTES)
    }

    pub fn with_chunk_size(call_emulator: usize, chunk_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            used: 0,
            chunk_bytes,
            call_emulator,
        }
    }

    pub fn call_emulator(&self) -> usize {
        self.call_emulator
    }

    /// Number of chunks allocated so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Make sure the last chunk has room for `words` more words.
    fn reserve(&mut self, words: usize) -> Result<(), MemoryError> {
        let fits = self
            .chunks
            .last()
            .is_some_and(|chunk| self.used + words <= chunk.size() / INSN_BYTES);
        if !fits {
            let bytes = self.chunk_bytes.max(words * INSN_BYTES);
            // Stubs are added while neighbouring stubs may be running.
            let chunk = ExecutableMemory::new(bytes, Protection::ReadWriteExecute)?;
            self.chunks.push(chunk);
            self.used = 0;
        }
        Ok(())
    }

    /// Emit a stub entering `entry_point` with `arity` arguments and
    /// return its address. On error no arena space is consumed.
    pub fn make_native_stub<A: Arch>(
        &mut self,
        entry_point: usize,
        arity: u32,
    ) -> Result<usize, PatchError> {
        self.reserve(A::STUB_WORDS)?;
        let used = self.used;
        let chunk = self
            .chunks
            .last_mut()
            .ok_or(MemoryError::AllocationFailed)?;
        let stub_address = chunk.as_ptr() as usize + used * INSN_BYTES;
        let code = A::encode_native_stub(stub_address, entry_point, arity, self.call_emulator)?;

        let words = chunk.words_mut()?;
        let mut space = CodeSpace::new(&mut words[used..used + code.len()]);
        let mut patch = PatchSet::<A>::begin(&mut space);
        for (i, &word) in code.iter().enumerate() {
            patch.stage(stub_address + i * INSN_BYTES, word)?;
        }
        patch.commit();

        self.used += code.len();
        debug!(
            arch = A::NAME,
            stub = format_args!("{:#x}", stub_address),
            entry = format_args!("{:#x}", entry_point),
            arity,
            "native stub created"
        );
        Ok(stub_address)
    }
}

/// Emit an interpreter-entry stub for `entry_point` in `arena`.
pub fn make_native_stub<A: Arch>(
    arena: &mut StubArena,
    entry_point: usize,
    arity: u32,
) -> Result<usize, PatchError> {
    arena.make_native_stub::<A>(entry_point, arity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::aarch64::{AArch64, move_wide_value};
    use crate::jit::sparc::Sparc;

    fn read_words(address: usize, count: usize) -> Vec<u32> {
        // SAFETY: tests only read stubs owned by a live arena.
        unsafe { std::slice::from_raw_parts(address as *const u32, count).to_vec() }
    }

    #[test]
    fn test_stubs_are_packed() {
        let mut arena = StubArena::new(0x4000_0000);
        let first = make_native_stub::<AArch64>(&mut arena, 0x1234, 2).unwrap();
        let second = make_native_stub::<AArch64>(&mut arena, 0x5678, 3).unwrap();

        assert_eq!(second, first + AArch64::STUB_WORDS * INSN_BYTES);
        assert_eq!(arena.chunk_count(), 1);

        let code = read_words(second, AArch64::STUB_WORDS);
        assert_eq!(move_wide_value(&code[..4]), Some(0x5678));
        assert_eq!(&code[8..], &[0x4000_0000, 0]);
    }

    #[test]
    fn test_new_chunk_when_full() {
        let mut arena = StubArena::with_chunk_size(0x1000, 1);
        let page_words = ExecutableMemory::new(1, Protection::ReadWrite)
            .unwrap()
            .size()
            / INSN_BYTES;
        let per_chunk = page_words / AArch64::STUB_WORDS;

        for i in 0..=per_chunk {
            make_native_stub::<AArch64>(&mut arena, 0x2000 + i, 0).unwrap();
        }
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn test_failed_encoding_consumes_nothing() {
        let mut arena = StubArena::new(0x1000);
        let first = make_native_stub::<AArch64>(&mut arena, 0x2000, 1).unwrap();
        assert!(make_native_stub::<AArch64>(&mut arena, 0x2000, 0x1_0000).is_err());
        let second = make_native_stub::<AArch64>(&mut arena, 0x3000, 1).unwrap();
        assert_eq!(second, first + AArch64::STUB_WORDS * INSN_BYTES);
    }

    #[test]
    fn test_sparc_call_must_reach_emulator() {
        // Stubs call `call_emulator` pc-relatively; a routine far away in a
        // 64-bit address space cannot be reached.
        #[cfg(target_pointer_width = "64")]
        {
            let mut arena = StubArena::new(1 << 40);
            let result = make_native_stub::<Sparc>(&mut arena, 0x2000, 1);
            assert!(matches!(result, Err(PatchError::CallOutOfRange { .. })));
        }
    }
}
