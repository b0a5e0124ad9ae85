//! Code buffer for building instruction sequences.
//!
//! Both supported targets use fixed 32-bit instruction words, so the buffer
//! collects whole words. The sequence is copied into place through a
//! [`PatchSet`](super::patch::PatchSet) once its final address is known.

/// A buffer of instruction words.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    words: Vec<u32>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create a new code buffer with room for `capacity` words.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
        }
    }

    /// Number of words emitted.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Current byte offset from the start of the sequence.
    pub fn offset(&self) -> usize {
        self.words.len() * 4
    }

    /// Emit one instruction word.
    pub fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Emit a 64-bit literal as two words, low word first.
    pub fn emit_u64(&mut self, value: u64) {
        self.emit(value as u32);
        self.emit((value >> 32) as u32);
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}
