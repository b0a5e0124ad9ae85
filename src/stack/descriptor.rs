//! Frame descriptors for native stack frames.
//!
//! The code generator emits one descriptor per call site. A descriptor is
//! keyed by the return address of that call and describes the shape of the
//! calling function's frame at the point of the call: how many local slots it
//! has, how many of its own incoming arguments live on the stack, which slots
//! hold heap references, and where its exception handler is (if any).

use std::collections::HashMap;

/// Bitmap of slots holding heap references.
///
/// Bit N = 1 means slot N (counting from the frame base) is a reference.
/// Native frames can be arbitrarily large, so the bits are stored in 32-bit
/// words. Trailing zero words are never stored, so equal bitmaps compare
/// equal however they were built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveBits {
    words: Box<[u32]>,
}

impl LiveBits {
    /// Create an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from raw 32-bit words (bit 0 of word 0 is slot 0).
    pub fn from_words(words: &[u32]) -> Self {
        let len = words.iter().rposition(|&w| w != 0).map_or(0, |i| i + 1);
        Self {
            words: words[..len].into(),
        }
    }

    /// Create from a single mask covering the first 64 slots.
    pub fn from_mask(mask: u64) -> Self {
        Self::from_words(&[mask as u32, (mask >> 32) as u32])
    }

    /// Create from a list of live slot indices.
    pub fn from_slots(slots: &[usize]) -> Self {
        let mut bits = Self::new();
        for &slot in slots {
            bits.set(slot);
        }
        bits
    }

    /// Mark a slot as live.
    pub fn set(&mut self, slot: usize) {
        let word = slot >> 5;
        if word >= self.words.len() {
            let mut words = self.words.to_vec();
            words.resize(word + 1, 0);
            self.words = words.into_boxed_slice();
        }
        self.words[word] |= 1 << (slot & 31);
    }

    /// Check whether a slot holds a reference.
    pub fn is_live(&self, slot: usize) -> bool {
        self.words
            .get(slot >> 5)
            .is_some_and(|w| (w >> (slot & 31)) & 1 != 0)
    }

    /// Raw words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Indices of live slots below `limit`.
    pub fn live_slots(&self, limit: usize) -> impl Iterator<Item = usize> + '_ {
        (0..limit).filter(|&i| self.is_live(i))
    }
}

/// Shape of one native stack frame at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Number of local slot words below the return address
    pub frame_size: usize,
    /// Number of stack-resident incoming arguments above the return address
    pub arity: usize,
    /// Reference map over locals, return address slot and arguments
    pub live_bits: LiveBits,
    /// Exception handler entry for this call site
    pub exception_handler: Option<usize>,
}

impl FrameDescriptor {
    /// Create a descriptor with no live slots and no handler.
    pub fn new(frame_size: usize, arity: usize) -> Self {
        Self {
            frame_size,
            arity,
            live_bits: LiveBits::new(),
            exception_handler: None,
        }
    }

    pub fn with_live_bits(mut self, live_bits: LiveBits) -> Self {
        self.live_bits = live_bits;
        self
    }

    pub fn with_handler(mut self, handler: usize) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Whether slot `index` of the frame holds a reference.
    pub fn live_bit(&self, index: usize) -> bool {
        self.live_bits.is_live(index)
    }

    /// Total words the frame occupies: locals, return address, arguments.
    pub fn size_in_words(&self) -> usize {
        self.frame_size + 1 + self.arity
    }

    /// Reference slots within the frame.
    pub fn live_slots(&self) -> Vec<usize> {
        self.live_bits.live_slots(self.size_in_words()).collect()
    }
}

/// Lookup from return address to frame descriptor.
///
/// Implementations must be total for every return address that can
/// legitimately appear on a native stack. A miss is treated by the walker
/// as stack corruption.
pub trait DescriptorTable {
    fn find(&self, return_address: usize) -> Option<&FrameDescriptor>;
}

/// Hash-map backed descriptor table.
#[derive(Debug, Clone, Default)]
pub struct DescriptorMap {
    entries: HashMap<usize, FrameDescriptor>,
}

impl DescriptorMap {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register the descriptor for a return address.
    /// Descriptors are immutable once registered; re-registering replaces.
    pub fn insert(&mut self, return_address: usize, descriptor: FrameDescriptor) {
        self.entries.insert(return_address, descriptor);
    }

    /// Builder-style insert.
    pub fn with(mut self, return_address: usize, descriptor: FrameDescriptor) -> Self {
        self.insert(return_address, descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DescriptorTable for DescriptorMap {
    fn find(&self, return_address: usize) -> Option<&FrameDescriptor> {
        self.entries.get(&return_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_bits_across_words() {
        let bits = LiveBits::from_slots(&[0, 2, 31, 32, 70]);

        assert!(bits.is_live(0));
        assert!(!bits.is_live(1));
        assert!(bits.is_live(2));
        assert!(bits.is_live(31));
        assert!(bits.is_live(32));
        assert!(bits.is_live(70));
        assert!(!bits.is_live(71));
        assert!(!bits.is_live(1000));
        assert_eq!(bits.words().len(), 3);
    }

    #[test]
    fn test_from_mask() {
        let bits = LiveBits::from_mask(0b101 | (1 << 40));
        assert_eq!(bits.live_slots(64).collect::<Vec<_>>(), vec![0, 2, 40]);
    }

    #[test]
    fn test_same_bitmap_compares_equal() {
        assert_eq!(LiveBits::from_mask(0b101), LiveBits::from_slots(&[0, 2]));
        assert_eq!(LiveBits::from_mask(0), LiveBits::new());
        assert_eq!(LiveBits::from_words(&[0, 4, 0, 0]), LiveBits::from_slots(&[34]));
        assert_eq!(LiveBits::from_mask(1 << 40).words(), &[0, 1 << 8]);
        assert_eq!(
            FrameDescriptor::new(2, 1).with_live_bits(LiveBits::from_mask(0b10)),
            FrameDescriptor::new(2, 1).with_live_bits(LiveBits::from_slots(&[1])),
        );
    }

    #[test]
    fn test_descriptor_shape() {
        let desc = FrameDescriptor::new(3, 2)
            .with_live_bits(LiveBits::from_mask(0b101))
            .with_handler(0x4000);

        assert_eq!(desc.size_in_words(), 6);
        assert!(desc.live_bit(0));
        assert!(!desc.live_bit(1));
        assert!(desc.live_bit(2));
        assert_eq!(desc.live_slots(), vec![0, 2]);
        assert_eq!(desc.exception_handler, Some(0x4000));
    }

    #[test]
    fn test_table_lookup_is_exact() {
        let table = DescriptorMap::new()
            .with(0x1000, FrameDescriptor::new(1, 0))
            .with(0x1010, FrameDescriptor::new(2, 0));

        assert_eq!(table.len(), 2);
        assert_eq!(table.find(0x1000).unwrap().frame_size, 1);
        assert_eq!(table.find(0x1010).unwrap().frame_size, 2);
        assert!(table.find(0x1008).is_none());
    }
}
