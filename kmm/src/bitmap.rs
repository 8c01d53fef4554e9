//! Occupancy bitmaps stored in raw memory.
//!
//! Both the buddy allocator (one free map per order) and the pool allocator (one slot map per
//! page) keep their state as plain bit arrays living inside the memory they manage. A [`Bitmap`]
//! is a borrowed view over such an array.
//!
//! Bit `n` lives in byte `n / 8`, at position `n % 8`. Searches scan the array in 64-bit strides
//! first and fall back to single bytes for the tail, so a saturated bitmap of `N` bits is skipped
//! in `N / 64` steps.

use core::mem::size_of;

const WORD_BYTES: usize = size_of::<u64>();

/// A mutable view over a bit array.
#[derive(Debug)]
pub struct Bitmap<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Bitmap<'a> {
    /// Creates a bitmap view over `bytes`.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Creates a bitmap view over `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole lifetime `'a`, and
    /// no other reference to that memory may exist in the meantime.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        // SAFETY: guaranteed by the caller
        Self::new(unsafe { core::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Returns the number of bits in the bitmap.
    pub fn bits(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Returns the raw bytes of the bitmap.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Returns the value of bit `n`.
    pub fn get(&self, n: usize) -> bool {
        self.bytes[n / 8] & (1 << (n % 8)) != 0
    }

    /// Sets bit `n`.
    pub fn set(&mut self, n: usize) {
        self.bytes[n / 8] |= 1 << (n % 8);
    }

    /// Clears bit `n`.
    pub fn clear(&mut self, n: usize) {
        self.bytes[n / 8] &= !(1 << (n % 8));
    }

    /// Overwrites every byte of the bitmap with `pattern`.
    pub fn fill(&mut self, pattern: u8) {
        self.bytes.iter_mut().for_each(|b| *b = pattern);
    }

    /// Returns the index of the first clear bit, if any.
    pub fn first_zero(&self) -> Option<usize> {
        self.find(u64::MAX, u8::MAX)
            .map(|(idx, byte)| idx * 8 + (!byte).trailing_zeros() as usize)
    }

    /// Returns the index of the first set bit, if any.
    pub fn first_one(&self) -> Option<usize> {
        self.find(0, 0)
            .map(|(idx, byte)| idx * 8 + byte.trailing_zeros() as usize)
    }

    /// Returns `true` if every bit is set.
    pub fn is_saturated(&self) -> bool {
        self.first_zero().is_none()
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Finds the first byte differing from `skip_byte`, skipping whole words equal to
    /// `skip_word` first. Returns the byte index and its value.
    fn find(&self, skip_word: u64, skip_byte: u8) -> Option<(usize, u8)> {
        let mut offset = 0;

        for chunk in self.bytes.chunks_exact(WORD_BYTES) {
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(chunk);

            if u64::from_le_bytes(word) != skip_word {
                break;
            }
            offset += WORD_BYTES;
        }

        self.bytes[offset..]
            .iter()
            .position(|&b| b != skip_byte)
            .map(|pos| (offset + pos, self.bytes[offset + pos]))
    }
}
