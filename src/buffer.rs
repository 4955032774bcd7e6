//! Fixed-capacity byte buffer with a high-water mark.
//!
//! Amortizes many small per-sample appends into one larger sink write; the
//! high-water mark gives a caller time to flush before the buffer actually
//! fills up. Grounded on `vzclient/buffer.py::Buffer`.

use bytes::{Bytes, BytesMut};

use crate::error::{self, Result};

/// A fixed-capacity, append-only byte buffer.
///
/// Writes are all-or-nothing: if the concatenation of all arguments to a
/// single [`Buffer::write`] call would exceed `capacity`, the call fails and
/// leaves the buffer completely unchanged.
#[derive(Debug)]
pub struct Buffer {
    storage: BytesMut,
    capacity: usize,
    high_water_mark: usize,
}

impl Buffer {
    /// Create a new buffer. `high_water_mark` defaults to `0.9 * capacity`
    /// when not given, and must not exceed `capacity`.
    pub fn new(capacity: usize, high_water_mark: Option<usize>) -> Result<Self> {
        let hwm = high_water_mark.unwrap_or_else(|| (capacity as f64 * 0.9) as usize);
        if hwm > capacity {
            return error::InvalidHighWaterMarkSnafu {
                hwm,
                capacity,
            }
            .fail();
        }
        Ok(Self {
            storage: BytesMut::with_capacity(capacity),
            capacity,
            high_water_mark: hwm,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// True once the buffer holds at least `high_water_mark` bytes.
    pub fn is_full(&self) -> bool {
        self.storage.len() >= self.high_water_mark
    }

    /// Current live content.
    pub fn data(&self) -> &[u8] {
        &self.storage
    }

    /// Append the concatenation of `chunks` to the buffer.
    ///
    /// Fails with [`error::Error::BufferOverflow`] and leaves the buffer
    /// unchanged if the total length would exceed `capacity`.
    pub fn write(&mut self, chunks: &[&[u8]]) -> Result<usize> {
        let added: usize = chunks.iter().map(|c| c.len()).sum();
        let projected = self.storage.len() + added;
        if projected > self.capacity {
            return error::BufferOverflowSnafu {
                len: projected,
                capacity: self.capacity,
            }
            .fail();
        }
        for chunk in chunks {
            self.storage.extend_from_slice(chunk);
        }
        Ok(added)
    }

    /// Snapshot the current content as an immutable, owned batch and clear
    /// the buffer.
    pub fn take(&mut self) -> Bytes {
        self.storage.split().freeze()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn rejects_high_water_mark_above_capacity() {
        assert!(Buffer::new(10, Some(11)).is_err());
    }

    #[test]
    fn defaults_high_water_mark_to_ninety_percent() {
        let buf = Buffer::new(100, None).unwrap();
        assert_eq!(buf.high_water_mark(), 90);
    }

    #[test]
    fn overflow_scenario() {
        // spec.md §8 scenario 5
        let mut buf = Buffer::new(20, None).unwrap();
        buf.write(&[b"Hello", b" World", b"!"]).unwrap();
        assert_eq!(buf.len(), 12);

        buf.write(&[b"876543", b"21"]).unwrap();
        assert_eq!(buf.len(), 20);
        assert!(buf.is_full());

        let before = buf.data().to_vec();
        assert!(buf.write(&[b"Overflow"]).is_err());
        assert_eq!(buf.len(), 20);
        assert_eq!(buf.data(), before.as_slice());
    }

    #[test]
    fn data_matches_concatenation_in_order() {
        let mut buf = Buffer::new(64, None).unwrap();
        buf.write(&[b"abc", b"def"]).unwrap();
        buf.write(&[b"ghi"]).unwrap();
        assert_eq!(buf.data(), b"abcdefghi");
    }

    #[test]
    fn take_clears_and_returns_snapshot() {
        let mut buf = Buffer::new(64, None).unwrap();
        buf.write(&[b"hello"]).unwrap();
        let snap = buf.take();
        assert_eq!(&snap[..], b"hello");
        assert_eq!(buf.len(), 0);
    }
}

#[cfg(test)]
mod proptest_invariants {
    use super::Buffer;
    use proptest::prelude::*;

    proptest! {
        // spec.md §8 "For any sequence of writes whose concatenated length
        // ≤ capacity, data() equals the concatenation in order."
        #[test]
        fn fitting_writes_reproduce_the_concatenation(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..8),
        ) {
            let total: usize = chunks.iter().map(Vec::len).sum();
            let mut buf = Buffer::new(total + 8, None).unwrap();
            let mut expected = Vec::new();
            for chunk in &chunks {
                buf.write(&[chunk.as_slice()]).unwrap();
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(buf.data(), expected.as_slice());
            prop_assert_eq!(buf.len(), expected.len());
        }

        // spec.md §8 "Any write that would exceed capacity fails and leaves
        // len unchanged."
        #[test]
        fn overflowing_write_leaves_buffer_unchanged(
            capacity in 1usize..64,
            extra in 1usize..32,
        ) {
            let mut buf = Buffer::new(capacity, None).unwrap();
            let filler = vec![7u8; capacity];
            buf.write(&[&filler]).unwrap();
            let before = buf.data().to_vec();

            let overflow = vec![9u8; extra];
            prop_assert!(buf.write(&[&overflow]).is_err());
            prop_assert_eq!(buf.data(), before.as_slice());
            prop_assert_eq!(buf.len(), capacity);
        }
    }
}
