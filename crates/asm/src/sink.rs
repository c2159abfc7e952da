//! Abstract interface for adding bytes to a code segment.

/// Offset in bytes from the beginning of a code region.
///
/// The engine can hold many code regions, so we don't want to use a type like
/// `usize` which names a host address rather than a position inside a region.
pub type CodeOffset = u32;

/// Describe how an instruction is emitted into a code buffer.
///
/// A `CodeSink` receives all of the machine code for a translated sequence.
/// Writers emit multi-byte values in little-endian order, the native order of
/// the g64 architecture.
pub trait CodeSink {
    /// Get the current position.
    fn current_offset(&self) -> CodeOffset;

    /// Add 1 byte to the code section.
    fn put1(&mut self, _: u8);

    /// Add 2 bytes to the code section.
    fn put2(&mut self, _: u16);

    /// Add 4 bytes to the code section.
    fn put4(&mut self, _: u32);

    /// Add 8 bytes to the code section.
    fn put8(&mut self, _: u64);
}

/// Provide a convenient implementation for testing.
impl CodeSink for Vec<u8> {
    fn current_offset(&self) -> CodeOffset {
        self.len().try_into().unwrap()
    }

    fn put1(&mut self, v: u8) {
        self.push(v);
    }

    fn put2(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put4(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put8(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }
}
