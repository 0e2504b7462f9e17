/// Reusable buffers of one client connection
///
/// A server connection uses a single `BufferSet` for its whole lifetime.
#[derive(Debug, Default)]
pub struct BufferSet {
    /// Payload of the packet being handled.
    /// Bytes are valid until the next packet is read.
    pub read_buffer: Vec<u8>,

    /// Framed response packets, headers included.
    /// Bytes are valid until the response is flushed.
    write_buffer: Vec<u8>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the write buffer and return mutable access to it.
    #[inline]
    pub fn new_write_buffer(&mut self) -> &mut Vec<u8> {
        self.write_buffer.clear();
        &mut self.write_buffer
    }

    #[inline]
    pub fn write_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buffer
    }

    #[inline]
    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Borrow both buffers at once: the payload being handled and the response being built
    #[inline]
    pub fn split(&mut self) -> (&[u8], &mut Vec<u8>) {
        self.write_buffer.clear();
        (&self.read_buffer, &mut self.write_buffer)
    }

    /// Drop contents, keeping capacity
    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
    }
}
