//! Buffers shared by the state machines and the transport.

/// Default capacity of the read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Buffer set for state machine operations.
#[derive(Debug)]
pub struct BufferSet {
    /// Payload of the last message read
    pub read_buffer: Vec<u8>,
    /// Scratch buffer for outgoing messages, cleared before every write
    pub write_buffer: Vec<u8>,
    /// RowDescription payload of the current result set
    pub column_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::with_read_capacity(DEFAULT_READ_BUFFER_SIZE)
    }

    /// Buffer set whose read buffer starts at `min_read_buffer_size` bytes.
    pub fn with_read_capacity(min_read_buffer_size: usize) -> Self {
        Self {
            read_buffer: Vec::with_capacity(min_read_buffer_size),
            write_buffer: Vec::with_capacity(DEFAULT_READ_BUFFER_SIZE),
            column_buffer: Vec::with_capacity(512),
            type_byte: 0,
        }
    }

    /// Load a message into the read side as if it had just been read.
    pub(crate) fn load(&mut self, type_byte: u8, payload: &[u8]) {
        self.type_byte = type_byte;
        self.read_buffer.clear();
        self.read_buffer.extend_from_slice(payload);
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
