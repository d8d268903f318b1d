/// Largest data block requested in one `SSH_FXP_READ`. Larger caller
/// requests are clamped.
pub const MAX_READ_BLOCK_LENGTH: u32 = 256 * 1024;

/// Largest data block accepted in one `SSH_FXP_WRITE`. Larger writes are
/// rejected at the facade.
pub const MAX_WRITE_BLOCK_LENGTH: u32 = 32 * 1024;

/// Headroom on top of the write block for the frame header and the
/// non-data fields of any request.
pub const PACKET_HEADROOM: usize = 1024;

/// How many times a read returning zero bytes is re-issued before the
/// caller sees an error. A workaround for servers that return empty
/// DATA instead of EOF or real data.
pub const DEFAULT_EMPTY_READ_RETRIES: u32 = 4;

/// Tunable limits of a session.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_read_block: u32,
    pub max_write_block: u32,
    pub empty_read_retries: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_read_block: MAX_READ_BLOCK_LENGTH,
            max_write_block: MAX_WRITE_BLOCK_LENGTH,
            empty_read_retries: DEFAULT_EMPTY_READ_RETRIES,
        }
    }
}

impl Limits {
    /// Upper bound for any outgoing packet buffer
    pub fn max_packet(&self) -> usize {
        self.max_write_block as usize + PACKET_HEADROOM
    }
}
