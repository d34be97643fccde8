//! Session tuning knobs.

use std::time::Duration;

/// Receive buffer size above which idle storage is released
pub const MAX_BUFFER: usize = 1 << 21;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on an outbound dial made for a connect request
    pub dial_timeout: Duration,
    /// Chunk size used by the byte pump
    pub copy_buffer_size: usize,
    /// Idle receive-buffer capacity that triggers compaction
    pub compact_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(60),
            copy_buffer_size: 32 * 1024,
            compact_threshold: MAX_BUFFER / 8,
        }
    }
}
