use std::time::Duration;

/// Default TCP port for TLS file transfer.
pub const TRANSFER_PORT: u16 = 8080;

/// Copy buffer size for file streaming (1 MiB).
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// How long the sender waits for the receiver's Ack/Denied decision.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-read inactivity limit while receiving a session.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Emit a progress event every this many copied buffers.
pub const PROGRESS_EVERY_BUFFERS: u64 = 10;
