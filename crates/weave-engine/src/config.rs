//! Engine configuration.

use std::time::Duration;

use weave_core::MESSAGE_SIZE_MAX;

/// Tunables for the sync engine. `Config::default()` matches the transport
/// limits and retry behavior of the reference deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard ceiling on an encoded wire message.
    pub max_message_size: usize,

    /// Response senders flush once a pending frame grows past this.
    /// Must leave headroom below `max_message_size` for record framing.
    pub flush_watermark: usize,

    /// Attempts to connect and open a message sender before a buffered
    /// message is dropped.
    pub connect_attempts: u32,

    /// Attempts to deliver one message before it is discarded. The sender
    /// is reset and reopened between attempts.
    pub send_attempts: u32,

    /// Pause between failed connect attempts.
    pub reconnect_backoff: Duration,

    /// How long a response sender waits for more input before flushing a
    /// partially filled frame.
    pub quiesce_interval: Duration,

    /// Mailbox depth for the request and response manager event loops.
    pub mailbox_capacity: usize,

    /// Number of workers executing incoming-query traversals.
    pub query_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_message_size: MESSAGE_SIZE_MAX,
            flush_watermark: MESSAGE_SIZE_MAX - 64 * 1024,
            connect_attempts: 3,
            send_attempts: 3,
            reconnect_backoff: Duration::from_millis(100),
            quiesce_interval: Duration::from_millis(5),
            mailbox_capacity: 16,
            query_workers: 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_leaves_headroom() {
        let config = Config::default();
        assert!(config.flush_watermark < config.max_message_size);
    }
}
