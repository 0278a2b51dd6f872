//! Registry configuration

use std::time::Duration;

/// Stream registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum frames held in a stream's GOP cache (headers excluded)
    pub max_gop_packets: usize,

    /// Per-subscriber delivery queue depth; a full queue evicts the subscriber
    pub subscriber_queue_depth: usize,

    /// Keep a stream (cache and subscribers) after its publisher leaves
    pub keep_after_publisher_end: bool,

    /// How long a publisher-less stream is kept when the policy is on
    pub publisher_grace_period: Duration,

    /// Let players subscribe to a stream that has not started yet
    pub allow_play_before_publish: bool,

    /// How long a placeholder stream waits for a publisher
    pub idle_stream_timeout: Duration,

    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_gop_packets: 1024,
            subscriber_queue_depth: 512,
            keep_after_publisher_end: true,
            publisher_grace_period: Duration::from_secs(10),
            allow_play_before_publish: false,
            idle_stream_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    pub fn max_gop_packets(mut self, max: usize) -> Self {
        self.max_gop_packets = max.max(1);
        self
    }

    pub fn subscriber_queue_depth(mut self, depth: usize) -> Self {
        self.subscriber_queue_depth = depth.max(1);
        self
    }

    pub fn keep_after_publisher_end(mut self, keep: bool) -> Self {
        self.keep_after_publisher_end = keep;
        self
    }

    pub fn publisher_grace_period(mut self, period: Duration) -> Self {
        self.publisher_grace_period = period;
        self
    }

    pub fn allow_play_before_publish(mut self, allow: bool) -> Self {
        self.allow_play_before_publish = allow;
        self
    }

    pub fn idle_stream_timeout(mut self, timeout: Duration) -> Self {
        self.idle_stream_timeout = timeout;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
