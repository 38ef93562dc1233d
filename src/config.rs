//! In-process server configuration.
//!
//! All knobs are set through [`ServerConfig::builder`]; there is no CLI and
//! no persisted state. The defaults mirror common front-end limits: 8 KiB
//! request lines, 8 KiB header blocks, keep-alive capped at 256 requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Immutable server/pipeline configuration shared by all connections.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_request_line_size: usize,
    pub max_request_header_size: usize,
    /// Residual request-body bytes the server will swallow to keep the
    /// connection alive after the response was committed early; `None`
    /// means unlimited.
    pub max_payload_remainder_to_skip: Option<u64>,
    pub allow_payload_for_undefined_methods: bool,
    pub keep_alive_timeout: Duration,
    /// Requests served per connection before keep-alive is disabled;
    /// `None` means unlimited.
    pub max_keep_alive_requests: Option<u64>,
    pub chunking_enabled: bool,
    /// Deflate compression level (0-9) used by the gzip content encoding.
    pub compression_level: u32,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub write_queue_capacity: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::builder().build()
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        // instance numbering is best-effort; concurrent starts may observe
        // gaps and callers must not depend on exact values
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            config: ServerConfig {
                max_request_line_size: 8 * 1024,
                max_request_header_size: 8 * 1024,
                max_payload_remainder_to_skip: Some(512 * 1024),
                allow_payload_for_undefined_methods: false,
                keep_alive_timeout: Duration::from_secs(30),
                max_keep_alive_requests: Some(256),
                chunking_enabled: true,
                compression_level: 6,
                read_buffer_size: 8 * 1024,
                write_buffer_size: 8 * 1024,
                write_queue_capacity: 64,
                read_timeout: Duration::from_secs(30),
                write_timeout: Duration::from_secs(30),
                server_name: format!("nexio-{instance}"),
            },
        }
    }

    pub fn max_request_line_size(mut self, size: usize) -> Self {
        self.config.max_request_line_size = size;
        self
    }

    pub fn max_request_header_size(mut self, size: usize) -> Self {
        self.config.max_request_header_size = size;
        self
    }

    pub fn max_payload_remainder_to_skip(mut self, limit: Option<u64>) -> Self {
        self.config.max_payload_remainder_to_skip = limit;
        self
    }

    pub fn allow_payload_for_undefined_methods(mut self, allow: bool) -> Self {
        self.config.allow_payload_for_undefined_methods = allow;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn max_keep_alive_requests(mut self, max: Option<u64>) -> Self {
        self.config.max_keep_alive_requests = max;
        self
    }

    pub fn chunking_enabled(mut self, enabled: bool) -> Self {
        self.config.chunking_enabled = enabled;
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level.min(9);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity.max(1);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ServerConfig::builder()
            .max_request_line_size(1024)
            .chunking_enabled(false)
            .max_keep_alive_requests(None)
            .build();

        assert_eq!(config.max_request_line_size, 1024);
        assert!(!config.chunking_enabled);
        assert_eq!(config.max_keep_alive_requests, None);
    }

    #[test]
    fn instance_names_are_distinct() {
        let a = ServerConfig::builder().build();
        let b = ServerConfig::builder().build();
        assert_ne!(a.server_name, b.server_name);
    }
}
