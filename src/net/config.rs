use std::time::Duration;

/// Socket and buffer tuning applied to accepted and outbound connections.
///
/// - `nodelay`: when enabled (default), disables Nagle's algorithm for
///   lower latency
/// - `keep_alive`: configures SO_KEEPALIVE to detect dead peers
/// - `backlog`: listen queue depth
/// - `read_buffer_size`: size of the per-connection read chunk
#[derive(Clone, Debug)]
pub struct TcpOptions {
    pub nodelay: bool,
    pub keep_alive: Option<Duration>,
    pub backlog: u32,
    pub read_buffer_size: usize,
}

impl TcpOptions {
    pub fn builder() -> TcpOptionsBuilder {
        TcpOptionsBuilder::new()
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keep_alive: None,
            backlog: 1024,
            read_buffer_size: 8192,
        }
    }
}

/// Builder for [`TcpOptions`]; unset fields fall back to the defaults.
pub struct TcpOptionsBuilder {
    nodelay: Option<bool>,
    keep_alive: Option<Option<Duration>>,
    backlog: Option<u32>,
    read_buffer_size: Option<usize>,
}

impl TcpOptionsBuilder {
    pub fn new() -> Self {
        Self {
            nodelay: None,
            keep_alive: None,
            backlog: None,
            read_buffer_size: None,
        }
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> TcpOptions {
        let default = TcpOptions::default();
        TcpOptions {
            nodelay: self.nodelay.unwrap_or(default.nodelay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            backlog: self.backlog.unwrap_or(default.backlog),
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size),
        }
    }
}

impl Default for TcpOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let options = TcpOptions::builder().build();
        assert!(options.nodelay);
        assert_eq!(options.backlog, 1024);
        assert_eq!(options.read_buffer_size, 8192);
        assert!(options.keep_alive.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let options = TcpOptions::builder()
            .nodelay(false)
            .backlog(64)
            .read_buffer_size(512)
            .keep_alive(Some(Duration::from_secs(30)))
            .build();
        assert!(!options.nodelay);
        assert_eq!(options.backlog, 64);
        assert_eq!(options.read_buffer_size, 512);
        assert_eq!(options.keep_alive, Some(Duration::from_secs(30)));
    }
}
