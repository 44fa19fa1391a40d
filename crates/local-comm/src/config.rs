//! Centralized configuration for local-comm.
//!
//! [`LocalCommConfig`] holds the protocol constants. [`CommOptions`] is the
//! per-endpoint / per-caller value built from them, overridable with the
//! `with_*` builder methods.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Protocol-level constants.
pub struct LocalCommConfig;

impl LocalCommConfig {
    // Rendezvous addresses
    pub const SOCKET_DIR: &'static str = "/tmp";
    pub const SOCKET_PREFIX: &'static str = "local_comm_";
    pub const SOCKET_SUFFIX: &'static str = ".sock";
    pub const LISTEN_BACKLOG: i32 = 64;

    // Client timing
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

    // Server timing
    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const SERVER_IO_TIMEOUT: Duration = Duration::from_secs(10);

    // Control channel
    pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

    // Segments
    pub const SEGMENT_PREFIX: &'static str = "lcseg_";
}

/// Options shared by [`Endpoint`](crate::Endpoint) and
/// [`ServiceCaller`](crate::ServiceCaller).
#[derive(Debug, Clone)]
pub struct CommOptions {
    /// Directory holding rendezvous sockets.
    pub socket_dir: PathBuf,
    /// How long a caller keeps retrying the connect.
    pub connect_timeout: Duration,
    /// Fixed backoff between connect attempts.
    pub retry_interval: Duration,
    /// Upper bound on one readiness wait in the server loop.
    pub poll_interval: Duration,
    /// Listen backlog for each registered service.
    pub listen_backlog: i32,
    /// Bound on each read/write the server performs on an accepted connection.
    pub server_io_timeout: Option<Duration>,
    /// Prefix for generated segment names.
    pub segment_prefix: String,
    /// Whether `Endpoint::run` stops on Ctrl+C.
    pub interrupt_on_ctrl_c: bool,
    /// Permission bits applied to each socket file after bind.
    pub socket_mode: Option<u32>,
}

impl Default for CommOptions {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(LocalCommConfig::SOCKET_DIR),
            connect_timeout: LocalCommConfig::CONNECT_TIMEOUT,
            retry_interval: LocalCommConfig::CONNECT_RETRY_INTERVAL,
            poll_interval: LocalCommConfig::POLL_INTERVAL,
            listen_backlog: LocalCommConfig::LISTEN_BACKLOG,
            server_io_timeout: Some(LocalCommConfig::SERVER_IO_TIMEOUT),
            segment_prefix: LocalCommConfig::SEGMENT_PREFIX.to_string(),
            interrupt_on_ctrl_c: true,
            socket_mode: None,
        }
    }
}

impl CommOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rendezvous socket directory.
    pub fn with_socket_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.socket_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the connect retry backoff.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the server's readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the listen backlog.
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Set or clear the server-side per-operation I/O timeout.
    pub fn with_server_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.server_io_timeout = timeout;
        self
    }

    /// Set the prefix for generated segment names.
    pub fn with_segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.segment_prefix = prefix.into();
        self
    }

    /// Enable or disable stopping `run()` on Ctrl+C.
    ///
    /// Once `run()` has listened for Ctrl+C, tokio's SIGINT handler stays
    /// installed for the rest of the process. A later Ctrl+C no longer
    /// terminates the host by default; hosts that rely on that should
    /// disable this and cancel [`Endpoint::shutdown_token`] themselves.
    ///
    /// [`Endpoint::shutdown_token`]: crate::Endpoint::shutdown_token
    pub fn with_interrupt_on_ctrl_c(mut self, enabled: bool) -> Self {
        self.interrupt_on_ctrl_c = enabled;
        self
    }

    /// Restrict socket file permissions (e.g. `0o600`).
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_constants() {
        let opts = CommOptions::default();
        assert_eq!(opts.socket_dir, PathBuf::from("/tmp"));
        assert_eq!(opts.connect_timeout, Duration::from_secs(2));
        assert_eq!(opts.retry_interval, Duration::from_millis(20));
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
        assert_eq!(opts.listen_backlog, 64);
        assert_eq!(opts.segment_prefix, "lcseg_");
        assert!(opts.interrupt_on_ctrl_c);
        assert!(opts.socket_mode.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let opts = CommOptions::new()
            .with_socket_dir("/run/user/1000")
            .with_connect_timeout(Duration::from_millis(250))
            .with_poll_interval(Duration::from_millis(50))
            .with_server_io_timeout(None)
            .with_segment_prefix("test_")
            .with_interrupt_on_ctrl_c(false)
            .with_socket_mode(0o600);

        assert_eq!(opts.socket_dir, PathBuf::from("/run/user/1000"));
        assert_eq!(opts.connect_timeout, Duration::from_millis(250));
        assert_eq!(opts.poll_interval, Duration::from_millis(50));
        assert!(opts.server_io_timeout.is_none());
        assert_eq!(opts.segment_prefix, "test_");
        assert!(!opts.interrupt_on_ctrl_c);
        assert_eq!(opts.socket_mode, Some(0o600));
    }
}
