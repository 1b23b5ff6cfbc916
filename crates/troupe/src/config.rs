//! Tunables for servers, client connections, and the secure channel.
//!
//! Every struct implements `Default` with production values; tests usually
//! override one or two fields with struct update syntax.

use std::time::Duration;

use troupe_session::SessionConfig;
use troupe_transport::{DEFAULT_MAX_FRAME_LENGTH, Framing};

/// Server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Sessions with no inbound traffic for this long are evicted.
    ///
    /// Default: 1 hour.
    pub idle_timeout: Duration,

    /// How often the reaper looks for idle sessions.
    ///
    /// Default: 10 seconds.
    pub poll_interval: Duration,

    /// Largest accepted frame in bytes.
    ///
    /// Default: 8 MiB.
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(10),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ServerConfig {
    pub(crate) fn session(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: self.idle_timeout,
            poll_interval: self.poll_interval,
        }
    }

    pub(crate) fn framing(&self) -> Framing {
        Framing {
            max_frame_length: self.max_frame_length,
        }
    }
}

/// Client connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Give up on `connect()` after this long.
    ///
    /// Default: 2 seconds.
    pub connect_timeout: Duration,

    /// Largest accepted frame in bytes.
    ///
    /// Default: 8 MiB.
    pub max_frame_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn framing(&self) -> Framing {
        Framing {
            max_frame_length: self.max_frame_length,
        }
    }
}

/// Secure channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureConfig {
    /// RSA modulus size for generated key pairs.
    ///
    /// Default: 1024.
    pub key_bits: usize,

    /// How long a client waits for the server's key during `connect()`.
    ///
    /// Default: 5 seconds.
    pub handshake_timeout: Duration,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            key_bits: 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(3600));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.session().idle_timeout, config.idle_timeout);
        assert_eq!(config.framing().max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_secure_config_defaults() {
        let config = SecureConfig::default();
        assert_eq!(config.key_bits, 1024);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }
}
