//! The record stored in a port file.

use serde::{Deserialize, Serialize};

/// Where a server listens and the secret proving its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortFileValues {
    /// Loopback port the server accepts connections on.
    pub port: u16,
    /// Random secret clients must echo back in every request.
    pub cookie: u64,
    /// Process id of the server, for diagnostics.
    #[serde(default)]
    pub pid: u32,
}

impl PortFileValues {
    /// Builds a record for the current process.
    #[must_use]
    pub fn new(port: u16, cookie: u64) -> Self {
        Self {
            port,
            cookie,
            pid: std::process::id(),
        }
    }

    /// A record is usable only when both the port and the cookie are set.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.port != 0 && self.cookie != 0
    }

    /// Returns true when the record names the given server.
    #[must_use]
    pub const fn matches(&self, port: u16, cookie: u64) -> bool {
        self.port == port && self.cookie == cookie
    }
}
