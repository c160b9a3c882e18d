//! Node configuration, read once at creation time.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`Node`](crate::Node).
///
/// The port doubles as the cluster identity: the first process to bind it
/// becomes the server, later joiners become clients of that server.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// TCP/UDP port shared by all nodes of the cluster.
    pub port: u16,
    /// Root directory for persisted namespaces. Defaults to `$HOME/.nano/db`.
    pub directory: Option<PathBuf>,
    /// Addresses of peer nodes on other machines. Peers connecting from these
    /// addresses are treated as remote links by the forwarding rule.
    pub hosts: Vec<String>,
    /// Pause after each snapshot flush before the next dirty wake is observed.
    pub flush_debounce: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: 3000,
            directory: None,
            hosts: Vec::new(),
            flush_debounce: Duration::from_millis(250),
        }
    }
}

impl Configuration {
    /// Resolves the effective data root.
    ///
    /// Falls back to the current directory when no home directory can be
    /// determined.
    #[must_use]
    pub fn data_root(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            home::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".nano")
                .join("db")
        })
    }
}
