use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref DEFAULT_SOCKET_DIR: PathBuf = env::temp_dir().join("ipcbind");
}

/// Local endpoint identifier. The pair is opaque to the binding; it only
/// needs equality, ordering and a stable mapping to a socket path.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IpcUnicastAddress {
    pub domain: u32,
    pub port: u32,
}

impl IpcUnicastAddress {
    #[inline]
    pub fn new(domain: u32, port: u32) -> IpcUnicastAddress {
        IpcUnicastAddress { domain, port }
    }

    /// Maps the address to its Unix socket path under the supplied socket
    /// directory, or under the process default when none is configured.
    pub fn socket_path(&self, socket_dir: Option<&Path>) -> PathBuf {
        socket_dir
            .unwrap_or(&DEFAULT_SOCKET_DIR)
            .join(format!("{}_{}.sock", self.domain, self.port))
    }
}

impl fmt::Display for IpcUnicastAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}
