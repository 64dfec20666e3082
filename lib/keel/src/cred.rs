use serde_derive::{Deserialize, Serialize};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// OS reported identity of a peer process on a local socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Coarse trust level of a peer process. Ordered so that `>=` expresses
/// "at least this trusted".
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum IntegrityLevel {
    Low,
    Medium,
    High,
}

impl Credentials {
    /// Derives the integrity level from the peer credentials. Root maps to
    /// `High`, processes of the same effective user to `Medium`, everything
    /// else to `Low`.
    pub fn integrity_level(&self) -> IntegrityLevel {
        if self.uid == 0 {
            return IntegrityLevel::High;
        }

        let own_uid = unsafe { libc::geteuid() };

        if self.uid == own_uid {
            IntegrityLevel::Medium
        } else {
            IntegrityLevel::Low
        }
    }
}

/// Reads the peer credentials of a connected local socket via `SO_PEERCRED`.
pub fn peer_credentials(fd: RawFd) -> io::Result<Credentials> {
    let mut ucred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(Credentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_level_ordering() {
        assert!(IntegrityLevel::High > IntegrityLevel::Medium);
        assert!(IntegrityLevel::Medium > IntegrityLevel::Low);
        assert!(IntegrityLevel::Low >= IntegrityLevel::Low);
    }

    #[test]
    fn test_root_is_high() {
        let creds = Credentials { pid: 1, uid: 0, gid: 0 };
        assert_eq!(creds.integrity_level(), IntegrityLevel::High);
    }

    #[test]
    fn test_own_uid_is_medium_or_high() {
        let own_uid = unsafe { libc::geteuid() };
        let creds = Credentials { pid: 1, uid: own_uid, gid: 0 };

        let expected = if own_uid == 0 {
            IntegrityLevel::High
        } else {
            IntegrityLevel::Medium
        };
        assert_eq!(creds.integrity_level(), expected);
    }

    #[test]
    fn test_peer_credentials_on_socketpair() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (a, _b) = UnixStream::pair().unwrap();
        let creds = peer_credentials(a.as_raw_fd()).unwrap();

        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, unsafe { libc::geteuid() });
    }
}
