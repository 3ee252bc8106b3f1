//! Peer credential verification for IPC connections.
//!
//! The service accepts connections only from processes running as the same
//! user as the daemon itself. Credentials come from the kernel, never from
//! anything the peer sends.

use std::os::fd::AsRawFd;

/// Kernel-reported credentials of a connected peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerCred {
    /// User id of the peer process
    pub uid: u32,
    /// Process id of the peer, where the platform exposes it
    pub pid: Option<i32>,
}

/// Errors that can occur during peer verification.
#[derive(Debug)]
pub enum PeerVerifyError {
    /// Failed to retrieve peer credentials from the socket
    CredentialsFailed(String),
    /// Peer UID doesn't match the daemon's user
    UidMismatch { peer: u32, current: u32 },
}

impl std::fmt::Display for PeerVerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerVerifyError::CredentialsFailed(e) => {
                write!(f, "Failed to get peer credentials: {}", e)
            }
            PeerVerifyError::UidMismatch { peer, current } => {
                write!(f, "UID mismatch: peer={}, current={}", peer, current)
            }
        }
    }
}

impl std::error::Error for PeerVerifyError {}

/// Verify a connecting peer on Linux using SO_PEERCRED.
#[cfg(target_os = "linux")]
pub fn verify_peer<S: AsRawFd>(socket: &S) -> Result<PeerCred, PeerVerifyError> {
    let fd = socket.as_raw_fd();

    // Get peer credentials via SO_PEERCRED
    let creds = unsafe {
        let mut creds: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut creds as *mut _ as *mut _,
            &mut len,
        ) != 0
        {
            return Err(PeerVerifyError::CredentialsFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        creds
    };

    // Verify UID matches current user
    let current_uid = unsafe { libc::getuid() };
    if creds.uid != current_uid {
        return Err(PeerVerifyError::UidMismatch {
            peer: creds.uid,
            current: current_uid,
        });
    }

    Ok(PeerCred {
        uid: creds.uid,
        pid: Some(creds.pid),
    })
}

/// Verify a connecting peer on macOS using getpeereid.
#[cfg(target_os = "macos")]
pub fn verify_peer<S: AsRawFd>(socket: &S) -> Result<PeerCred, PeerVerifyError> {
    let fd = socket.as_raw_fd();

    let uid = unsafe {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        if libc::getpeereid(fd, &mut uid, &mut gid) != 0 {
            return Err(PeerVerifyError::CredentialsFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        uid
    };

    let current_uid = unsafe { libc::getuid() };
    if uid != current_uid {
        return Err(PeerVerifyError::UidMismatch {
            peer: uid,
            current: current_uid,
        });
    }

    // macOS has no portable way to read the peer pid from the socket here.
    Ok(PeerCred { uid, pid: None })
}
