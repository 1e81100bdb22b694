use thiserror::Error;

pub type CfsResult<T> = Result<T, CfsError>;

/// Error kinds surfaced by the cloakfs core.
///
/// The filesystem bridge maps these to host error codes via [`CfsError::errno`].
#[derive(Debug, Error)]
pub enum CfsError {
    /// The AEAD rejected a ciphertext block. Never retried; surfaced to the
    /// user as a generic I/O error except during config load.
    #[error("ciphertext authentication failed")]
    AuthFailure,

    /// Operation on a released handle, or a read on a write-only handle.
    #[error("bad file handle")]
    BadHandle,

    /// Malformed header, malformed config, unknown version or feature flag.
    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    /// Operation the core deliberately refuses.
    #[error("operation not supported")]
    NotSupported,

    /// Underlying syscall failure, propagated verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config-load-specific synonym of `AuthFailure`: the master key did not
    /// unwrap. Deliberately indistinguishable from config corruption.
    #[error("password incorrect")]
    PasswordIncorrect,
}

impl CfsError {
    /// Host error code for this error kind.
    pub fn errno(&self) -> i32 {
        match self {
            CfsError::AuthFailure | CfsError::Corrupt(_) => libc::EIO,
            CfsError::BadHandle => libc::EBADF,
            CfsError::NotSupported => libc::ENOSYS,
            CfsError::PasswordIncorrect => libc::EACCES,
            CfsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        CfsError::Corrupt(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(CfsError::AuthFailure.errno(), libc::EIO);
        assert_eq!(CfsError::BadHandle.errno(), libc::EBADF);
        assert_eq!(CfsError::NotSupported.errno(), libc::ENOSYS);

        let io = CfsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(io.errno(), libc::ENOSPC);
    }
}
