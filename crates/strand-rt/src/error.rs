// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime and configuration errors.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Failure surfaced by scheduler, reactor, or hook setup.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Creating an OS resource (epoll, pipe, thread) failed.
    #[error("runtime setup failed: {0}")]
    Io(#[from] io::Error),

    /// The kernel rejected an interest registration.
    #[error("epoll_ctl({op}) failed for fd {fd}: {source}")]
    Register {
        fd: RawFd,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The I/O backend was already chosen for this process.
    #[error("syscall backend already installed")]
    SyscallsInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl RuntimeError {
    /// Convert into an `io::Error` for callers on the hooked I/O path.
    pub fn into_io(self) -> io::Error {
        match self {
            RuntimeError::Io(err) => err,
            RuntimeError::Register { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_error_keeps_os_code() {
        let err = RuntimeError::Register {
            fd: 7,
            op: "add",
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert!(err.to_string().contains("fd 7"));
        assert_eq!(err.into_io().raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn config_error_wraps_into_runtime_error() {
        let err: RuntimeError = ConfigError::Invalid {
            key: "reactor.max_poll_ms",
            reason: "must be positive".to_string(),
        }
        .into();
        assert!(err.to_string().contains("reactor.max_poll_ms"));
    }
}
