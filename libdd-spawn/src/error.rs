// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::process::StdStream;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse grained classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Out of descriptors, processes or memory.
    ResourceExhausted,
    /// Any other failing system call.
    System,
    /// The program is not executable or could not be launched.
    Configuration,
    /// The program ran and failed (non-zero exit code or killed by a signal).
    General,
    /// The process has not terminated yet. Retryable.
    Timeout,
    InvalidValue,
    Unfinished,
    InvalidFlag,
    UnknownRequest,
    NotPermitted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("error running '{program}': probably not installed")]
    Configuration { program: String },
    #[error("error running '{program}': {}", describe_failure(*exit_code))]
    General {
        program: String,
        exit_code: Option<i32>,
    },
    #[error("PID {pid} was reused")]
    PidReused { pid: Pid },
    #[error("process is still running")]
    StillRunning,
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("process has not terminated yet")]
    Unfinished,
    #[error("invalid flag combination: {0}")]
    InvalidFlag(&'static str),
    #[error("unknown control request {0}")]
    UnknownRequest(u32),
    #[error("{0:?} was already handed off")]
    AlreadyTaken(StdStream),
    #[error("{0:?} is not connected to a pipe")]
    NotPiped(StdStream),
    #[error("refusing to spawn a detached process with differing real and effective uid")]
    NotPermitted,
    #[error("failed to prepare exec arguments: {0}")]
    Prepare(#[from] std::ffi::NulError),
}

fn describe_failure(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit status {code}"),
        None => "terminated".to_string(),
    }
}

impl Error {
    pub(crate) fn sys(op: &'static str, source: Errno) -> Self {
        Error::Sys { op, source }
    }

    /// Maps an I/O failure of `op` back to the errno it carries.
    pub(crate) fn from_io(op: &'static str, err: std::io::Error) -> Self {
        let errno = err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
        Error::sys(op, errno)
    }

    /// Captures the current `errno` for a failed `op`.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::sys(op, Errno::last())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sys { source, .. } => match source {
                Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM | Errno::EAGAIN => {
                    ErrorKind::ResourceExhausted
                }
                _ => ErrorKind::System,
            },
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::General { .. } | Error::PidReused { .. } => ErrorKind::General,
            Error::StillRunning => ErrorKind::Timeout,
            Error::InvalidValue(_)
            | Error::AlreadyTaken(_)
            | Error::NotPiped(_)
            | Error::Prepare(_) => ErrorKind::InvalidValue,
            Error::Unfinished => ErrorKind::Unfinished,
            Error::InvalidFlag(_) => ErrorKind::InvalidFlag,
            Error::UnknownRequest(_) => ErrorKind::UnknownRequest,
            Error::NotPermitted => ErrorKind::NotPermitted,
        }
    }

    /// Only "still running" is worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StillRunning)
    }

    /// Exit code carried by a [`Error::General`] failure, if the program exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::General { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Sys { source, .. } => std::io::Error::from(source),
            other => std::io::Error::other(other),
        }
    }
}
