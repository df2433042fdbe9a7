// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::error;

use crate::error::{Error, Result};
use crate::hooks;
use crate::stream::{Stream, StreamMode};

/// Both ends of an anonymous pipe.
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Which way data flows, seen from the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The parent reads what the child writes (stdout, stderr).
    Inbound,
    /// The parent writes what the child reads (stdin).
    Outbound,
}

pub fn make_pipe() -> Result<Pipe> {
    let mut fds: [RawFd; 2] = [-1, -1];
    // SAFETY: fds is valid for two descriptors
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(Error::last_os("pipe"));
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok(Pipe { read, write })
}

/// Creates a pipe and wraps the end kept by the parent in a [`Stream`].
///
/// Returns the raw end meant for the child together with the stream. Both ends are closed on
/// failure.
pub fn make_pipe_with_stream(direction: Direction, nonblocking: bool) -> Result<(OwnedFd, Stream)> {
    let pipe = make_pipe().inspect_err(|e| error!("error creating a pipe: {e}"))?;

    let (child_end, parent_end, mode) = match direction {
        Direction::Inbound => (pipe.write, pipe.read, StreamMode::Read),
        Direction::Outbound => (pipe.read, pipe.write, StreamMode::Write),
    };

    match Stream::from_fd(parent_end, mode, nonblocking) {
        Ok(stream) => Ok((child_end, stream)),
        Err(e) => {
            error!("error creating a stream for a pipe: {e}");
            Err(Error::from_io("fdopen", e))
        }
    }
}

/// Local stream socket pair, for a child using one connection as both stdin and stdout.
pub fn make_socketpair() -> Result<(OwnedFd, OwnedFd)> {
    hooks::blocking(|| {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
    })
    .map_err(|e| Error::sys("socketpair", e))
}

/// Closes a pipe end given as a raw descriptor; `-1` is ignored.
///
/// # Safety
///
/// `fd` must be owned by the caller and not used afterwards.
pub unsafe fn close_pipe_end(fd: RawFd) {
    if fd != -1 {
        drop(OwnedFd::from_raw_fd(fd));
    }
}
