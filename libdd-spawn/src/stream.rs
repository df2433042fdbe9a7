// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered stream wrapper for the parent side of a pipe.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Read,
    Write,
}

#[derive(Debug)]
enum Inner {
    Read(BufReader<File>),
    Write(BufWriter<File>),
}

/// A buffered, one directional stream over an owned descriptor.
///
/// In non-blocking mode reads and writes that can't make progress fail with
/// [`io::ErrorKind::WouldBlock`].
#[derive(Debug)]
pub struct Stream {
    inner: Inner,
    nonblocking: bool,
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let wanted = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    if wanted != flags {
        fcntl(fd, FcntlArg::F_SETFL(wanted))?;
    }
    Ok(())
}

impl Stream {
    /// Opens a stream over `fd`, switching the descriptor to the requested blocking mode.
    ///
    /// The descriptor is closed if that fails.
    pub fn from_fd(fd: OwnedFd, mode: StreamMode, nonblocking: bool) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd(), nonblocking)?;
        let file = File::from(fd);
        let inner = match mode {
            StreamMode::Read => Inner::Read(BufReader::new(file)),
            StreamMode::Write => Inner::Write(BufWriter::new(file)),
        };
        Ok(Self { inner, nonblocking })
    }

    pub fn mode(&self) -> StreamMode {
        match self.inner {
            Inner::Read(_) => StreamMode::Read,
            Inner::Write(_) => StreamMode::Write,
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Switches the underlying descriptor to blocking or non-blocking mode.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking(self.as_raw_fd(), nonblocking)?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Flushes pending output and closes the descriptor.
    pub fn close(self) -> io::Result<()> {
        self.into_fd().map(drop)
    }

    /// Flushes pending output and gives the descriptor back.
    ///
    /// Input already buffered by a read stream is discarded.
    pub fn into_fd(self) -> io::Result<OwnedFd> {
        let file = match self.inner {
            Inner::Read(reader) => reader.into_inner(),
            Inner::Write(writer) => writer.into_inner().map_err(|e| e.into_error())?,
        };
        Ok(file.into())
    }

    fn file(&self) -> &File {
        match &self.inner {
            Inner::Read(reader) => reader.get_ref(),
            Inner::Write(writer) => writer.get_ref(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Read(reader) => reader.read(buf),
            Inner::Write(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream was opened for writing",
            )),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Write(writer) => writer.write(buf),
            Inner::Read(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream was opened for reading",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Write(writer) => writer.flush(),
            Inner::Read(_) => Ok(()),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file().as_fd()
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.file().as_raw_fd()
    }
}
