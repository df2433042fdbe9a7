// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hooks;
use crate::ledger::{classify, ReapLedger};
use crate::stream::{Stream, StreamMode};

/// One of the three standard streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub const ALL: [StdStream; 3] = [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr];

    /// The descriptor number the stream has in the child.
    pub fn slot(self) -> usize {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }

    /// How the parent uses its end of the stream.
    pub fn parent_mode(self) -> StreamMode {
        match self {
            StdStream::Stdin => StreamMode::Write,
            StdStream::Stdout | StdStream::Stderr => StreamMode::Read,
        }
    }
}

/// The status word reported by `waitpid`, as is.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitStatusRaw(libc::c_int);

impl WaitStatusRaw {
    pub fn from_raw(status: libc::c_int) -> Self {
        Self(status)
    }

    pub fn as_raw(self) -> libc::c_int {
        self.0
    }

    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    /// Exit code, when the process exited normally.
    pub fn exit_code(self) -> Option<i32> {
        self.exited().then(|| libc::WEXITSTATUS(self.0))
    }

    /// Terminating signal number, when the process was killed by a signal.
    pub fn term_signal(self) -> Option<i32> {
        self.signaled().then(|| libc::WTERMSIG(self.0))
    }

    pub fn decompose(self) -> ExitStatus {
        ExitStatus {
            exited: self.exited(),
            signaled: self.signaled(),
            exit_code: self.exit_code().unwrap_or(0),
            signal: self.term_signal().unwrap_or(0),
        }
    }
}

impl fmt::Debug for WaitStatusRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_code() {
            write!(f, "Exited({code})")
        } else if let Some(sig) = self.term_signal() {
            write!(f, "Signaled({sig})")
        } else {
            write!(f, "WaitStatusRaw({:#x})", self.0)
        }
    }
}

/// Decomposed termination status. Fields that don't apply are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exited: bool,
    pub signaled: bool,
    pub exit_code: i32,
    pub signal: i32,
}

/// Control requests understood by [`Process::ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Nop,
    /// The process id as a plain integer.
    GetId,
    /// The exit code, `None` if the process didn't exit normally.
    GetExitCode,
    GetPid,
    GetWaitStatus,
    /// Sends the signal; `None` only checks that the process exists.
    Kill(Option<Signal>),
}

impl Request {
    pub const NOP: u32 = 0;
    pub const GET_ID: u32 = 1;
    pub const GET_EXIT_ID: u32 = 2;
    pub const GET_PID: u32 = 3;
    pub const GET_WSTATUS: u32 = 4;
    pub const KILL: u32 = 5;

    /// Decodes a request given as a numeric tag plus argument (the signal number for `KILL`,
    /// ignored otherwise). Signal 0 decodes to `Kill(None)`.
    pub fn from_raw(tag: u32, arg: i32) -> Result<Self> {
        Ok(match tag {
            Self::NOP => Request::Nop,
            Self::GET_ID => Request::GetId,
            Self::GET_EXIT_ID => Request::GetExitCode,
            Self::GET_PID => Request::GetPid,
            Self::GET_WSTATUS => Request::GetWaitStatus,
            Self::KILL if arg == 0 => Request::Kill(None),
            Self::KILL => Request::Kill(Some(
                Signal::try_from(arg).map_err(|_| Error::InvalidValue("signal number"))?,
            )),
            other => return Err(Error::UnknownRequest(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Done,
    Id(i32),
    ExitCode(Option<i32>),
    Pid(Pid),
    WaitStatus(ExitStatus),
}

#[derive(Debug)]
enum Slot {
    NotPiped,
    Fd(OwnedFd),
    Stream(Stream),
    Taken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Terminated(WaitStatusRaw),
    /// Handed over to init, nothing to wait for.
    Detached,
}

/// A spawned child process.
///
/// Dropping (or [`Process::release`]-ing) a handle whose process still runs sends it SIGTERM and
/// waits for it, so no zombie outlives the handle. Call [`Process::wait`] first if the process
/// should be allowed to finish on its own.
#[derive(Debug)]
pub struct Process {
    program: String,
    pid: Option<Pid>,
    stdio: [Slot; 3],
    state: State,
    ledger: &'static ReapLedger,
}

impl Process {
    pub(crate) fn running(
        program: String,
        pid: Pid,
        stdin: Option<ParentEnd>,
        stdout: Option<ParentEnd>,
        stderr: Option<ParentEnd>,
    ) -> Self {
        let slot = |end: Option<ParentEnd>| match end {
            None => Slot::NotPiped,
            Some(ParentEnd::Fd(fd)) => Slot::Fd(fd),
            Some(ParentEnd::Stream(stream)) => Slot::Stream(stream),
        };
        Self {
            program,
            pid: Some(pid),
            stdio: [slot(stdin), slot(stdout), slot(stderr)],
            state: State::Running,
            ledger: ReapLedger::global(),
        }
    }

    pub(crate) fn detached(program: String) -> Self {
        Self {
            program,
            pid: None,
            stdio: [Slot::NotPiped, Slot::NotPiped, Slot::NotPiped],
            state: State::Detached,
            ledger: ReapLedger::global(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Process id; detached processes don't have one.
    pub fn pid(&self) -> Result<Pid> {
        self.pid.ok_or(Error::InvalidValue("detached process has no pid"))
    }

    pub fn is_detached(&self) -> bool {
        self.state == State::Detached
    }

    /// True until a wait observed the termination.
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    fn take_slot(&mut self, stream: StdStream) -> Result<Slot> {
        let slot = &mut self.stdio[stream.slot()];
        match slot {
            Slot::NotPiped => Err(Error::NotPiped(stream)),
            Slot::Taken => Err(Error::AlreadyTaken(stream)),
            _ => Ok(std::mem::replace(slot, Slot::Taken)),
        }
    }

    /// Hands the parent end of `stream` over to the caller.
    pub fn take_fd(&mut self, stream: StdStream) -> Result<OwnedFd> {
        match self.take_slot(stream)? {
            Slot::Fd(fd) => Ok(fd),
            Slot::Stream(s) => s.into_fd().map_err(|e| Error::from_io("flush", e)),
            Slot::NotPiped | Slot::Taken => Err(Error::AlreadyTaken(stream)),
        }
    }

    /// Hands the parent end of `stream` over to the caller, wrapped in a buffered stream.
    pub fn take_stream(&mut self, stream: StdStream, nonblocking: bool) -> Result<Stream> {
        match self.take_slot(stream)? {
            Slot::Fd(fd) => Stream::from_fd(fd, stream.parent_mode(), nonblocking)
                .map_err(|e| Error::from_io("fdopen", e)),
            Slot::Stream(mut s) => {
                if s.is_nonblocking() != nonblocking {
                    s.set_nonblocking(nonblocking)
                        .map_err(|e| Error::from_io("fcntl", e))?;
                }
                Ok(s)
            }
            Slot::NotPiped | Slot::Taken => Err(Error::AlreadyTaken(stream)),
        }
    }

    /// Takes every parent end still held, as `[stdin, stdout, stderr]`.
    pub fn take_fds(&mut self) -> Result<[Option<OwnedFd>; 3]> {
        let mut fds: [Option<OwnedFd>; 3] = Default::default();
        for stream in StdStream::ALL {
            fds[stream.slot()] = match self.take_fd(stream) {
                Ok(fd) => Some(fd),
                Err(Error::NotPiped(_) | Error::AlreadyTaken(_)) => None,
                Err(e) => return Err(e),
            };
        }
        Ok(fds)
    }

    /// Like [`Process::take_fds`], wrapping each end in a [`Stream`].
    pub fn take_streams(&mut self, nonblocking: bool) -> Result<[Option<Stream>; 3]> {
        let mut streams: [Option<Stream>; 3] = Default::default();
        for stream in StdStream::ALL {
            streams[stream.slot()] = match self.take_stream(stream, nonblocking) {
                Ok(s) => Some(s),
                Err(Error::NotPiped(_) | Error::AlreadyTaken(_)) => None,
                Err(e) => return Err(e),
            };
        }
        Ok(streams)
    }

    /// Raw status of the terminated process.
    pub fn wait_status(&self) -> Result<WaitStatusRaw> {
        match self.state {
            State::Terminated(status) => Ok(status),
            State::Running => Err(Error::Unfinished),
            State::Detached => Err(Error::InvalidValue("detached process has no status")),
        }
    }

    pub fn exit_status(&self) -> Result<ExitStatus> {
        self.wait_status().map(WaitStatusRaw::decompose)
    }

    /// Classifies the termination like the waiting functions of the ledger do: not launched,
    /// failed, or success.
    pub fn check(&self) -> Result<()> {
        match self.state {
            State::Terminated(status) => classify(&self.program, status),
            State::Running => Err(Error::Unfinished),
            State::Detached => Ok(()),
        }
    }

    /// Sends `signal`, or with `None` only checks that the process exists. Does not reap the
    /// process.
    ///
    /// Once a wait observed the termination this is a no-op: the pid may already belong to
    /// another process.
    pub fn kill<T: Into<Option<Signal>>>(&self, signal: T) -> Result<()> {
        let pid = match self.state {
            State::Running => self.pid()?,
            State::Terminated(_) => return Ok(()),
            State::Detached => return Err(Error::InvalidValue("detached process has no pid")),
        };
        let signal = signal.into();
        hooks::blocking(|| kill(pid, signal)).map_err(|e| Error::sys("kill", e))
    }

    /// Asks the process to terminate (SIGTERM). Does not reap the process.
    pub fn terminate(&self) -> Result<()> {
        self.kill(Signal::SIGTERM)
    }

    /// Waits for termination, blocking if `hang`.
    ///
    /// Returns [`Error::StillRunning`] when not blocking and the process is alive. Once the
    /// termination has been observed the status is cached and later calls return immediately.
    pub fn wait(&mut self, hang: bool) -> Result<()> {
        let pid = match self.state {
            State::Running => self.pid()?,
            State::Terminated(_) | State::Detached => return Ok(()),
        };
        match self.ledger.wait_status(pid, hang)? {
            Some(status) => {
                debug!(program = %self.program, %pid, ?status, "process terminated");
                self.state = State::Terminated(status);
                Ok(())
            }
            None => Err(Error::StillRunning),
        }
    }

    /// Control surface keyed by [`Request`].
    pub fn ctl(&self, request: Request) -> Result<Response> {
        match request {
            Request::Nop => Ok(Response::Done),
            Request::GetId => Ok(Response::Id(self.pid()?.as_raw())),
            Request::GetPid => Ok(Response::Pid(self.pid()?)),
            Request::GetExitCode => Ok(Response::ExitCode(self.wait_status()?.exit_code())),
            Request::GetWaitStatus => Ok(Response::WaitStatus(self.exit_status()?)),
            Request::Kill(signal) => self.kill(signal).map(|_| Response::Done),
        }
    }

    /// Releases the handle. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for Process {
    fn drop(&mut self) {
        // a set wait elsewhere may have reaped it already, its status is parked in the ledger
        match self.wait(false) {
            Err(Error::StillRunning) => {}
            Ok(()) => return,
            Err(e) => {
                warn!(program = %self.program, "failed to reap process: {e}");
                return;
            }
        }
        match self.terminate() {
            Ok(()) | Err(Error::Sys {
                source: Errno::ESRCH,
                ..
            }) => {}
            Err(e) => warn!(program = %self.program, "failed to terminate process: {e}"),
        }
        if let Err(e) = self.wait(true) {
            warn!(program = %self.program, "failed to reap process: {e}");
        }
    }
}

/// Waits for every handle that has not terminated yet, in order, stopping at the first error.
pub fn wait_all(processes: &mut [Process], hang: bool) -> Result<()> {
    for process in processes.iter_mut().filter(|p| p.is_running()) {
        process.wait(hang)?;
    }
    Ok(())
}

/// What the parent keeps of a piped standard stream.
#[derive(Debug)]
pub(crate) enum ParentEnd {
    Fd(OwnedFd),
    Stream(Stream),
}
