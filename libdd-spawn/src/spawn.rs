// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{access, geteuid, getuid, AccessFlags, Pid};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::exec::{exec_child, terminate, ChildFds, ExecImage, PreExec};
use crate::hooks::Hooks;
use crate::ledger::{classify, ReapLedger};
use crate::pipe::{make_pipe, make_pipe_with_stream, make_socketpair, Direction};
use crate::process::{ParentEnd, Process, StdStream};
use crate::stream::Stream;

/// What a child gets on one of its standard streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// `/dev/null`.
    #[default]
    Null,
    /// Whatever the parent has on the same slot.
    Inherit,
    /// A pipe whose other end stays with the [`Process`].
    Pipe,
}

enum Fork {
    Parent(Pid),
    Child,
}

/// Forks, bracketed by the syscall clamp.
///
/// In the child the purge hook runs first, before the post-syscall hook.
///
/// # Safety
///
/// The child of a multithreaded parent must not allocate or take locks until it execs or exits.
unsafe fn fork() -> Result<Fork> {
    let hooks = Hooks::current();
    if let Some(pre) = hooks.pre_syscall {
        pre();
    }
    let res = libc::fork();
    let errno = Errno::last();
    if res == 0 {
        hooks.purge_in_child();
    }
    if let Some(post) = hooks.post_syscall {
        post();
    }
    match res {
        -1 => {
            error!("error forking process: {errno}");
            Err(Error::sys("fork", errno))
        }
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(Pid::from_raw(pid))),
    }
}

fn check_executable(program: &Path) -> Result<()> {
    access(program, AccessFlags::X_OK).map_err(|e| {
        error!(
            "error running '{}': probably not installed: {e}",
            program.display()
        );
        Error::Configuration {
            program: program.display().to_string(),
        }
    })
}

/// Spawns `program` on the given descriptors, `None` meaning `/dev/null`. The descriptors may
/// be the parent's own standard ones in any arrangement, e.g. stdout and stderr swapped.
///
/// Fails with [`Error::Configuration`] without forking if `program` is not executable. The child
/// must be reaped with [`ReapLedger::wait_process`] (or [`ReapLedger::wait_status`]).
pub fn spawn_fd<P, I, S>(
    program: P,
    args: I,
    stdin: Option<BorrowedFd<'_>>,
    stdout: Option<BorrowedFd<'_>>,
    stderr: Option<BorrowedFd<'_>>,
) -> Result<Pid>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    check_executable(program)?;

    let image = ExecImage::new(program, args)?;
    let raw = |fd: Option<BorrowedFd<'_>>| fd.map(|fd| fd.as_raw_fd());
    let mut fds = ChildFds::new(raw(stdin), raw(stdout), raw(stderr));

    // Safety: the child only execs the prepared image or exits
    match unsafe { fork()? } {
        Fork::Child => exec_child(&image, &mut fds, None),
        Fork::Parent(pid) => {
            debug!(program = %program.display(), %pid, "spawned process");
            Ok(pid)
        }
    }
}

/// Starts `program` detached from this process, see [`SpawnCfg::detached`].
pub fn spawn_detached<P, I, S, E, V>(program: P, args: I, env: E) -> Result<Process>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    E: IntoIterator<Item = V>,
    V: Into<OsString>,
{
    let mut cfg = SpawnCfg::new(program.as_ref());
    cfg.args(args).env(env).detached(true);
    cfg.spawn()
}

/// One standard stream of the child as prepared before forking.
#[derive(Default)]
struct Prepared {
    child: Option<OwnedFd>,
    parent: Option<ParentEnd>,
    inherit: bool,
}

/// Builder for spawning a child process.
///
/// ```no_run
/// use libdd_spawn::{SpawnCfg, StdStream, Stdio};
/// use std::io::Read;
///
/// let mut process = SpawnCfg::new("/bin/echo")
///     .args(["hello"])
///     .stdout(Stdio::Pipe)
///     .spawn()?;
/// let mut out = String::new();
/// process.take_stream(StdStream::Stdout, false)?.read_to_string(&mut out)?;
/// process.wait(true)?;
/// process.check()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SpawnCfg {
    program: PathBuf,
    args: Vec<OsString>,
    stdio: [Stdio; 3],
    socketpair: bool,
    detached: bool,
    streams: Option<bool>,
    keep_fds: Vec<RawFd>,
    env: Vec<OsString>,
    pre_exec: Option<Box<dyn PreExec>>,
}

impl std::fmt::Debug for SpawnCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnCfg")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdio", &self.stdio)
            .field("socketpair", &self.socketpair)
            .field("detached", &self.detached)
            .field("streams", &self.streams)
            .field("keep_fds", &self.keep_fds)
            .field("env", &self.env)
            .field("pre_exec", &self.pre_exec.is_some())
            .finish()
    }
}

impl SpawnCfg {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            stdio: [Stdio::Null; 3],
            socketpair: false,
            detached: false,
            streams: None,
            keep_fds: Vec::new(),
            env: Vec::new(),
            pre_exec: None,
        }
    }

    /// Arguments, without argv[0].
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn stdin(&mut self, stdio: Stdio) -> &mut Self {
        self.stdio[StdStream::Stdin.slot()] = stdio;
        self
    }

    pub fn stdout(&mut self, stdio: Stdio) -> &mut Self {
        self.stdio[StdStream::Stdout.slot()] = stdio;
        self
    }

    pub fn stderr(&mut self, stdio: Stdio) -> &mut Self {
        self.stdio[StdStream::Stderr.slot()] = stdio;
        self
    }

    /// Connects the child's stdin and stdout to one end of a socket pair instead of two pipes.
    ///
    /// The parent writes to the stdin end and reads from the stdout end, both backed by the
    /// other socket. Overrides [`SpawnCfg::stdin`] and [`SpawnCfg::stdout`].
    pub fn stdin_stdout_socketpair(&mut self, socketpair: bool) -> &mut Self {
        self.socketpair = socketpair;
        self
    }

    /// Double forks the program into its own session, working directory `/`, all streams on
    /// `/dev/null`.
    ///
    /// The program path must be absolute, no stream may be configured, and real and effective
    /// uid must match. Only the intermediate child is waited for: failures of the program
    /// itself are not observable.
    pub fn detached(&mut self, detached: bool) -> &mut Self {
        self.detached = detached;
        self
    }

    /// Keeps the parent ends of pipes as buffered [`Stream`]s rather than raw descriptors.
    pub fn streams(&mut self, nonblocking: bool) -> &mut Self {
        self.streams = Some(nonblocking);
        self
    }

    /// Descriptors passed to the child under their current number.
    pub fn keep_fds<I: IntoIterator<Item = RawFd>>(&mut self, fds: I) -> &mut Self {
        self.keep_fds.extend(fds);
        self
    }

    /// Environment changes for the child: `NAME=VALUE` sets, a bare `NAME` removes.
    pub fn env<I, V>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<OsString>,
    {
        self.env.extend(entries.into_iter().map(Into::into));
        self
    }

    /// Customization run in the child after fork, right before its descriptors are set up.
    pub fn pre_exec<F: PreExec + 'static>(&mut self, pre_exec: F) -> &mut Self {
        self.pre_exec = Some(Box::new(pre_exec));
        self
    }

    fn image(&self) -> Result<ExecImage> {
        let image = ExecImage::new(&self.program, &self.args)?;
        if self.env.is_empty() {
            Ok(image)
        } else {
            image.amend_env(&self.env)
        }
    }

    fn child_fds(&self, prepared: &[Prepared; 3]) -> ChildFds {
        let mut fds = ChildFds::new(
            prepared[0].child.as_ref().map(AsRawFd::as_raw_fd),
            prepared[1].child.as_ref().map(AsRawFd::as_raw_fd),
            prepared[2].child.as_ref().map(AsRawFd::as_raw_fd),
        );
        for stream in StdStream::ALL {
            if prepared[stream.slot()].inherit {
                fds.inherit(stream);
            }
        }
        fds.keep_all_open(&self.keep_fds);
        fds
    }

    fn parent_end(&self, fd: OwnedFd, stream: StdStream) -> Result<ParentEnd> {
        match self.streams {
            None => Ok(ParentEnd::Fd(fd)),
            Some(nonblocking) => Stream::from_fd(fd, stream.parent_mode(), nonblocking)
                .map(ParentEnd::Stream)
                .map_err(|e| {
                    error!("error creating a stream for a socket: {e}");
                    Error::from_io("fdopen", e)
                }),
        }
    }

    /// Creates the pipes for the configured streams. Everything created so far is closed again
    /// when one of them fails.
    fn prepare_stdio(&self) -> Result<[Prepared; 3]> {
        let mut prepared: [Prepared; 3] = Default::default();

        if self.socketpair {
            let (parent, child) = make_socketpair()?;
            let reader = parent
                .try_clone()
                .map_err(|e| Error::from_io("dup", e))?;
            prepared[0].parent = Some(self.parent_end(parent, StdStream::Stdin)?);
            prepared[1].parent = Some(self.parent_end(reader, StdStream::Stdout)?);
            prepared[1].child = Some(child.try_clone().map_err(|e| Error::from_io("dup", e))?);
            prepared[0].child = Some(child);
        }

        for stream in StdStream::ALL {
            let slot = &mut prepared[stream.slot()];
            if self.socketpair && stream != StdStream::Stderr {
                continue;
            }
            match self.stdio[stream.slot()] {
                Stdio::Null => {}
                Stdio::Inherit => slot.inherit = true,
                Stdio::Pipe => {
                    let direction = match stream {
                        StdStream::Stdin => Direction::Outbound,
                        StdStream::Stdout | StdStream::Stderr => Direction::Inbound,
                    };
                    let (child, parent) = match self.streams {
                        Some(nonblocking) => {
                            let (child, parent) = make_pipe_with_stream(direction, nonblocking)?;
                            (child, ParentEnd::Stream(parent))
                        }
                        None => {
                            let pipe = make_pipe().inspect_err(|e| {
                                error!("error creating a pipe: {e}");
                            })?;
                            match direction {
                                Direction::Outbound => (pipe.read, ParentEnd::Fd(pipe.write)),
                                Direction::Inbound => (pipe.write, ParentEnd::Fd(pipe.read)),
                            }
                        }
                    };
                    slot.child = Some(child);
                    slot.parent = Some(parent);
                }
            }
        }
        Ok(prepared)
    }

    /// Spawns the configured program.
    pub fn spawn(&mut self) -> Result<Process> {
        if self.detached {
            return self.spawn_detached();
        }

        let image = self.image()?;
        let prepared = self.prepare_stdio()?;
        let mut fds = self.child_fds(&prepared);
        let program = self.program.display().to_string();

        // Safety: the child only execs the prepared image or exits
        match unsafe { fork()? } {
            Fork::Child => {
                let pre_exec = self.pre_exec.as_mut().map(|p| &mut **p as &mut dyn PreExec);
                // parent ends are closed by exec_child together with everything else
                exec_child(&image, &mut fds, pre_exec)
            }
            Fork::Parent(pid) => {
                debug!(program = %program, %pid, "spawned process");
                let [stdin, stdout, stderr] = prepared.map(|p| p.parent);
                Ok(Process::running(program, pid, stdin, stdout, stderr))
            }
        }
    }

    /// Spawns the program, waits for it and reports how it ended.
    ///
    /// Piped streams nobody reads from are closed only once the process terminated, so a child
    /// filling a pipe would block forever; leave streams on [`Stdio::Null`] here.
    pub fn spawn_and_wait(&mut self) -> Result<()> {
        let mut process = self.spawn()?;
        process.wait(true)?;
        process.check()
    }

    fn spawn_detached(&mut self) -> Result<Process> {
        if self.stdio.iter().any(|s| *s != Stdio::Null) || self.socketpair || self.streams.is_some()
        {
            return Err(Error::InvalidFlag(
                "standard streams can't be configured for a detached process",
            ));
        }
        if !self.program.is_absolute() {
            return Err(Error::InvalidValue(
                "a detached program needs an absolute path",
            ));
        }
        if getuid() != geteuid() {
            error!("refusing to spawn a detached process from a setuid program");
            return Err(Error::NotPermitted);
        }
        check_executable(&self.program)?;

        let image = self.image()?;
        let mut fds = ChildFds::new(None, None, None);
        fds.keep_all_open(&self.keep_fds);
        let program = self.program.display().to_string();

        // Safety: both children only call async-signal-safe functions until exec
        match unsafe { fork()? } {
            Fork::Child => {
                // Safety: no preconditions, the path is a valid C string
                unsafe {
                    if libc::setsid() == -1 || libc::chdir(c"/".as_ptr()) == -1 {
                        terminate();
                    }
                    match libc::fork() {
                        -1 => terminate(),
                        0 => {}
                        _ => libc::_exit(0),
                    }
                }
                let pre_exec = self.pre_exec.as_mut().map(|p| &mut **p as &mut dyn PreExec);
                exec_child(&image, &mut fds, pre_exec)
            }
            Fork::Parent(pid) => {
                debug!(program = %program, %pid, "detaching process");
                match ReapLedger::global().wait_status(pid, true)? {
                    Some(status) => classify(&program, status)?,
                    None => return Err(Error::StillRunning),
                }
                Ok(Process::detached(program))
            }
        }
    }
}
