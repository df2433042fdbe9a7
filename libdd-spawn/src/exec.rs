// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The part of a spawn that runs in the child, between `fork` and `exec`.

use std::ffi::{CStr, CString, OsStr};
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;

use libc::{_exit, EXIT_FAILURE};
use nix::errno::Errno;

use crate::error::Result;
use crate::fd::close_all_from;
use crate::process::StdStream;

/// Exit code of a child whose `exec` failed.
///
/// Waiters report it as a configuration error ("probably not installed"), which means a program
/// that really exits with 127 can't be told apart from one that was never launched.
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

const DEV_NULL: &CStr = c"/dev/null";

/// Extra room in the exception list, so customization in the child rarely needs to allocate.
const EXCEPT_SPARE_CAPACITY: usize = 8;

/// Kills the child without running at_exit handlers or unwinding.
pub(crate) fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { _exit(EXIT_FAILURE) }
}

/// Program path, argument vector and optionally environment, laid out for `exec` before forking.
// The args and env fields are just storage for the pointers in argv_ptrs and envp_ptrs.
#[derive(Debug)]
pub struct ExecImage {
    path: CString,
    args: Vec<CString>,
    // Always NULL ptr terminated
    argv_ptrs: Vec<*const libc::c_char>,
    env: Vec<CString>,
    // NULL ptr terminated, empty when the environment is inherited as is
    envp_ptrs: Vec<*const libc::c_char>,
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Name part of a `NAME=VALUE` entry; an entry without `=` is all name.
fn env_name(entry: &[u8]) -> &[u8] {
    match entry.iter().position(|&b| b == b'=') {
        Some(idx) => &entry[..idx],
        None => entry,
    }
}

/// Final path component of `path`, the way it is passed as argv[0].
fn program_name(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

impl ExecImage {
    /// Prepares `path` to be run with `args`. argv[0] is derived from `path`, `args` must not
    /// contain it.
    pub fn new<P, I, S>(path: P, args: I) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let path_bytes = path.as_ref().as_os_str().as_bytes();
        let mut all_args = vec![CString::new(program_name(path_bytes))?];
        for arg in args {
            all_args.push(CString::new(arg.as_ref().as_bytes())?);
        }
        let argv_ptrs = null_terminated(&all_args);

        Ok(Self {
            path: CString::new(path_bytes)?,
            args: all_args,
            argv_ptrs,
            env: Vec::new(),
            envp_ptrs: Vec::new(),
        })
    }

    /// Runs the program with this process' environment amended by `entries`.
    ///
    /// `NAME=VALUE` sets a variable, a bare `NAME` removes it. Later entries win.
    pub fn amend_env<I, S>(mut self, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut env = Vec::new();
        for (key, value) in std::env::vars_os() {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            env.push(entry);
        }
        for entry in entries {
            let entry = entry.as_ref().as_bytes();
            let name = env_name(entry);
            env.retain(|existing| env_name(existing) != name);
            if entry.len() > name.len() {
                env.push(entry.to_vec());
            }
        }

        self.env = env
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()?;
        self.envp_ptrs = null_terminated(&self.env);
        Ok(self)
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }

    /// The full argument vector, argv[0] included.
    pub fn argv(&self) -> impl Iterator<Item = &CStr> {
        self.args.iter().map(CString::as_c_str)
    }

    /// The environment the program gets, `None` if inherited unchanged.
    pub fn env(&self) -> Option<impl Iterator<Item = &CStr>> {
        (!self.envp_ptrs.is_empty()).then(|| self.env.iter().map(CString::as_c_str))
    }

    /// Replaces the current process image. Only returns on failure.
    pub(crate) fn exec(&self) -> Errno {
        // Safety: the pointers reference storage owned by self, and the lists are NULL terminated
        unsafe {
            if self.envp_ptrs.is_empty() {
                libc::execv(self.path.as_ptr(), self.argv_ptrs.as_ptr());
            } else {
                libc::execve(
                    self.path.as_ptr(),
                    self.argv_ptrs.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
            }
        }
        Errno::last()
    }
}

/// The descriptors a child is about to be started with.
///
/// Handed to [`PreExec`] customizations, which can only change what ends up on the three
/// standard slots and which extra descriptors survive the exec.
#[derive(Debug)]
pub struct ChildFds {
    fds: [Option<RawFd>; 3],
    keep: [bool; 3],
    // sorted, no duplicates
    except: Vec<RawFd>,
}

impl ChildFds {
    /// `None` slots get `/dev/null`.
    pub fn new(stdin: Option<RawFd>, stdout: Option<RawFd>, stderr: Option<RawFd>) -> Self {
        Self {
            fds: [stdin, stdout, stderr],
            keep: [false; 3],
            except: Vec::with_capacity(EXCEPT_SPARE_CAPACITY),
        }
    }

    pub fn get(&self, stream: StdStream) -> Option<RawFd> {
        self.fds[stream.slot()]
    }

    /// Puts `fd` on the `stream` slot, `None` for `/dev/null`.
    pub fn set(&mut self, stream: StdStream, fd: Option<RawFd>) {
        self.fds[stream.slot()] = fd;
        self.keep[stream.slot()] = false;
    }

    /// Leaves the slot exactly as inherited from the parent.
    pub fn inherit(&mut self, stream: StdStream) {
        self.keep[stream.slot()] = true;
    }

    pub fn is_inherited(&self, stream: StdStream) -> bool {
        self.keep[stream.slot()]
    }

    /// Keeps `fd` open across the exec.
    pub fn keep_open(&mut self, fd: RawFd) {
        if let Err(idx) = self.except.binary_search(&fd) {
            self.except.insert(idx, fd);
        }
    }

    pub(crate) fn keep_all_open(&mut self, fds: &[RawFd]) {
        self.except.reserve(fds.len());
        for &fd in fds {
            self.keep_open(fd);
        }
    }

    /// Descriptors above stderr that survive the exec, ascending.
    pub fn kept_open(&self) -> &[RawFd] {
        &self.except
    }
}

/// A customization step run in the child right before its descriptors are set up.
///
/// It runs after `fork` in a possibly multithreaded process: it must not take locks, and should
/// not allocate.
pub trait PreExec {
    fn pre_exec(&mut self, fds: &mut ChildFds);
}

impl<F: FnMut(&mut ChildFds)> PreExec for F {
    fn pre_exec(&mut self, fds: &mut ChildFds) {
        self(fds)
    }
}

/// Sets up stdio for `image` and execs it. Never returns.
///
/// Failing to open `/dev/null` or to place a descriptor on a standard slot kills the child with
/// `EXIT_FAILURE`: there is nobody left to report to. A failing exec exits with
/// [`EXEC_FAILED_EXIT_CODE`].
pub(crate) fn exec_child(
    image: &ExecImage,
    fds: &mut ChildFds,
    pre_exec: Option<&mut dyn PreExec>,
) -> ! {
    if let Some(hook) = pre_exec {
        hook.pre_exec(fds);
    }

    for slot in 0..3 {
        if fds.keep[slot] || fds.fds[slot].is_some() {
            continue;
        }
        let flags = if slot == 0 {
            libc::O_RDONLY
        } else {
            libc::O_WRONLY
        };
        // Safety: DEV_NULL is a valid C string
        let null = unsafe { libc::open(DEV_NULL.as_ptr(), flags) };
        if null == -1 {
            terminate();
        }
        fds.fds[slot] = Some(null);
    }

    // A source sitting on another standard slot would be clobbered by an earlier dup2.
    for (slot, fd) in fds.fds.iter_mut().enumerate() {
        match fd {
            Some(src) if !fds.keep[slot] && (0..3).contains(&*src) && *src != slot as RawFd => {
                // Safety: fcntl has no memory safety preconditions
                let moved = unsafe { libc::fcntl(*src, libc::F_DUPFD, 3) };
                if moved == -1 {
                    terminate();
                }
                *src = moved;
            }
            _ => {}
        }
    }

    for (slot, fd) in fds.fds.iter().enumerate() {
        let target = slot as RawFd;
        match fd {
            Some(fd) if !fds.keep[slot] && *fd != target => {
                // Safety: dup2 has no memory safety preconditions
                if unsafe { libc::dup2(*fd, target) } == -1 {
                    terminate();
                }
                // The source descriptor is left to close_all_from, the same one may back
                // several slots.
            }
            _ => {}
        }
    }

    close_all_from(3, Some(&fds.except));

    let _ = image.exec();
    // Nothing can be printed: the standard streams may be redirected or closed.
    unsafe { _exit(EXEC_FAILED_EXIT_CODE) }
}
