// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reaping children without losing statuses to concurrent waiters.
//!
//! Waiting for a set of processes reaps whichever child terminates first, which may belong to
//! somebody else. Those statuses are parked in the ledger until their owner asks for them, so
//! every waiter eventually observes the status of its own child exactly once.

use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::exec::EXEC_FAILED_EXIT_CODE;
use crate::hooks;
use crate::process::WaitStatusRaw;

/// The system side of reaping.
pub trait Reap {
    /// Reaps `pid`, or any child when `None`. Returns `Ok(None)` if `hang` is false and no
    /// matching child has terminated yet.
    fn reap(&self, pid: Option<Pid>, hang: bool) -> Result<Option<(Pid, WaitStatusRaw)>, Errno>;
}

/// [`Reap`] on top of `waitpid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsReaper;

impl Reap for OsReaper {
    fn reap(&self, pid: Option<Pid>, hang: bool) -> Result<Option<(Pid, WaitStatusRaw)>, Errno> {
        let target = pid.map_or(-1, Pid::as_raw);
        let options = if hang { 0 } else { libc::WNOHANG };
        let mut status: libc::c_int = 0;
        loop {
            let (res, errno) = hooks::blocking(|| {
                // Safety: status is a valid out pointer
                let res = unsafe { libc::waitpid(target, &mut status, options) };
                (res, Errno::last())
            });
            match res {
                -1 if errno == Errno::EINTR => continue,
                -1 => return Err(errno),
                0 => return Ok(None),
                pid => return Ok(Some((Pid::from_raw(pid), WaitStatusRaw::from_raw(status)))),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reaped {
    pid: Pid,
    status: WaitStatusRaw,
}

/// How far waiting got for one member of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The pid was not a valid process id.
    Invalid,
    /// Not observed terminating yet.
    Unknown,
    Terminated(WaitStatusRaw),
}

impl Resolution {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Resolution::Terminated(status) => status.exit_code(),
            Resolution::Invalid | Resolution::Unknown => None,
        }
    }
}

/// Result of [`ReapLedger::wait_processes`]: one resolution per requested process plus the
/// aggregated outcome.
#[derive(Debug)]
pub struct WaitSet {
    resolutions: Vec<Resolution>,
    outcome: Result<()>,
}

impl WaitSet {
    /// In the order the processes were given.
    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    pub fn outcome(&self) -> Result<(), &Error> {
        self.outcome.as_ref().map(|_| ())
    }

    pub fn into_parts(self) -> (Vec<Resolution>, Result<()>) {
        (self.resolutions, self.outcome)
    }
}

/// Statuses reaped on behalf of other waiters, plus the reaper used to get them.
#[derive(Debug)]
pub struct ReapLedger<R: Reap = OsReaper> {
    reaper: R,
    pending: Mutex<Vec<Reaped>>,
}

static GLOBAL: ReapLedger = ReapLedger::with_reaper(OsReaper);

impl ReapLedger<OsReaper> {
    /// The ledger shared by every handle of this process.
    pub fn global() -> &'static Self {
        &GLOBAL
    }
}

fn take(pending: &mut Vec<Reaped>, pid: Pid) -> Option<WaitStatusRaw> {
    let idx = pending.iter().position(|entry| entry.pid == pid)?;
    Some(pending.swap_remove(idx).status)
}

impl<R: Reap> ReapLedger<R> {
    pub const fn with_reaper(reaper: R) -> Self {
        Self {
            reaper,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reaped>> {
        // the list is consistent after every single push or removal
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, pid: Pid) -> Option<WaitStatusRaw> {
        take(&mut self.lock(), pid)
    }

    /// Number of statuses waiting for their owner.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Waits for `pid` to terminate and returns its raw status.
    ///
    /// Returns `Ok(None)` when `hang` is false and the process is still running. A status parked
    /// by a set wait is handed out first.
    pub fn wait_status(&self, pid: Pid, hang: bool) -> Result<Option<WaitStatusRaw>> {
        if pid.as_raw() <= 0 {
            return Err(Error::InvalidValue("pid"));
        }
        if let Some(status) = self.claim(pid) {
            return Ok(Some(status));
        }
        match self.reaper.reap(Some(pid), hang) {
            Ok(Some((_, status))) => Ok(Some(status)),
            Ok(None) => Ok(None),
            Err(e) => {
                // a set wait reaped it between our ledger check and the waitpid call
                if e == Errno::ECHILD {
                    if let Some(status) = self.claim(pid) {
                        return Ok(Some(status));
                    }
                }
                error!("waiting for process {pid} to terminate failed: {e}");
                Err(Error::sys("waitpid", e))
            }
        }
    }

    /// Waits for `pid` and classifies how `program` ended.
    pub fn wait_process(&self, program: &str, pid: Pid, hang: bool) -> Result<()> {
        match self.wait_status(pid, hang)? {
            Some(status) => classify(program, status),
            None => Err(Error::StillRunning),
        }
    }

    /// Waits for all of `processes`, given as program name and pid, in whatever order they
    /// terminate.
    ///
    /// Every pass first claims members parked by other waiters, then reaps whatever child has
    /// terminated. Children outside the set are parked for their owners. Without `hang` the call
    /// returns once nothing more can be reaped, leaving the rest [`Resolution::Unknown`]. With
    /// `hang` it sleeps on one unresolved member (without holding the lock) between passes.
    ///
    /// The outcome is the first system failure or pid reuse if any, else the last member that
    /// failed, else [`Error::StillRunning`] if members are left unresolved.
    pub fn wait_processes(&self, processes: &[(&str, Pid)], hang: bool) -> WaitSet {
        let mut resolutions = vec![Resolution::Unknown; processes.len()];
        let mut left = 0usize;
        for (resolution, (_, pid)) in resolutions.iter_mut().zip(processes) {
            if pid.as_raw() <= 0 {
                *resolution = Resolution::Invalid;
            } else {
                left += 1;
            }
        }

        // resolves every unknown member with this pid, returns how many were
        let resolve = |resolutions: &mut [Resolution], pid: Pid, status: WaitStatusRaw| {
            let mut hits = 0;
            for (resolution, (_, member)) in resolutions.iter_mut().zip(processes) {
                if *member == pid && *resolution == Resolution::Unknown {
                    *resolution = Resolution::Terminated(status);
                    hits += 1;
                }
            }
            hits
        };
        let next_unknown = |resolutions: &[Resolution]| {
            resolutions
                .iter()
                .zip(processes)
                .find(|(r, _)| **r == Resolution::Unknown)
                .map(|(_, (_, pid))| *pid)
        };

        let mut failure: Option<Error> = None;
        while left > 0 {
            let mut pending = self.lock();
            for (_, pid) in processes {
                let unknown = resolutions
                    .iter()
                    .zip(processes)
                    .any(|(r, (_, p))| p == pid && *r == Resolution::Unknown);
                if unknown {
                    if let Some(status) = take(&mut pending, *pid) {
                        left -= resolve(&mut resolutions, *pid, status);
                    }
                }
            }

            while left > 0 {
                match self.reaper.reap(None, false) {
                    Ok(Some((pid, status))) => {
                        if !processes.iter().any(|(_, p)| *p == pid) {
                            debug!(%pid, ?status, "parking status of a child outside the set");
                            pending.push(Reaped { pid, status });
                            continue;
                        }
                        let hits = resolve(&mut resolutions, pid, status);
                        if hits == 0 {
                            error!("PID {pid} was reused");
                            failure = Some(Error::PidReused { pid });
                            break;
                        }
                        left -= hits;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("waiting for processes to terminate failed: {e}");
                        failure = Some(Error::sys("waitpid", e));
                        break;
                    }
                }
            }
            drop(pending);

            if failure.is_some() || left == 0 || !hang {
                break;
            }
            let Some(target) = next_unknown(&resolutions) else {
                break;
            };
            match self.reaper.reap(Some(target), true) {
                Ok(Some((pid, status))) => left -= resolve(&mut resolutions, pid, status),
                Ok(None) => {}
                Err(e) => {
                    // reaped by another set wait, which parks it before releasing the lock
                    if e == Errno::ECHILD {
                        if let Some(status) = self.claim(target) {
                            left -= resolve(&mut resolutions, target, status);
                            continue;
                        }
                    }
                    error!("waiting for process {target} to terminate failed: {e}");
                    failure = Some(Error::sys("waitpid", e));
                }
            }
        }

        let outcome = match failure {
            Some(e) => Err(e),
            None => {
                let mut outcome = if left > 0 {
                    Err(Error::StillRunning)
                } else {
                    Ok(())
                };
                for (resolution, (program, _)) in resolutions.iter().zip(processes) {
                    if let Resolution::Terminated(status) = resolution {
                        if let Err(e) = classify(program, *status) {
                            outcome = Err(e);
                        }
                    }
                }
                outcome
            }
        };

        WaitSet {
            resolutions,
            outcome,
        }
    }
}

/// Maps a termination status to the outcome of running `program`.
///
/// Exit code 0 is success. [`EXEC_FAILED_EXIT_CODE`] means the program could not be launched.
/// Any other exit code, or death by a signal, is a general failure.
pub fn classify(program: &str, status: WaitStatusRaw) -> Result<()> {
    match status.exit_code() {
        Some(0) => Ok(()),
        Some(EXEC_FAILED_EXIT_CODE) => {
            error!("error running '{program}': probably not installed");
            Err(Error::Configuration {
                program: program.to_string(),
            })
        }
        Some(code) => {
            error!("error running '{program}': exit status {code}");
            Err(Error::General {
                program: program.to_string(),
                exit_code: Some(code),
            })
        }
        None => {
            error!("error running '{program}': terminated");
            Err(Error::General {
                program: program.to_string(),
                exit_code: None,
            })
        }
    }
}
