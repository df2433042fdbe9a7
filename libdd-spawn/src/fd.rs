// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Descriptor inventory: bounding the descriptor space and closing it in bulk.

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};

#[cfg(target_os = "macos")]
const SELF_FD_DIR: &str = "/dev/fd";

#[cfg(not(target_os = "macos"))]
const SELF_FD_DIR: &str = "/proc/self/fd";

/// `_POSIX_OPEN_MAX`, the smallest limit a conforming system may impose.
const POSIX_OPEN_MAX: RawFd = 20;

/// Used when nothing better is known, or when the platform reports nonsense.
const FALLBACK_MAX_FDS: RawFd = 256;

/// Highest descriptor currently open, read from the process' descriptor directory.
///
/// Much faster than probing the whole rlimit range: with a limit of 4096 and a handful of open
/// files, closing everything goes from thousands of failing `close` calls to a few.
fn highest_open_fd() -> Option<RawFd> {
    let mut dir = nix::dir::Dir::open(
        SELF_FD_DIR,
        nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    )
    .ok()?;
    dir.iter()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            std::str::from_utf8(entry.file_name().to_bytes())
                .ok()?
                .parse::<RawFd>()
                .ok()
        })
        .max()
}

fn rlimit_max_fds() -> Option<u64> {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((_, hard)) if hard != libc::RLIM_INFINITY => Some(hard),
        _ => None,
    }
}

fn sysconf_max_fds() -> Option<i64> {
    // SAFETY: no preconditions
    let res = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    (res >= 0).then_some(i64::from(res))
}

/// Picks the bound from the available sources, in order of preference.
fn pick_bound(
    highest_open: Option<RawFd>,
    rlimit: Option<u64>,
    sysconf: Option<i64>,
    compile_time: Option<RawFd>,
) -> RawFd {
    if let Some(fd) = highest_open {
        return fd.saturating_add(1);
    }

    let limit = rlimit
        .and_then(|l| RawFd::try_from(l).ok())
        .or_else(|| sysconf.and_then(|l| RawFd::try_from(l).ok()))
        .or(compile_time)
        .unwrap_or(FALLBACK_MAX_FDS);

    // AIX reports INT32_MAX instead of a real limit
    if limit == RawFd::MAX {
        FALLBACK_MAX_FDS
    } else {
        limit
    }
}

/// Best effort upper bound (exclusive) of the descriptor numbers in use by this process.
pub fn max_fd_bound() -> RawFd {
    let highest_open = highest_open_fd();
    if highest_open.is_some() {
        return pick_bound(highest_open, None, None, None);
    }
    pick_bound(
        None,
        rlimit_max_fds(),
        sysconf_max_fds(),
        Some(POSIX_OPEN_MAX),
    )
}

/// Descriptors in `[first, bound)` that are not listed in `except`.
///
/// `except` must be strictly ascending. The scan keeps a cursor into it, so every entry is
/// looked at once.
pub(crate) fn close_plan<'a>(
    first: RawFd,
    bound: RawFd,
    except: Option<&'a [RawFd]>,
) -> impl Iterator<Item = RawFd> + 'a {
    let except = except.unwrap_or(&[]);
    let mut cursor = 0;
    (first..bound).filter(move |&fd| {
        while cursor < except.len() && except[cursor] < fd {
            cursor += 1;
        }
        if cursor < except.len() && except[cursor] == fd {
            cursor += 1;
            false
        } else {
            true
        }
    })
}

/// Closes all descriptors starting at `first`, except the ones in `except`.
///
/// `except` must be sorted in strictly ascending order. Closing a descriptor that is not open is
/// expected and ignored; `errno` is cleared before returning.
///
/// This runs in forked children. The descriptor loop itself does not allocate, but
/// [`max_fd_bound`] may list the descriptor directory, and `opendir` can allocate.
pub fn close_all_from(first: RawFd, except: Option<&[RawFd]>) {
    let bound = max_fd_bound();
    for fd in close_plan(first, bound, except) {
        // SAFETY: closing arbitrary descriptors is the whole point, callers own the table
        unsafe { libc::close(fd) };
    }
    Errno::clear();
}

/// All currently open descriptors in ascending order.
///
/// Every candidate below [`max_fd_bound`] is probed with `fstat`; only `EBADF` means the slot is
/// free. Meant for diagnostics and tests.
pub fn open_fds() -> Vec<RawFd> {
    let bound = max_fd_bound();
    let mut fds = Vec::with_capacity(32);
    for fd in 0..bound {
        if !matches!(nix::sys::stat::fstat(fd), Err(Errno::EBADF)) {
            fds.push(fd);
        }
    }
    fds
}
