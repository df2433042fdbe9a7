// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawning helper processes on POSIX systems.
//!
//! - [`SpawnCfg`] forks and execs a program with its standard streams on pipes, a socket pair,
//!   `/dev/null` or inherited, and hands back a [`Process`] owning the parent ends.
//! - [`spawn_fd`] runs a program on descriptors the caller already has.
//! - Detached spawns double fork the program into its own session.
//! - [`ReapLedger`] reaps children so that waiting for a set of processes never steals the status
//!   of a child somebody else is waiting for.
//!
//! Children never inherit more than their three standard streams plus the descriptors asked for
//! with [`SpawnCfg::keep_fds`].

#![cfg(unix)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod error;
pub mod exec;
pub mod fd;
pub mod hooks;
pub mod ledger;
pub mod pipe;
pub mod process;
pub mod spawn;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
pub use exec::{ChildFds, ExecImage, PreExec, EXEC_FAILED_EXIT_CODE};
pub use fd::{close_all_from, max_fd_bound, open_fds};
pub use hooks::Hooks;
pub use ledger::{Reap, ReapLedger, Resolution, WaitSet};
pub use pipe::{close_pipe_end, make_pipe, make_pipe_with_stream, make_socketpair, Direction, Pipe};
pub use process::{wait_all, ExitStatus, Process, Request, Response, StdStream, WaitStatusRaw};
pub use spawn::{spawn_detached, spawn_fd, SpawnCfg, Stdio};
pub use stream::{Stream, StreamMode};
