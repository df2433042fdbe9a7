// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use libdd_spawn::{
    make_pipe, spawn_detached, spawn_fd, wait_all, ChildFds, Error, Process, ReapLedger, Request,
    Resolution, Response, SpawnCfg, StdStream, Stdio, EXEC_FAILED_EXIT_CODE,
};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};

fn sh(script: &str) -> SpawnCfg {
    let mut cfg = SpawnCfg::new("/bin/sh");
    cfg.args(["-c", script]);
    cfg
}

fn read_stream(process: &mut Process, stream: StdStream) -> String {
    let mut out = String::new();
    process
        .take_stream(stream, false)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    out
}

#[test]
fn test_true_with_piped_output() {
    let mut process = SpawnCfg::new("/bin/true")
        .stdout(Stdio::Pipe)
        .stderr(Stdio::Pipe)
        .spawn()
        .unwrap();
    assert!(process.is_running());
    assert!(matches!(process.wait_status(), Err(Error::Unfinished)));

    process.wait(true).unwrap();
    assert!(!process.is_running());
    process.check().unwrap();

    let status = process.exit_status().unwrap();
    assert!(status.exited);
    assert_eq!(status.exit_code, 0);
    assert_eq!(
        process.ctl(Request::GetExitCode).unwrap(),
        Response::ExitCode(Some(0))
    );
    assert!(read_stream(&mut process, StdStream::Stdout).is_empty());
    assert!(matches!(
        process.take_fd(StdStream::Stdin),
        Err(Error::NotPiped(StdStream::Stdin))
    ));
}

#[test]
fn test_missing_program() {
    let err = spawn_fd(
        "/nonexistent/libdd-spawn/helper",
        ["--version"],
        None,
        None,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    // no pre-check here, the child fails to exec
    let mut process = SpawnCfg::new("/nonexistent/libdd-spawn/helper")
        .spawn()
        .unwrap();
    process.wait(true).unwrap();
    assert!(matches!(process.check(), Err(Error::Configuration { .. })));
    assert_eq!(
        process.exit_status().unwrap().exit_code,
        EXEC_FAILED_EXIT_CODE
    );
}

#[test]
fn test_killed_by_signal() {
    let mut process = sh("kill -TERM $$").spawn().unwrap();
    process.wait(true).unwrap();

    let err = process.check().unwrap_err();
    assert!(matches!(err, Error::General { exit_code: None, .. }));

    let status = process.exit_status().unwrap();
    assert!(status.signaled);
    assert!(!status.exited);
    assert_eq!(status.signal, libc::SIGTERM);
    assert_eq!(status.exit_code, 0);
    assert_eq!(
        process.ctl(Request::GetExitCode).unwrap(),
        Response::ExitCode(None)
    );
}

#[test]
fn test_non_zero_exit() {
    let err = sh("exit 3").spawn_and_wait().unwrap_err();
    assert_eq!(err.exit_code(), Some(3));
    assert!(!err.is_retryable());
}

#[test]
fn test_cat_round_trip_over_pipes() {
    let mut process = SpawnCfg::new("/bin/cat")
        .stdin(Stdio::Pipe)
        .stdout(Stdio::Pipe)
        .streams(false)
        .spawn()
        .unwrap();

    let mut stdin = process.take_stream(StdStream::Stdin, false).unwrap();
    stdin.write_all(b"hello from the parent\n").unwrap();
    stdin.close().unwrap();

    assert_eq!(
        read_stream(&mut process, StdStream::Stdout),
        "hello from the parent\n"
    );
    process.wait(true).unwrap();
    process.check().unwrap();
}

#[test]
fn test_cat_round_trip_over_socketpair() {
    let mut process = SpawnCfg::new("/bin/cat")
        .stdin_stdout_socketpair(true)
        .spawn()
        .unwrap();

    let mut writer = UnixStream::from(process.take_fd(StdStream::Stdin).unwrap());
    let mut reader = UnixStream::from(process.take_fd(StdStream::Stdout).unwrap());
    assert_ne!(writer.as_raw_fd(), reader.as_raw_fd());

    writer.write_all(b"ping").unwrap();
    writer.shutdown(std::net::Shutdown::Write).unwrap();

    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    assert_eq!(out, "ping");

    process.wait(true).unwrap();
    process.check().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_child_only_sees_standard_streams() {
    // not close-on-exec, must still not leak into the child
    let stray = make_pipe().unwrap();

    let mut process = sh("ls /proc/self/fd")
        .stdin(Stdio::Pipe)
        .stdout(Stdio::Pipe)
        .stderr(Stdio::Pipe)
        .spawn()
        .unwrap();

    let [stdin, stdout, stderr] = process.take_fds().unwrap();
    let (stdin, stdout, stderr) = (stdin.unwrap(), stdout.unwrap(), stderr.unwrap());
    let parent_fds = [stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()];
    assert!(parent_fds.iter().all(|fd| *fd > 2));
    assert_ne!(parent_fds[0], parent_fds[1]);
    assert_ne!(parent_fds[1], parent_fds[2]);
    assert_ne!(parent_fds[0], parent_fds[2]);
    drop(stdin);

    let mut out = String::new();
    File::from(stdout).read_to_string(&mut out).unwrap();
    process.wait(true).unwrap();
    process.check().unwrap();

    let fds: Vec<i32> = out.split_whitespace().map(|fd| fd.parse().unwrap()).collect();
    // 0, 1, 2 and the directory ls is reading
    assert!(fds.iter().all(|fd| *fd <= 3), "leaked descriptors: {fds:?}");
    drop(stray);
}

#[test]
fn test_keep_fds_passes_descriptor_through() {
    let mut file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).unwrap();

    sh(&format!("echo passed >> /dev/fd/{fd}"))
        .keep_fds([fd])
        .spawn_and_wait()
        .unwrap();

    file.rewind().unwrap();
    let mut out = String::new();
    file.read_to_string(&mut out).unwrap();
    assert_eq!(out, "passed\n");
}

#[test]
fn test_env_entries_reach_the_child() {
    let mut process = sh("printf %s \"$LIBDD_SPAWN_GREETING\"")
        .env(["LIBDD_SPAWN_GREETING=hello"])
        .stdout(Stdio::Pipe)
        .spawn()
        .unwrap();
    assert_eq!(read_stream(&mut process, StdStream::Stdout), "hello");
    process.wait(true).unwrap();
    process.check().unwrap();
}

#[test]
fn test_pre_exec_redirects_stderr() {
    let mut process = sh("echo oops >&2")
        .stdout(Stdio::Pipe)
        .pre_exec(|fds: &mut ChildFds| {
            let stdout = fds.get(StdStream::Stdout);
            fds.set(StdStream::Stderr, stdout);
        })
        .spawn()
        .unwrap();
    assert_eq!(read_stream(&mut process, StdStream::Stdout), "oops\n");
    process.wait(true).unwrap();
    process.check().unwrap();
}

#[test]
fn test_spawn_fd_on_borrowed_descriptors() {
    let pipe = make_pipe().unwrap();
    let pid = spawn_fd(
        "/bin/sh",
        ["-c", "echo borrowed"],
        None,
        Some(pipe.write.as_fd()),
        None,
    )
    .unwrap();
    drop(pipe.write);

    let mut out = String::new();
    File::from(pipe.read).read_to_string(&mut out).unwrap();
    assert_eq!(out, "borrowed\n");
    ReapLedger::global().wait_process("sh", pid, true).unwrap();
}

#[test]
fn test_concurrent_set_waits() {
    let spawn = |script: &str| {
        let pid = spawn_fd("/bin/sh", ["-c", script], None, None, None).unwrap();
        ("sh", pid)
    };
    let first = [spawn("sleep 0.3; exit 0"), spawn("exit 3")];
    let second = [spawn("sleep 0.1; exit 0"), spawn("sleep 0.2; exit 5")];
    let foreign = spawn("exit 7");

    let waiters: Vec<_> = [first, second]
        .into_iter()
        .map(|set| thread::spawn(move || ReapLedger::global().wait_processes(&set, true)))
        .collect();
    let sets: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();

    let codes = |set: &libdd_spawn::WaitSet| {
        set.resolutions()
            .iter()
            .map(Resolution::exit_code)
            .collect::<Vec<_>>()
    };
    assert_eq!(codes(&sets[0]), vec![Some(0), Some(3)]);
    assert_eq!(codes(&sets[1]), vec![Some(0), Some(5)]);
    assert_eq!(sets[0].outcome().unwrap_err().exit_code(), Some(3));
    assert_eq!(sets[1].outcome().unwrap_err().exit_code(), Some(5));

    // likely reaped and parked by one of the set waits, still delivered to its owner
    let err = ReapLedger::global()
        .wait_process(foreign.0, foreign.1, true)
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(7));
}

#[test]
fn test_non_blocking_wait_and_terminate() {
    let mut process = sh("exec sleep 30").spawn().unwrap();
    let err = process.wait(false).unwrap_err();
    assert!(err.is_retryable());
    assert!(process.is_running());

    process.terminate().unwrap();
    process.wait(true).unwrap();
    assert!(matches!(
        process.check(),
        Err(Error::General { exit_code: None, .. })
    ));
    assert_eq!(process.exit_status().unwrap().signal, libc::SIGTERM);
}

#[test]
fn test_ctl_kill() {
    let mut process = sh("exec sleep 30").spawn().unwrap();
    let pid = process.pid().unwrap();
    assert_eq!(
        process.ctl(Request::GetId).unwrap(),
        Response::Id(pid.as_raw())
    );
    let request = Request::from_raw(Request::KILL, libc::SIGKILL).unwrap();
    assert_eq!(process.ctl(request).unwrap(), Response::Done);

    process.wait(true).unwrap();
    let Response::WaitStatus(status) = process.ctl(Request::GetWaitStatus).unwrap() else {
        panic!("unexpected response");
    };
    assert_eq!(status.signal, libc::SIGKILL);
}

#[test]
fn test_wait_is_cached() {
    let mut process = SpawnCfg::new("/bin/true").spawn().unwrap();
    let pid = process.pid().unwrap();
    process.wait(true).unwrap();
    let status = process.wait_status().unwrap();

    process.wait(true).unwrap();
    process.wait(false).unwrap();
    assert_eq!(process.wait_status().unwrap(), status);

    // the status was consumed exactly once
    assert!(matches!(
        ReapLedger::global().wait_status(pid, false),
        Err(Error::Sys {
            source: Errno::ECHILD,
            ..
        })
    ));
}

#[test]
fn test_wait_all() {
    let mut processes = vec![
        SpawnCfg::new("/bin/true").spawn().unwrap(),
        sh("exit 2").spawn().unwrap(),
        SpawnCfg::new("/bin/true").spawn().unwrap(),
    ];
    processes[0].wait(true).unwrap();
    wait_all(&mut processes, true).unwrap();

    assert!(processes.iter().all(|p| !p.is_running()));
    assert!(processes[0].check().is_ok());
    assert_eq!(processes[1].check().unwrap_err().exit_code(), Some(2));
}

#[test]
fn test_drop_reaps_running_process() {
    let process = sh("exec sleep 30").spawn().unwrap();
    let pid = process.pid().unwrap();
    process.release();
    assert_eq!(kill(pid, None::<Signal>), Err(Errno::ESRCH));
}

#[test]
fn test_signals_after_reap_are_no_ops() -> anyhow::Result<()> {
    let mut process = SpawnCfg::new("/bin/true").spawn()?;
    process.wait(true)?;

    // the pid may already belong to someone else, nothing is sent
    process.terminate()?;
    process.kill(None)?;
    assert_eq!(
        process.ctl(Request::Kill(Some(Signal::SIGKILL)))?,
        Response::Done
    );
    process.check()?;
    Ok(())
}

#[test]
fn test_drop_claims_status_parked_by_set_wait() -> anyhow::Result<()> {
    let process = sh("exit 4").spawn()?;
    let pid = process.pid()?;
    let other = spawn_fd("/bin/sh", ["-c", "sleep 0.3"], None, None, None)?;

    // non-blocking set waits sweep every child, so the handle's one gets parked
    let set = [("sh", other)];
    let set_wait = loop {
        let set_wait = ReapLedger::global().wait_processes(&set, false);
        if !matches!(set_wait.resolutions()[0], Resolution::Unknown) {
            break set_wait;
        }
        thread::sleep(Duration::from_millis(20));
    };
    set_wait.into_parts().1?;
    assert!(process.is_running());

    process.release();
    assert!(matches!(
        ReapLedger::global().wait_status(pid, false),
        Err(Error::Sys {
            source: Errno::ECHILD,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_stream_hand_off_happens_once() {
    let mut process = SpawnCfg::new("/bin/cat")
        .stdin(Stdio::Pipe)
        .spawn()
        .unwrap();
    let stdin = process.take_stream(StdStream::Stdin, true).unwrap();
    assert!(stdin.is_nonblocking());
    assert!(matches!(
        process.take_fd(StdStream::Stdin),
        Err(Error::AlreadyTaken(StdStream::Stdin))
    ));
    stdin.close().unwrap();
    process.wait(true).unwrap();
    process.check().unwrap();
}

#[test]
fn test_detached_true() {
    let process = spawn_detached(
        "/bin/true",
        std::iter::empty::<&str>(),
        ["LIBDD_SPAWN_DETACHED=1"],
    )
    .unwrap();
    assert!(process.is_detached());
    assert!(!process.is_running());
    assert!(process.pid().is_err());
    assert!(process.check().is_ok());
}
