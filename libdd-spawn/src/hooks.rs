// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process wide callbacks used by the spawn engine.
//!
//! Embedders running a cooperative scheduler can install a pre/post pair that brackets every
//! blocking system call issued by this crate (`fork`, `waitpid`, `kill`,
//! `socketpair`), so other tasks can run while the calling thread is blocked. Embedders holding
//! secrets in memory can install a purge hook that runs in every forked child before anything
//! else happens there.
//!
//! Hooks can be installed once. The first spawn or wait freezes whatever is installed at that
//! point (no-ops if nothing was), later installation attempts are rejected.

use std::sync::OnceLock;

#[derive(Debug, Default, Clone, Copy)]
pub struct Hooks {
    /// Called right before a blocking system call.
    pub pre_syscall: Option<fn()>,
    /// Called right after a blocking system call returned.
    pub post_syscall: Option<fn()>,
    /// Called in the child immediately after fork.
    ///
    /// Runs before any exec setup and must be async-signal-safe: the child of a multithreaded
    /// parent can't rely on locks or the allocator.
    pub purge_secrets: Option<fn()>,
}

static HOOKS: OnceLock<Hooks> = OnceLock::new();

impl Hooks {
    /// Installs the hooks for the whole process.
    ///
    /// Returns the rejected hooks if hooks were already installed or already frozen by a spawn.
    pub fn install(self) -> Result<(), Hooks> {
        HOOKS.set(self)
    }

    /// The installed hooks, initialized to no-ops on first use.
    pub fn current() -> &'static Hooks {
        HOOKS.get_or_init(Hooks::default)
    }

    pub(crate) fn purge_in_child(&self) {
        if let Some(purge) = self.purge_secrets {
            purge();
        }
    }

    /// Runs `f` bracketed by the syscall clamp.
    pub(crate) fn clamp<T>(&self, f: impl FnOnce() -> T) -> T {
        if let Some(pre) = self.pre_syscall {
            pre();
        }
        let res = f();
        if let Some(post) = self.post_syscall {
            post();
        }
        res
    }
}

/// Shorthand for `Hooks::current().clamp(f)`.
pub(crate) fn blocking<T>(f: impl FnOnce() -> T) -> T {
    Hooks::current().clamp(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PRE: AtomicUsize = AtomicUsize::new(0);
    static POST: AtomicUsize = AtomicUsize::new(0);

    fn count_pre() {
        PRE.fetch_add(1, Ordering::SeqCst);
    }

    fn count_post() {
        // post must always observe its matching pre
        assert!(PRE.load(Ordering::SeqCst) > POST.load(Ordering::SeqCst));
        POST.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_clamp_brackets_call() {
        let hooks = Hooks {
            pre_syscall: Some(count_pre),
            post_syscall: Some(count_post),
            purge_secrets: None,
        };
        let before = PRE.load(Ordering::SeqCst);
        let value = hooks.clamp(|| {
            assert_eq!(PRE.load(Ordering::SeqCst), before + 1);
            7
        });
        assert_eq!(value, 7);
        assert_eq!(PRE.load(Ordering::SeqCst), before + 1);
        assert_eq!(POST.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let hooks = Hooks::default();
        hooks.purge_in_child();
        assert_eq!(hooks.clamp(|| "ok"), "ok");
    }

    #[test]
    fn test_hooks_are_installed_once() {
        // whichever of install/current ran first in this process wins
        let _ = Hooks::current();
        assert!(Hooks::default().install().is_err());
    }
}
