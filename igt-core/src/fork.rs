// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process isolation: forked workers and helper processes.
//!
//! Child pids live in fixed-size atomic tables because the exit handlers, the fatal signal
//! handler and the SIGALRM handler must be able to kill and reap them without locking.

use crate::{
    context::Igt,
    exit_handler::{self, install_exit_handler},
    sigsafe::{CURRENT_DYNAMIC, CURRENT_SUBTEST},
    subtest::Transfer,
};
use igt_metadata::IgtExitCode;
use nix::{
    sys::{
        signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, alarm, fork},
};
use std::{
    io::Write,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

/// The maximum number of simultaneously tracked workers.
pub const MAX_CHILDREN: usize = 512;

/// The maximum number of simultaneously running helper processes.
pub const MAX_HELPERS: usize = 4;

struct PidTable<const N: usize> {
    pids: [AtomicI32; N],
}

impl<const N: usize> PidTable<N> {
    const fn new() -> Self {
        Self {
            pids: [const { AtomicI32::new(0) }; N],
        }
    }

    fn insert(&self, pid: i32) -> bool {
        self.pids.iter().any(|slot| {
            slot.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn remove(&self, pid: i32) {
        for slot in &self.pids {
            let _ = slot.compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    fn contains(&self, pid: i32) -> bool {
        self.pids
            .iter()
            .any(|slot| slot.load(Ordering::Acquire) == pid)
    }

    fn clear(&self) {
        for slot in &self.pids {
            slot.store(0, Ordering::Release);
        }
    }

    fn for_each(&self, mut f: impl FnMut(i32)) {
        for slot in &self.pids {
            let pid = slot.load(Ordering::Acquire);
            if pid > 0 {
                f(pid);
            }
        }
    }

    fn len(&self) -> usize {
        self.pids
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) > 0)
            .count()
    }
}

static CHILDREN: PidTable<MAX_CHILDREN> = PidTable::new();
static HELPERS: PidTable<MAX_HELPERS> = PidTable::new();
static WAIT_TIMED_OUT: AtomicBool = AtomicBool::new(false);

/// Kills every tracked worker with SIGKILL and reaps it. Async-signal-safe.
pub(crate) fn kill_children() {
    CHILDREN.for_each(|pid| {
        // SAFETY: kill(2) is async-signal-safe.
        unsafe { libc::kill(pid, libc::SIGKILL) };
    });
    CHILDREN.for_each(|pid| {
        let mut status = 0;
        // SAFETY: waitpid(2) is async-signal-safe and `status` is a valid out pointer.
        while unsafe { libc::waitpid(pid, &mut status, 0) } < 0
            && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
        {}
        CHILDREN.remove(pid);
    });
}

fn children_exit_handler(_sig: i32) {
    kill_children();
}

fn helpers_exit_handler(_sig: i32) {
    HELPERS.for_each(|pid| {
        // SAFETY: kill(2) and waitpid(2) are async-signal-safe.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
            let mut status = 0;
            libc::waitpid(pid, &mut status, 0);
        }
        HELPERS.remove(pid);
    });
}

extern "C" fn alarm_kill_children(_sig: libc::c_int) {
    WAIT_TIMED_OUT.store(true, Ordering::Release);
    CHILDREN.for_each(|pid| {
        // SAFETY: kill(2) is async-signal-safe.
        unsafe { libc::kill(pid, libc::SIGKILL) };
    });
}

/// Maps a wait status to an exit code: the exit status, or 128 + signal.
fn status_to_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(IgtExitCode::for_signal(signal as i32)),
        _ => None,
    }
}

/// A running helper process started with [`Igt::fork_helper`].
#[derive(Debug)]
#[must_use = "helpers must be stopped or waited for"]
pub struct HelperProcess {
    pid: Pid,
    running: bool,
}

impl HelperProcess {
    /// Returns the helper's pid.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns true until the helper has been stopped or waited for.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Igt {
    fn flush_std_streams() {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }

    /// Resets state that must not leak from the parent into a forked child.
    fn become_child(&mut self, index: Option<usize>) {
        exit_handler::clear_exit_handlers();
        CHILDREN.clear();
        HELPERS.clear();
        self.reaped_helpers.clear();
        self.fork_child = Some(index.map_or(0, |i| i + 1));
        if let Some(index) = index {
            self.log.set_prefix(format!(
                "({}:{}) [child {index}]",
                self.binary,
                std::process::id()
            ));
        } else {
            self.log
                .set_prefix(format!("({}:{})", self.binary, std::process::id()));
        }
    }

    fn spawn_children<F>(&mut self, count: usize, multi: bool, body: F)
    where
        F: Fn(&mut Igt, usize),
    {
        if self.fork_child.is_some() {
            self.internal_assert_failed("forking is not allowed from forked children");
        }
        if let Err(error) = install_exit_handler(children_exit_handler) {
            self.internal_assert_failed(&error.to_string());
        }

        for index in 0..count {
            Self::flush_std_streams();
            // SAFETY: the child only runs the body and then exits; test binaries don't hold
            // locks across fork points.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    self.become_child(multi.then_some(index));
                    let transfer = self.run_guarded(|t| body(t, index));
                    let code = match transfer {
                        Transfer::Success => IgtExitCode::SUCCESS,
                        Transfer::Skip => IgtExitCode::SKIP,
                        Transfer::Fail(code) => {
                            self.log.dump_buffer();
                            code
                        }
                    };
                    Self::flush_std_streams();
                    std::process::exit(code);
                }
                Ok(ForkResult::Parent { child }) => {
                    if !CHILDREN.insert(child.as_raw()) {
                        self.internal_assert_failed("too many forked children");
                    }
                }
                Err(errno) => {
                    tracing::error!(target: "igt_core::fork", "fork failed: {errno}");
                    self.fail();
                }
            }
        }
    }

    /// Forks `count` workers, each running `body` with its index.
    ///
    /// A worker's skip, failure or crash is reported to the parent only through its exit code;
    /// call [`waitchildren`](Self::waitchildren) to collect them.
    pub fn fork<F>(&mut self, count: usize, body: F)
    where
        F: Fn(&mut Igt, usize),
    {
        self.spawn_children(count, false, body);
    }

    /// Like [`fork`](Self::fork), but each worker logs with a `[child N]` prefix.
    pub fn multi_fork<F>(&mut self, count: usize, body: F)
    where
        F: Fn(&mut Igt, usize),
    {
        self.spawn_children(count, true, body);
    }

    /// Returns the number of workers still tracked.
    pub fn num_children(&self) -> usize {
        CHILDREN.len()
    }

    /// Waits for all workers and returns the combined exit code.
    ///
    /// The result is the first non-skip failure if any, otherwise 77 if every worker skipped,
    /// otherwise 0. On the first non-skip failure the remaining workers are killed.
    fn wait_children_code(&mut self) -> i32 {
        let mut worst: Option<i32> = None;
        let mut all_skipped = true;
        let mut any = false;
        let mut killed = false;

        loop {
            if CHILDREN.len() == 0 {
                break;
            }
            let status = match waitpid(None, None) {
                Ok(status) => status,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    CHILDREN.clear();
                    break;
                }
                Err(errno) => {
                    tracing::error!(target: "igt_core::fork", "waitpid failed: {errno}");
                    CHILDREN.clear();
                    break;
                }
            };
            let Some(pid) = status.pid() else { continue };
            let Some(code) = status_to_code(status) else {
                continue;
            };
            if !CHILDREN.contains(pid.as_raw()) {
                // Helpers are waited for separately; keep their status for wait_helper.
                if HELPERS.contains(pid.as_raw()) {
                    self.reaped_helpers.push((pid, status));
                }
                continue;
            }
            CHILDREN.remove(pid.as_raw());
            any = true;

            if code != IgtExitCode::SKIP {
                all_skipped = false;
            }
            if code != IgtExitCode::SUCCESS && code != IgtExitCode::SKIP && worst.is_none() {
                worst = Some(code);
                if !killed {
                    killed = true;
                    CHILDREN.for_each(|pid| {
                        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
                    });
                }
            }
        }

        match worst {
            Some(code) => code,
            None if any && all_skipped => IgtExitCode::SKIP,
            None => IgtExitCode::SUCCESS,
        }
    }

    /// Waits for all workers, then skips or fails the current subtest if they did.
    #[track_caller]
    pub fn waitchildren(&mut self) {
        match self.wait_children_code() {
            IgtExitCode::SUCCESS => {}
            IgtExitCode::SKIP => self.skip("all forked children skipped"),
            code => {
                tracing::error!(target: "igt_core::fork", "forked child failed with exit code {code}");
                self.fail_with_code(code);
            }
        }
    }

    /// Like [`waitchildren`](Self::waitchildren), but kills all workers and fails if they
    /// haven't finished after `seconds`.
    #[track_caller]
    pub fn waitchildren_timeout(&mut self, seconds: u32, reason: &str) {
        WAIT_TIMED_OUT.store(false, Ordering::Release);
        let action = SigAction::new(
            SigHandler::Handler(alarm_kill_children),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only performs async-signal-safe calls.
        let previous = match unsafe { signal::sigaction(Signal::SIGALRM, &action) } {
            Ok(previous) => previous,
            Err(errno) => {
                tracing::error!(target: "igt_core::fork", "installing SIGALRM handler failed: {errno}");
                self.fail();
            }
        };
        alarm::set(seconds);
        let code = self.wait_children_code();
        alarm::cancel();
        // SAFETY: restores the disposition that was active before.
        let _ = unsafe { signal::sigaction(Signal::SIGALRM, &previous) };

        if WAIT_TIMED_OUT.load(Ordering::Acquire) {
            tracing::error!(target: "igt_core::fork", "Timed out: {reason}");
            self.fail();
        }
        match code {
            IgtExitCode::SUCCESS => {}
            IgtExitCode::SKIP => self.skip("all forked children skipped"),
            code => self.fail_with_code(code),
        }
    }

    /// Forks a helper process running `body` in the background.
    ///
    /// Helpers are independent of the subtest state: they don't report results, and are
    /// terminated with SIGTERM at exit if still running.
    pub fn fork_helper<F>(&mut self, body: F) -> HelperProcess
    where
        F: FnOnce(),
    {
        if HELPERS.len() >= MAX_HELPERS {
            self.internal_assert_failed("too many helper processes");
        }
        if let Err(error) = install_exit_handler(helpers_exit_handler) {
            self.internal_assert_failed(&error.to_string());
        }
        Self::flush_std_streams();
        // SAFETY: see spawn_children.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                exit_handler::clear_exit_handlers();
                CHILDREN.clear();
                HELPERS.clear();
                CURRENT_SUBTEST.clear();
                CURRENT_DYNAMIC.clear();
                body();
                Self::flush_std_streams();
                std::process::exit(IgtExitCode::SUCCESS);
            }
            Ok(ForkResult::Parent { child }) => {
                HELPERS.insert(child.as_raw());
                HelperProcess {
                    pid: child,
                    running: true,
                }
            }
            Err(errno) => {
                tracing::error!(target: "igt_core::fork", "fork failed: {errno}");
                self.fail();
            }
        }
    }

    /// Terminates a helper with SIGTERM and asserts that it died from it.
    #[track_caller]
    pub fn stop_helper(&mut self, helper: &mut HelperProcess) {
        if !helper.running {
            return;
        }
        if !self.helper_reaped(helper.pid) {
            let _ = signal::kill(helper.pid, Signal::SIGTERM);
        }
        let status = self.reap_helper(helper.pid);
        helper.running = false;
        HELPERS.remove(helper.pid.as_raw());
        let killed_by_sigterm = matches!(status, Ok(WaitStatus::Signaled(_, Signal::SIGTERM, _)));
        self.assert(
            killed_by_sigterm,
            format_args!("helper {} was killed by SIGTERM (status {status:?})", helper.pid),
        );
    }

    /// Waits for a helper to exit. Returns true if it exited successfully.
    pub fn wait_helper(&mut self, helper: &mut HelperProcess) -> bool {
        if !helper.running {
            return false;
        }
        let status = self.reap_helper(helper.pid);
        helper.running = false;
        HELPERS.remove(helper.pid.as_raw());
        matches!(status, Ok(WaitStatus::Exited(_, 0)))
    }

    fn helper_reaped(&self, pid: Pid) -> bool {
        self.reaped_helpers.iter().any(|(reaped, _)| *reaped == pid)
    }

    /// Returns the helper's exit status, collecting it now unless a worker wait already did.
    fn reap_helper(&mut self, pid: Pid) -> nix::Result<WaitStatus> {
        if let Some(index) = self
            .reaped_helpers
            .iter()
            .position(|(reaped, _)| *reaped == pid)
        {
            return Ok(self.reaped_helpers.swap_remove(index).1);
        }
        loop {
            match waitpid(pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                other => return other,
            }
        }
    }
}
