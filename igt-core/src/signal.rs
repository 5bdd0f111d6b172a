// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fatal signal handling.
//!
//! On a crash-class signal the handler reports the signal and a backtrace on stderr, then marks
//! the running dynamic subtest and subtest as crashed. Every handled signal then runs the exit
//! handlers and is re-raised with the default disposition, so the process dies from it.

use crate::{
    comms,
    exit_handler::run_exit_handlers,
    sigsafe::{self, CURRENT_DYNAMIC, CURRENT_SUBTEST, NameBuf, SigsafeWriter},
};
use igt_metadata::{SubtestOutcome, comms::PacketBody};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

/// Signals reported as crashes.
const CRASH_SIGNALS: [Signal; 5] = [
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
];

/// Signals that only trigger cleanup.
const SILENT_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGPIPE,
    Signal::SIGTERM,
];

static SENTINEL_ON_STDERR: AtomicBool = AtomicBool::new(false);

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod backtrace {
    use std::os::fd::RawFd;

    unsafe extern "C" {
        fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
        fn backtrace_symbols_fd(
            buffer: *const *mut libc::c_void,
            size: libc::c_int,
            fd: libc::c_int,
        );
    }

    const MAX_FRAMES: usize = 64;

    /// Loads the unwinder, which allocates on first use and so must not happen in the handler.
    pub(super) fn prewarm() {
        let mut frames = [std::ptr::null_mut(); 1];
        // SAFETY: the buffer holds the requested number of frames.
        unsafe { backtrace(frames.as_mut_ptr(), 1) };
    }

    pub(super) fn write_to(fd: RawFd) {
        let mut frames = [std::ptr::null_mut(); MAX_FRAMES];
        // SAFETY: the buffer holds MAX_FRAMES frames, and backtrace_symbols_fd doesn't allocate.
        unsafe {
            let n = backtrace(frames.as_mut_ptr(), MAX_FRAMES as libc::c_int);
            backtrace_symbols_fd(frames.as_ptr(), n, fd);
        }
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod backtrace {
    pub(super) fn prewarm() {}

    pub(super) fn write_to(_fd: std::os::fd::RawFd) {}
}

/// Installs the fatal signal handler for every crash-class and cleanup signal.
pub(crate) fn install_fatal_handlers(sentinel_on_stderr: bool) {
    SENTINEL_ON_STDERR.store(sentinel_on_stderr, Ordering::Release);
    backtrace::prewarm();

    let action = SigAction::new(
        SigHandler::Handler(fatal_signal_handler),
        SaFlags::SA_NODEFER | SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for sig in CRASH_SIGNALS.iter().chain(&SILENT_SIGNALS) {
        // SAFETY: the handler only performs async-signal-safe calls.
        if let Err(errno) = unsafe { signal::sigaction(*sig, &action) } {
            tracing::warn!(target: "igt_core::signal", "installing handler for {sig} failed: {errno}");
        }
    }
}

fn restore_default_dispositions() {
    for sig in CRASH_SIGNALS.iter().chain(&SILENT_SIGNALS) {
        // SAFETY: SIG_DFL is always a valid disposition; signal(2) is async-signal-safe.
        unsafe { libc::signal(*sig as libc::c_int, libc::SIG_DFL) };
    }
}

fn is_crash_signal(sig: libc::c_int) -> bool {
    CRASH_SIGNALS.iter().any(|s| *s as libc::c_int == sig)
}

/// Returns the name of `sig` without allocating.
fn signal_name(sig: libc::c_int) -> &'static str {
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str(),
        Err(_) => "unknown signal",
    }
}

/// Formats the crash result line for a subtest, e.g. `Subtest b-subtest: CRASH (0.012s)`.
fn push_crash_line<const N: usize>(w: &mut SigsafeWriter<N>, dynamic: bool, name: &[u8], elapsed_ns: u64) {
    w.push_str(if dynamic { "Dynamic subtest " } else { "Subtest " })
        .push_bytes(name)
        .push_str(": ")
        .push_str(SubtestOutcome::Crash.as_str())
        .push_str(" (")
        .push_secs(elapsed_ns)
        .push_str("s)\n");
}

/// Marks the subtest in `slot` as crashed, on the runner socket if connected and otherwise on
/// the standard streams.
fn report_crash(slot: &sigsafe::NameSlot, dynamic: bool, now_ns: u64) {
    let mut name: NameBuf = [0; 128];
    let Some((len, start_ns)) = slot.read(&mut name) else {
        return;
    };
    let name = &name[..len];
    let elapsed_ns = now_ns.saturating_sub(start_ns);

    let mut time = SigsafeWriter::<32>::new();
    time.push_secs(elapsed_ns);
    if let Ok(name) = std::str::from_utf8(name) {
        let body = if dynamic {
            PacketBody::DynamicSubtestResult {
                name: name.into(),
                result: SubtestOutcome::Crash.as_str().into(),
                timeused: time.as_str().into(),
                reason: "".into(),
            }
        } else {
            PacketBody::SubtestResult {
                name: name.into(),
                result: SubtestOutcome::Crash.as_str().into(),
                timeused: time.as_str().into(),
                reason: "".into(),
            }
        };
        if comms::send_sigsafe(&body) {
            return;
        }
    }

    let mut line = SigsafeWriter::<256>::new();
    push_crash_line(&mut line, dynamic, name, elapsed_ns);
    sigsafe::write_all(libc::STDOUT_FILENO, line.as_bytes());
    if SENTINEL_ON_STDERR.load(Ordering::Acquire) {
        sigsafe::write_all(libc::STDERR_FILENO, line.as_bytes());
    }
}

extern "C" fn fatal_signal_handler(sig: libc::c_int) {
    if is_crash_signal(sig) {
        let mut w = SigsafeWriter::<64>::new();
        w.push_str("Received signal ")
            .push_str(signal_name(sig))
            .push_str(".\n");
        if !comms::send_sigsafe(&PacketBody::Log {
            stream: igt_metadata::comms::LogStream::Stderr,
            text: w.as_str().into(),
        }) {
            w.flush_to(libc::STDERR_FILENO);
        }
        backtrace::write_to(libc::STDERR_FILENO);

        let now = sigsafe::monotonic_ns();
        report_crash(&CURRENT_DYNAMIC, true, now);
        report_crash(&CURRENT_SUBTEST, false, now);
    }

    restore_default_dispositions();
    run_exit_handlers(sig);
    // SAFETY: raise(3) is async-signal-safe; the default disposition terminates the process.
    unsafe { libc::raise(sig) };
}
