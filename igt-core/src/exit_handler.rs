// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The process-wide cleanup stack.
//!
//! Handlers run exactly once, most recently installed first, either from the normal exit path
//! (with signal 0) or from the fatal signal handler (with the signal number). Handlers are plain
//! function pointers stored in atomics so the signal handler can read them without locking.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// A cleanup callback. The argument is the signal that terminated the process, or 0 on a normal
/// exit.
///
/// Handlers may be called from a signal handler and must only do async-signal-safe work.
pub type ExitHandler = fn(i32);

/// The maximum number of exit handlers.
pub const MAX_EXIT_HANDLERS: usize = 10;

static HANDLERS: [AtomicUsize; MAX_EXIT_HANDLERS] =
    [const { AtomicUsize::new(0) }; MAX_EXIT_HANDLERS];
static COUNT: AtomicUsize = AtomicUsize::new(0);
static RUNNING: AtomicBool = AtomicBool::new(false);
static REGISTER_LOCK: Mutex<()> = Mutex::new(());
static ATEXIT_INSTALLED: AtomicBool = AtomicBool::new(false);

/// An error returned when the exit handler stack is full.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("exit handler stack is full ({MAX_EXIT_HANDLERS} handlers)")]
pub struct ExitHandlerStackFull;

/// Installs `handler`. Installing the same handler twice is a no-op.
pub fn install_exit_handler(handler: ExitHandler) -> Result<(), ExitHandlerStackFull> {
    let _guard = REGISTER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let addr = handler as usize;
    let count = COUNT.load(Ordering::Acquire);
    if HANDLERS[..count]
        .iter()
        .any(|slot| slot.load(Ordering::Relaxed) == addr)
    {
        return Ok(());
    }
    if count == MAX_EXIT_HANDLERS {
        return Err(ExitHandlerStackFull);
    }
    HANDLERS[count].store(addr, Ordering::Relaxed);
    COUNT.store(count + 1, Ordering::Release);

    if !ATEXIT_INSTALLED.swap(true, Ordering::AcqRel) {
        // SAFETY: run_at_exit is a valid extern "C" function with no arguments.
        unsafe { libc::atexit(run_at_exit) };
    }
    Ok(())
}

/// Runs all installed handlers with `sig`, most recent first. Only the first call has any
/// effect. Async-signal-safe.
pub(crate) fn run_exit_handlers(sig: i32) {
    if RUNNING.swap(true, Ordering::AcqRel) {
        return;
    }
    let count = COUNT.load(Ordering::Acquire);
    for slot in HANDLERS[..count].iter().rev() {
        let addr = slot.load(Ordering::Relaxed);
        if addr == 0 {
            continue;
        }
        // SAFETY: only `ExitHandler` values are ever stored in the table.
        let handler: ExitHandler = unsafe { std::mem::transmute::<usize, ExitHandler>(addr) };
        handler(sig);
    }
}

/// Forgets all handlers. Called in forked children, whose parent's cleanup must not run twice.
pub(crate) fn clear_exit_handlers() {
    COUNT.store(0, Ordering::Release);
    for slot in &HANDLERS {
        slot.store(0, Ordering::Relaxed);
    }
    RUNNING.store(false, Ordering::Release);
}

/// Returns the number of installed handlers.
pub fn exit_handler_count() -> usize {
    COUNT.load(Ordering::Acquire)
}

extern "C" fn run_at_exit() {
    run_exit_handlers(0);
}
