// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Exercises the subtest runtime in a real process. Each subtest is meant to be run on its own
//! with `--run-subtest`.

use igt_core::exit_handler::install_exit_handler;
use std::time::Duration;

/// When set, the binary declares a subtest with an invalid name first.
const INVALID_NAME_ENV: &str = "CORE_SELFTEST_INVALID_NAME";

fn write_stdout(text: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and `text` is a valid buffer.
    unsafe { libc::write(libc::STDOUT_FILENO, text.as_ptr().cast(), text.len()) };
}

fn first_handler(_sig: i32) {
    write_stdout(b"first exit handler\n");
}

fn second_handler(_sig: i32) {
    write_stdout(b"second exit handler\n");
}

fn main() {
    igt_core::TestMain::new()
        .description("Checks the subtest runtime from the outside.")
        .subtests(true)
        .run(|igt| {
            if std::env::var_os(INVALID_NAME_ENV).is_some() {
                igt.subtest("invalid name!", |_| write_stdout(b"body ran\n"));
            }

            igt.describe("Forks three workers that all pass.");
            igt.subtest("fork-pass", |igt| {
                igt.fork(3, |_, index| tracing::info!("worker {index} running"));
                igt.waitchildren();
            });

            igt.describe("Forks two workers, one of which fails.");
            igt.subtest("fork-fail", |igt| {
                igt.fork(2, |igt, index| {
                    if index == 1 {
                        igt.fail();
                    }
                });
                igt.waitchildren();
            });

            igt.subtest("fork-timeout", |igt| {
                igt.fork(1, |_, _| {
                    loop {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                });
                igt.waitchildren_timeout(1, "worker never exits");
            });

            igt.subtest("helper", |igt| {
                let mut helper = igt.fork_helper(|| {
                    loop {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                });
                igt.assert(helper.is_running(), "helper is running");
                igt.stop_helper(&mut helper);
            });

            igt.describe("Helpers that exit on their own don't affect waiting for workers.");
            igt.subtest("helper-exits-early", |igt| {
                let mut passing = igt.fork_helper(|| std::process::exit(0));
                let mut failing = igt.fork_helper(|| std::process::exit(3));
                igt.fork(1, |_, _| std::thread::sleep(Duration::from_millis(500)));
                igt.waitchildren();
                let passed = igt.wait_helper(&mut passing);
                igt.assert(passed, "passing helper exited with 0");
                let failed = igt.wait_helper(&mut failing);
                igt.assert(!failed, "failing helper exited with an error");
                igt.assert(!failing.is_running(), "failing helper was collected");
            });

            igt.subtest("exit-handlers", |igt| {
                let installed = install_exit_handler(first_handler)
                    .and_then(|()| install_exit_handler(second_handler));
                igt.assert(installed.is_ok(), "installed exit handlers");
            });

            igt.subtest("crash", |igt| {
                let installed = install_exit_handler(first_handler);
                igt.assert(installed.is_ok(), "installed exit handler");
                // SAFETY: raising a signal in the current process.
                unsafe { libc::raise(libc::SIGSEGV) };
            });

            igt.subtest_with_dynamic("empty-container", |_| {});

            igt.subtest("interactive-debug", |igt| {
                igt.debug_wait_key("core", "paused at a debug point");
                tracing::info!("continued after the debug point");
            });
        });
}
