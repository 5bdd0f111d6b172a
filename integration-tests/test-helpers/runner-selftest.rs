// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subtests that end runs in the ways the runner has to handle: hanging, flooding output and
//! tainting the (fake) kernel.

use std::time::Duration;

/// The file `taint-kernel` writes a bad taint value to.
const TAINT_FILE_ENV: &str = "RUNNER_SELFTEST_TAINT_FILE";

/// TAINT_WARN, which the runner treats as bad.
const BAD_TAINT: &str = "512\n";

fn main() {
    igt_core::TestMain::new()
        .description("Subtests that make the runner stop them or the run.")
        .subtests(true)
        .run(|igt| {
            igt.describe("Never finishes and never prints after starting.");
            igt.subtest("hang", |_| {
                tracing::info!("hanging");
                loop {
                    std::thread::sleep(Duration::from_secs(1));
                }
            });

            igt.describe("Marks the kernel as tainted, then passes.");
            igt.subtest("taint-kernel", |igt| {
                let path = std::env::var(TAINT_FILE_ENV);
                igt.assert(path.is_ok(), "taint file is set");
                if let Ok(path) = path {
                    let written = std::fs::write(path, BAD_TAINT);
                    igt.assert(written.is_ok(), "wrote taint file");
                }
            });

            igt.subtest("pass", |_| {});

            igt.describe("Prints without end.");
            igt.subtest("chatty", |_| {
                let line = "x".repeat(100);
                loop {
                    println!("{line}");
                }
            });
        });
}
