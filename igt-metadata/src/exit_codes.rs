// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for igt test binaries.
///
/// A test binary's exit code is the only channel through which its overall status reaches the
/// runner when no comms socket is attached, so these values are fixed.
pub enum IgtExitCode {}

impl IgtExitCode {
    /// All executed subtests passed (or the plain test passed).
    pub const SUCCESS: i32 = 0;

    /// Every executed subtest was skipped, or a requirement of a plain test wasn't met.
    pub const SKIP: i32 = 77;

    /// A wall-clock timeout expired inside the test binary.
    pub const TIMEOUT: i32 = 78;

    /// The binary was invoked incorrectly, for example with a `--run-subtest` pattern that
    /// matched nothing, or `--list-subtests` on a binary without subtests.
    pub const INVALID: i32 = 79;

    /// An assertion failed.
    pub const FAILURE: i32 = 98;

    /// The test requested that the entire run be aborted.
    pub const ABORT: i32 = 112;

    /// Returns the exit code for a process killed by `signal`.
    pub const fn for_signal(signal: i32) -> i32 {
        128 + signal
    }

    /// If `code` denotes termination by a signal, returns the signal number.
    pub const fn signal_of(code: i32) -> Option<i32> {
        if code > 128 && code < 128 + 65 {
            Some(code - 128)
        } else {
            None
        }
    }
}

/// Documented exit codes for the `igt_runner`, `igt_resume` and `igt_results` binaries.
pub enum RunnerExitCode {}

impl RunnerExitCode {
    /// The run completed, regardless of individual test results.
    pub const OK: i32 = 0;

    /// The run was aborted before the job list was exhausted.
    pub const ABORTED: i32 = 1;

    /// Settings were invalid or the results directory could not be set up.
    pub const SETUP_ERROR: i32 = 96;

    /// Building the job list failed.
    pub const JOB_LIST_CREATION_FAILED: i32 = 104;

    /// An I/O or process error occurred while executing jobs.
    pub const EXECUTION_FAILED: i32 = 105;

    /// Generating results failed.
    pub const RESULTS_FAILED: i32 = 106;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
