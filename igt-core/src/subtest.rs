// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The subtest state machine and control transfer.
//!
//! Bodies resolve early with [`Igt::skip`], [`Igt::fail`] and [`Igt::success`]. These never
//! return: they unwind with a private payload that the nearest fixture, subtest or dynamic
//! subtest boundary catches and turns into an outcome. An ordinary panic in a body is caught
//! the same way and counts as a failure.

use crate::{
    context::{CurrentDynamic, CurrentSubtest, Igt, Mode, Phase, SkipHenceforth},
    sigsafe::{self, CURRENT_DYNAMIC, CURRENT_SUBTEST},
};
use igt_metadata::{
    IgtExitCode, SubtestOutcome, is_valid_subtest_name, kmsg_dynamic_marker, kmsg_subtest_marker,
};
use std::{
    fmt::{self, Write as _},
    panic::{self, AssertUnwindSafe, Location},
    time::{Duration, Instant},
};

/// How a body ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Transfer {
    Success,
    Skip,
    Fail(i32),
}

/// The unwind payload carrying a [`Transfer`].
struct TransferPayload(Transfer);

pub(crate) fn transfer(transfer: Transfer) -> ! {
    panic::resume_unwind(Box::new(TransferPayload(transfer)))
}

impl Igt {
    /// Runs `body`, catching control transfers and panics.
    pub(crate) fn run_guarded<F>(&mut self, body: F) -> Transfer
    where
        F: FnOnce(&mut Igt),
    {
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        match result {
            Ok(()) => Transfer::Success,
            Err(payload) => {
                if self.fatal {
                    panic::resume_unwind(payload);
                }
                match payload.downcast::<TransferPayload>() {
                    Ok(payload) => payload.0,
                    // The panic hook has already reported the panic.
                    Err(_) => Transfer::Fail(IgtExitCode::FAILURE),
                }
            }
        }
    }

    // ---
    // Fixtures
    // ---

    /// Runs setup or teardown code shared between subtests.
    ///
    /// The body doesn't run when only listing subtests, or once an earlier fixture has given
    /// up. If the body skips, every following subtest is skipped; if it fails, every following
    /// subtest fails.
    pub fn fixture<F>(&mut self, body: F)
    where
        F: FnOnce(&mut Igt),
    {
        if !self.enter_fixture() {
            return;
        }
        let transfer = self.run_guarded(body);
        self.phase = Phase::Outside;
        match transfer {
            Transfer::Success => {}
            Transfer::Skip => self.skip_henceforth = SkipHenceforth::Skip,
            Transfer::Fail(code) => {
                self.log.dump_buffer();
                self.skip_henceforth = SkipHenceforth::Fail;
                self.record_failure(code);
            }
        }
    }

    fn enter_fixture(&mut self) -> bool {
        if !self.has_subtests {
            self.internal_assert_failed("fixtures are only allowed in tests with subtests");
        }
        if self.phase != Phase::Outside {
            self.internal_assert_failed("fixtures must not be nested in fixtures or subtests");
        }
        if self.mode != Mode::Run || self.skip_henceforth != SkipHenceforth::Continue {
            return false;
        }
        self.phase = Phase::Fixture;
        true
    }

    // ---
    // Subtests
    // ---

    /// Sets the description printed by `--describe` for the next subtest.
    pub fn describe(&mut self, description: impl Into<String>) {
        self.pending_description = Some(description.into());
    }

    /// Declares a subtest and runs `body` if it is selected.
    pub fn subtest<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce(&mut Igt),
    {
        self.run_subtest(name, false, body);
    }

    /// Declares a subtest that hosts dynamic subtests, and runs `body` if it is selected.
    ///
    /// The container's result is derived from its children: SKIP if no dynamic subtest ran,
    /// FAIL if any failed, SUCCESS otherwise. The container body itself may skip, but not
    /// fail.
    pub fn subtest_with_dynamic<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce(&mut Igt),
    {
        self.run_subtest(name, true, body);
    }

    fn run_subtest<F>(&mut self, name: &str, hosts_dynamic: bool, body: F)
    where
        F: FnOnce(&mut Igt),
    {
        if !self.enter_subtest(name, hosts_dynamic) {
            return;
        }
        let transfer = match self.skip_henceforth {
            SkipHenceforth::Continue => self.run_guarded(body),
            SkipHenceforth::Skip => Transfer::Skip,
            SkipHenceforth::Fail => Transfer::Fail(IgtExitCode::FAILURE),
        };
        self.leave_subtest(transfer);
    }

    /// Returns true if the body should run.
    fn enter_subtest(&mut self, name: &str, hosts_dynamic: bool) -> bool {
        let description = self.pending_description.take();
        if !is_valid_subtest_name(name) {
            self.internal_assert_failed(&format!("invalid subtest name \"{name}\""));
        }
        if self.phase != Phase::Outside {
            self.internal_assert_failed("subtests must not be nested in fixtures or subtests");
        }

        match self.mode {
            Mode::List => {
                self.output.print_listing(name);
                return false;
            }
            Mode::Describe => {
                if self
                    .describe_filter
                    .as_ref()
                    .is_none_or(|filter| filter.is_match(name))
                {
                    let description = description.as_deref().unwrap_or("NO DOCUMENTATION!");
                    let mut text = format!("SUB {name}:\n");
                    for line in description.lines() {
                        let _ = writeln!(text, "  {line}");
                    }
                    self.output.print_listing(text.trim_end_matches('\n'));
                }
                return false;
            }
            Mode::Run => {}
        }

        if let Some(filter) = &self.run_filter {
            if !filter.is_match(name) {
                return false;
            }
            self.run_filter_matched = true;
        }

        self.log.reset_buffer();
        let start = Instant::now();
        CURRENT_SUBTEST.set(name, sigsafe::monotonic_ns());
        self.current = Some(CurrentSubtest {
            name: name.to_owned(),
            start,
            hosts_dynamic,
            dynamic_executed: 0,
            dynamic_failed: false,
        });
        self.phase = Phase::Subtest;
        self.output.announce_start(name, false);
        if let Some(kmsg) = &mut self.kmsg {
            kmsg.write(&kmsg_subtest_marker(&self.binary, name));
        }
        true
    }

    fn leave_subtest(&mut self, transfer: Transfer) {
        let Some(current) = self.current.take() else {
            self.internal_assert_failed("subtest ended without being entered");
        };

        let outcome = if current.hosts_dynamic && self.skip_henceforth == SkipHenceforth::Continue {
            match transfer {
                Transfer::Fail(_) => {
                    self.current = Some(current);
                    self.internal_assert_failed(
                        "dynamic subtest containers may only fail through a dynamic subtest",
                    );
                }
                Transfer::Skip | Transfer::Success if current.dynamic_failed => {
                    SubtestOutcome::Fail
                }
                Transfer::Skip => SubtestOutcome::Skip,
                Transfer::Success if current.dynamic_executed == 0 => SubtestOutcome::Skip,
                Transfer::Success => SubtestOutcome::Success,
            }
        } else {
            match transfer {
                Transfer::Success => SubtestOutcome::Success,
                Transfer::Skip => SubtestOutcome::Skip,
                Transfer::Fail(code) => {
                    if self.skip_henceforth == SkipHenceforth::Continue {
                        self.log.dump_buffer();
                    }
                    self.record_failure(code);
                    SubtestOutcome::Fail
                }
            }
        };

        match outcome {
            SubtestOutcome::Success => self.succeeded_one = true,
            SubtestOutcome::Skip => self.skipped_one = true,
            SubtestOutcome::Fail | SubtestOutcome::Crash => {
                // Dynamic failures were recorded when the child failed.
                self.failed_one = true;
            }
        }

        self.cleanup_after_subtest();
        self.output
            .announce_result(&current.name, false, outcome, current.start.elapsed());
        CURRENT_SUBTEST.clear();
        self.phase = Phase::Outside;
    }

    // ---
    // Dynamic subtests
    // ---

    /// Declares and runs a dynamic subtest inside a dynamic subtest container.
    pub fn dynamic<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce(&mut Igt),
    {
        if !self.enter_dynamic(name) {
            return;
        }
        let transfer = self.run_guarded(body);
        self.leave_dynamic(transfer);
    }

    fn enter_dynamic(&mut self, name: &str) -> bool {
        match self.phase {
            Phase::Subtest if self.current.as_ref().is_some_and(|c| c.hosts_dynamic) => {}
            Phase::Dynamic => {
                self.internal_assert_failed("dynamic subtests must not be nested")
            }
            _ => self.internal_assert_failed(
                "dynamic subtests are only allowed inside a dynamic subtest container",
            ),
        }
        if !is_valid_subtest_name(name) {
            self.internal_assert_failed(&format!("invalid dynamic subtest name \"{name}\""));
        }
        if let Some(filter) = &self.dynamic_filter {
            if !filter.is_match(name) {
                return false;
            }
        }

        if let Some(current) = &mut self.current {
            current.dynamic_executed += 1;
        }
        self.log.reset_buffer();
        CURRENT_DYNAMIC.set(name, sigsafe::monotonic_ns());
        self.current_dynamic = Some(CurrentDynamic {
            name: name.to_owned(),
            start: Instant::now(),
        });
        self.phase = Phase::Dynamic;
        self.output.announce_start(name, true);
        if let Some(kmsg) = &mut self.kmsg {
            kmsg.write(&kmsg_dynamic_marker(&self.binary, name));
        }
        true
    }

    fn leave_dynamic(&mut self, transfer: Transfer) {
        let Some(dynamic) = self.current_dynamic.take() else {
            self.internal_assert_failed("dynamic subtest ended without being entered");
        };
        let outcome = match transfer {
            Transfer::Success => SubtestOutcome::Success,
            Transfer::Skip => SubtestOutcome::Skip,
            Transfer::Fail(code) => {
                self.log.dump_buffer();
                self.record_failure(code);
                if let Some(current) = &mut self.current {
                    current.dynamic_failed = true;
                }
                SubtestOutcome::Fail
            }
        };
        self.cleanup_after_subtest();
        self.output
            .announce_result(&dynamic.name, true, outcome, dynamic.start.elapsed());
        CURRENT_DYNAMIC.clear();
        self.phase = Phase::Subtest;
    }

    fn cleanup_after_subtest(&mut self) {
        if !self.test_mode {
            crate::fork::kill_children();
        }
    }

    // ---
    // Resolution
    // ---

    fn check_resolution_context(&mut self, what: &str) {
        if self.fork_child.is_some() {
            return;
        }
        if self.has_subtests && self.phase == Phase::Outside {
            self.internal_assert_failed(&format!(
                "{what} called outside a fixture, subtest or dynamic subtest"
            ));
        }
    }

    /// Ends the current subtest (or fixture, or plain test) with SKIP.
    #[track_caller]
    pub fn skip(&mut self, message: impl fmt::Display) -> ! {
        self.check_resolution_context("skip");
        tracing::info!(target: "igt_core", "Test requirement not met: {message}");
        transfer(Transfer::Skip)
    }

    /// Ends the current subtest (or fixture, or plain test) with FAIL.
    #[track_caller]
    pub fn fail(&mut self) -> ! {
        self.fail_with_code(IgtExitCode::FAILURE)
    }

    /// Ends the current subtest with FAIL and sets the process exit code to `code` if this is
    /// the first failure.
    #[track_caller]
    pub fn fail_with_code(&mut self, code: i32) -> ! {
        if code == IgtExitCode::SUCCESS || code == IgtExitCode::SKIP {
            self.internal_assert_failed("failure exit code must be neither 0 nor 77");
        }
        self.check_resolution_context("fail");
        transfer(Transfer::Fail(code))
    }

    /// Ends the current subtest (or fixture, or plain test) with SUCCESS.
    pub fn success(&mut self) -> ! {
        self.check_resolution_context("success");
        transfer(Transfer::Success)
    }

    /// Fails the current subtest with a diagnostic if `condition` is false.
    #[track_caller]
    pub fn assert(&mut self, condition: bool, message: impl fmt::Display) {
        if !condition {
            let location = Location::caller();
            tracing::error!(
                target: "igt_core",
                "Test assertion failure at {}:{}:\nFailed assertion: {message}",
                location.file(),
                location.line()
            );
            self.fail();
        }
    }

    /// Fails the current subtest if `left != right`.
    #[track_caller]
    pub fn assert_eq<T>(&mut self, left: T, right: T)
    where
        T: PartialEq + fmt::Debug,
    {
        if left != right {
            let message = format!("{left:?} == {right:?}");
            self.assert(false, message);
        }
    }

    /// Skips the current subtest with a diagnostic if `condition` is false.
    #[track_caller]
    pub fn require(&mut self, condition: bool, message: impl fmt::Display) {
        if !condition {
            let location = Location::caller();
            tracing::info!(
                target: "igt_core",
                "Test requirement not met at {}:{}:\nTest requirement: {message}",
                location.file(),
                location.line()
            );
            self.check_resolution_context("require");
            transfer(Transfer::Skip);
        }
    }

    /// Aborts the whole run if `condition` is true.
    ///
    /// The process exits immediately with [`IgtExitCode::ABORT`] after running exit handlers,
    /// and the runner stops executing further jobs.
    #[track_caller]
    pub fn abort_on(&mut self, condition: bool, message: impl fmt::Display) {
        if !condition {
            return;
        }
        let location = Location::caller();
        tracing::error!(
            target: "igt_core",
            "Test abort at {}:{}:\nabort condition: {message}",
            location.file(),
            location.line()
        );
        self.log.dump_buffer();
        if self.test_mode {
            self.fatal = true;
            panic!("test abort: {message}");
        }
        self.failed_one = true;
        self.exit_code = IgtExitCode::ABORT;
        self.output.send_packet(&igt_metadata::comms::PacketBody::Exit {
            code: IgtExitCode::ABORT,
            timeused: igt_metadata::format_time(self.start.elapsed()).into(),
        });
        std::process::exit(IgtExitCode::ABORT)
    }

    /// Time spent in the current subtest, or since start if none is running.
    pub fn elapsed(&self) -> Duration {
        match &self.current {
            Some(current) => current.start.elapsed(),
            None => self.start.elapsed(),
        }
    }
}
