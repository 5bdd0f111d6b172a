// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    cli::TestArgs,
    config::IgtConfig,
    kmsg::KmsgWriter,
    log::{IgtLogLevel, LogShared},
    output::Output,
};
use igt_metadata::{IgtExitCode, PatternParseError, SubtestPatternList, comms::PacketBody};
use nix::{sys::wait::WaitStatus, unistd::Pid};
use std::{sync::Arc, time::Instant};

/// What the binary was asked to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
    /// Run the selected subtests.
    Run,
    /// `--list-subtests`: print names, run nothing.
    List,
    /// `--describe`: print descriptions, run nothing.
    Describe,
}

/// Where execution currently is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Outside,
    Fixture,
    Subtest,
    Dynamic,
}

/// Forced resolution of all remaining subtests after a fixture gave up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SkipHenceforth {
    Continue,
    Skip,
    Fail,
}

#[derive(Debug)]
pub(crate) struct CurrentSubtest {
    pub(crate) name: String,
    pub(crate) start: Instant,
    pub(crate) hosts_dynamic: bool,
    pub(crate) dynamic_executed: usize,
    pub(crate) dynamic_failed: bool,
}

#[derive(Debug)]
pub(crate) struct CurrentDynamic {
    pub(crate) name: String,
    pub(crate) start: Instant,
}

/// The per-process test context.
///
/// One `Igt` is created when the binary starts and is passed to every fixture, subtest and
/// dynamic subtest body. It owns the subtest state machine, the accumulated exit status and
/// handles to the output and logging sinks. Forked children get the parent's context
/// reinitialized for their own use.
#[derive(Debug)]
pub struct Igt {
    pub(crate) binary: String,
    pub(crate) args: TestArgs,
    pub(crate) config: IgtConfig,
    pub(crate) output: Arc<Output>,
    pub(crate) log: Arc<LogShared>,
    pub(crate) kmsg: Option<KmsgWriter>,
    pub(crate) start: Instant,

    pub(crate) has_subtests: bool,
    pub(crate) mode: Mode,
    pub(crate) run_filter: Option<SubtestPatternList>,
    pub(crate) dynamic_filter: Option<SubtestPatternList>,
    pub(crate) describe_filter: Option<SubtestPatternList>,
    pub(crate) run_filter_matched: bool,

    pub(crate) phase: Phase,
    pub(crate) skip_henceforth: SkipHenceforth,
    pub(crate) current: Option<CurrentSubtest>,
    pub(crate) current_dynamic: Option<CurrentDynamic>,
    pub(crate) pending_description: Option<String>,

    pub(crate) succeeded_one: bool,
    pub(crate) skipped_one: bool,
    pub(crate) failed_one: bool,
    pub(crate) exit_code: i32,

    /// Set in forked children: 0 for `fork`, the child index + 1 for `multi_fork`.
    pub(crate) fork_child: Option<usize>,

    /// Helpers that exited while workers were being waited for, with their status.
    pub(crate) reaped_helpers: Vec<(Pid, WaitStatus)>,

    /// Set when an internal assertion is unwinding, so subtest boundaries let it through.
    pub(crate) fatal: bool,
    pub(crate) test_mode: bool,
}

impl Igt {
    pub(crate) fn new(
        binary: String,
        args: TestArgs,
        has_subtests: bool,
        config: IgtConfig,
        output: Arc<Output>,
        log: Arc<LogShared>,
    ) -> Result<Self, PatternParseError> {
        let mode = if args.list_subtests {
            Mode::List
        } else if args.describe.is_some() {
            Mode::Describe
        } else {
            Mode::Run
        };
        let run_filter = args.run_subtest.as_deref().map(str::parse).transpose()?;
        let dynamic_filter = args.dynamic_subtest.as_deref().map(str::parse).transpose()?;
        let describe_filter = args.describe.as_deref().map(str::parse).transpose()?;

        if let Some(domain) = args.debug.as_deref().or(config.debug_domain.as_deref()) {
            log.set_debug_domain(domain);
        }

        Ok(Self {
            binary,
            args,
            config,
            output,
            log,
            kmsg: None,
            start: Instant::now(),
            has_subtests,
            mode,
            run_filter,
            dynamic_filter,
            describe_filter,
            run_filter_matched: false,
            phase: Phase::Outside,
            skip_henceforth: SkipHenceforth::Continue,
            current: None,
            current_dynamic: None,
            pending_description: None,
            succeeded_one: false,
            skipped_one: false,
            failed_one: false,
            exit_code: IgtExitCode::SUCCESS,
            fork_child: None,
            reaped_helpers: Vec::new(),
            fatal: false,
            test_mode: false,
        })
    }

    /// Creates a context that captures its output, for unit tests.
    #[cfg(test)]
    pub(crate) fn for_test(args: &[&str], has_subtests: bool) -> Self {
        use clap::Parser;

        let args = TestArgs::try_parse_from(args).expect("valid test arguments");
        let output = Arc::new(Output::captured(true));
        let log = Arc::new(LogShared::new(output.clone(), "selftest", IgtLogLevel::Info));
        let mut igt = Self::new(
            "selftest".to_owned(),
            args,
            has_subtests,
            IgtConfig::default(),
            output,
            log,
        )
        .expect("valid patterns");
        igt.test_mode = true;
        igt
    }

    /// Returns the name of this binary.
    pub fn binary_name(&self) -> &str {
        &self.binary
    }

    /// Returns true if the binary was started to list or describe subtests rather than run them.
    pub fn only_list_subtests(&self) -> bool {
        self.mode != Mode::Run
    }

    /// Returns the name of the running subtest, if any.
    pub fn current_subtest(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.name.as_str())
    }

    /// Returns the name of the running dynamic subtest, if any.
    pub fn current_dynamic_subtest(&self) -> Option<&str> {
        self.current_dynamic.as_ref().map(|c| c.name.as_str())
    }

    /// Returns true if `--skip-crc-compare` was passed.
    pub fn skip_crc_compare(&self) -> bool {
        self.args.skip_crc_compare
    }

    /// Returns true if `--trace-on-oops` was passed.
    pub fn trace_on_oops(&self) -> bool {
        self.args.trace_on_oops
    }

    /// Returns the device filter from `--device`, `IGT_DEVICE` or the configuration file, in
    /// that order of precedence.
    pub fn device_filter(&self) -> Option<&str> {
        self.args
            .device
            .as_deref()
            .or(self.config.device.as_deref())
    }

    /// Returns the driver forced with `IGT_FORCE_DRIVER`.
    pub fn force_driver(&self) -> Option<&str> {
        self.config.force_driver.as_deref()
    }

    /// Returns the frame dump directory from `IGT_FRAME_DUMP_PATH` or the configuration file.
    pub fn frame_dump_path(&self) -> Option<&camino::Utf8Path> {
        self.config.frame_dump_path.as_deref()
    }

    /// Blocks until a key is pressed on stdin, if `--interactive-debug` selected `domain`.
    pub fn debug_wait_key(&self, domain: &str, message: &str) {
        let Some(selected) = self.args.interactive_debug.as_deref() else {
            return;
        };
        if selected != "all" && selected != domain {
            return;
        }
        tracing::info!(target: "igt_core", "{message}");
        tracing::info!(target: "igt_core", "[Press enter to continue]");
        let mut line = String::new();
        if let Err(error) = std::io::stdin().read_line(&mut line) {
            tracing::debug!(target: "igt_core", "reading from stdin failed: {error}");
        }
    }

    /// Returns the process exit code as it stands now.
    pub fn exit_code(&self) -> i32 {
        if self.mode != Mode::Run {
            return IgtExitCode::SUCCESS;
        }
        if self.run_filter.is_some() && !self.run_filter_matched {
            return IgtExitCode::INVALID;
        }
        if !self.has_subtests || self.failed_one {
            return self.exit_code;
        }
        if self.skipped_one && !self.succeeded_one {
            return IgtExitCode::SKIP;
        }
        IgtExitCode::SUCCESS
    }

    /// Records a failure with `code`. The first failure determines the exit code.
    pub(crate) fn record_failure(&mut self, code: i32) {
        if !self.failed_one {
            self.exit_code = code;
        }
        self.failed_one = true;
    }

    /// Finishes the run: reports an unmatched `--run-subtest`, sends the exit packet and
    /// returns the exit code.
    pub(crate) fn finish(&mut self) -> i32 {
        let code = self.exit_code();
        if self.mode == Mode::Run && code == IgtExitCode::INVALID && !self.run_filter_matched {
            if let Some(pattern) = &self.args.run_subtest {
                tracing::error!(target: "igt_core", "Unknown subtest: {pattern}");
            }
        }
        if self.mode == Mode::Run {
            let timeused = igt_metadata::format_time(self.start.elapsed());
            self.output.send_packet(&PacketBody::Exit {
                code,
                timeused: timeused.into(),
            });
        }
        code
    }

    /// Reports a broken invariant of the subtest runtime and terminates.
    ///
    /// Outside of unit tests this aborts the process, which goes through the crash handler.
    #[track_caller]
    pub(crate) fn internal_assert_failed(&mut self, message: &str) -> ! {
        let location = std::panic::Location::caller();
        tracing::error!(
            target: "igt_core",
            "internal assertion failure at {}:{}: {message}",
            location.file(),
            location.line()
        );
        if self.test_mode {
            self.fatal = true;
            panic!("internal assertion failure: {message}");
        }
        std::process::abort()
    }
}

/// The default log level, read from `IGT_LOG_LEVEL`.
pub(crate) fn log_level_from_env() -> IgtLogLevel {
    match std::env::var(crate::log::LOG_LEVEL_ENV) {
        Ok(value) => value.parse().unwrap_or(IgtLogLevel::Info),
        Err(_) => IgtLogLevel::Info,
    }
}
