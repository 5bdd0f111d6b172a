// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The entry point of a test binary.

use crate::{
    cli::TestArgs,
    config::IgtConfig,
    context::{Igt, Mode, log_level_from_env},
    kmsg::KmsgWriter,
    log::{IgtLogLayer, LogShared},
    output::Output,
    signal,
    subtest::Transfer,
    version::version_line,
};
use clap::Parser;
use igt_metadata::{IgtExitCode, MarkerLine, SubtestOutcome, comms::PacketBody};
use std::{ffi::OsString, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Builder for a test binary's `main` function.
///
/// ```no_run
/// igt_core::TestMain::new()
///     .description("Checks that the universe still works.")
///     .subtests(true)
///     .run(|igt| {
///         igt.subtest("basic", |igt| igt.assert(1 + 1 == 2, "arithmetic"));
///     });
/// ```
#[derive(Debug, Default)]
pub struct TestMain {
    description: Option<String>,
    has_subtests: bool,
    args: Option<Vec<OsString>>,
}

impl TestMain {
    /// Creates a builder for a binary without subtests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the text printed by `--help-description`.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares whether the binary is organized into subtests.
    pub fn subtests(mut self, has_subtests: bool) -> Self {
        self.has_subtests = has_subtests;
        self
    }

    /// Uses `args` instead of the process arguments.
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Runs the binary and exits the process with its exit code.
    pub fn run<F>(self, body: F) -> !
    where
        F: FnOnce(&mut Igt),
    {
        let code = self.run_inner(body);
        std::process::exit(code)
    }

    fn run_inner<F>(self, body: F) -> i32
    where
        F: FnOnce(&mut Igt),
    {
        let args = self.args.unwrap_or_else(|| std::env::args_os().collect());
        let binary = binary_name(args.first());

        let args = match TestArgs::try_parse_from(&args) {
            Ok(args) => args,
            Err(error) => {
                let _ = error.print();
                return if error.use_stderr() {
                    IgtExitCode::INVALID
                } else {
                    IgtExitCode::SUCCESS
                };
            }
        };

        let output = Arc::new(Output::from_env());
        let log = Arc::new(LogShared::new(output.clone(), &binary, log_level_from_env()));
        let _ = tracing_subscriber::registry()
            .with(IgtLogLayer::new(log.clone()))
            .try_init();

        let config = match IgtConfig::from_env() {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(target: "igt_core", "{error}");
                IgtConfig::default()
            }
        };

        let hook_log = log.clone();
        std::panic::set_hook(Box::new(move |info| {
            hook_log.log(crate::log::IgtLogLevel::Critical, "igt_core", &info.to_string());
        }));

        signal::install_fatal_handlers(output.sentinel_on_stderr());

        if args.help_description {
            if let Some(description) = &self.description {
                output.print_listing(description);
            }
            return IgtExitCode::SUCCESS;
        }
        if args.list_subtests && !self.has_subtests {
            return IgtExitCode::INVALID;
        }

        let mut igt = match Igt::new(binary, args, self.has_subtests, config, output, log) {
            Ok(igt) => igt,
            Err(error) => {
                tracing::error!(target: "igt_core", "{error}");
                return IgtExitCode::INVALID;
            }
        };

        if igt.mode == Mode::Run {
            igt.kmsg = KmsgWriter::open();
            let version = version_line();
            if !igt.output.send_packet(&PacketBody::VersionString {
                text: version.as_str().into(),
            }) {
                igt.output.print_listing(&version);
            }
            let command_line = std::env::args().collect::<Vec<_>>().join(" ");
            igt.output.send_packet(&PacketBody::Exec {
                command_line: command_line.into(),
            });
        }

        let transfer = igt.run_guarded(body);
        if igt.has_subtests {
            if let Transfer::Fail(code) = transfer {
                igt.record_failure(code);
            }
        } else if igt.mode == Mode::Run {
            let outcome = match transfer {
                Transfer::Success => SubtestOutcome::Success,
                Transfer::Skip => {
                    igt.exit_code = IgtExitCode::SKIP;
                    SubtestOutcome::Skip
                }
                Transfer::Fail(code) => {
                    igt.log.dump_buffer();
                    igt.record_failure(code);
                    SubtestOutcome::Fail
                }
            };
            let line = MarkerLine::PlainResult {
                outcome,
                time: igt.start.elapsed(),
            };
            igt.output.write_marker(&line.to_string());
        }

        igt.finish()
    }
}

fn binary_name(argv0: Option<&OsString>) -> String {
    argv0
        .map(std::path::Path::new)
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "igt-test".to_owned())
}

/// Runs a binary organized into subtests.
pub fn main<F>(body: F) -> !
where
    F: FnOnce(&mut Igt),
{
    TestMain::new().subtests(true).run(body)
}

/// Runs a binary without subtests.
pub fn simple_main<F>(body: F) -> !
where
    F: FnOnce(&mut Igt),
{
    TestMain::new().run(body)
}
