// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Log output of the command-line tools.
//!
//! Runner diagnostics go to stderr through `tracing`, one line per event with an `error:`,
//! `warning:` or `info:` heading. Test output never goes through here: the reporter prints
//! progress and the results directory keeps everything else.

use clap::{Args, ValueEnum};
use igt_runner::settings::LogLevel;
use owo_colors::{OwoColorize, Style};
use std::{fmt, sync::Once};
use tracing::{Event, Level, Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding a tracing target filter, for example
/// `igt_runner::executor=debug`. It replaces the filter derived from `--log-level`.
pub const LOG_ENV: &str = "IGT_RUNNER_LOG";

/// Log events with this target are printed without an `error:` or `warning:` heading.
pub(crate) const NO_HEADING_TARGET: &str = "igt_runner_cli::no_heading";

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// When to color runner output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    /// Installs the stderr logger, once per process, and returns the output context.
    ///
    /// `log_level` is the runner's `--log-level`: `quiet` shows warnings and errors, `normal`
    /// adds info, `verbose` adds debug.
    pub(crate) fn init(self, log_level: LogLevel) -> OutputContext {
        let output = OutputContext {
            colorize_stderr: self.color.enabled_for(supports_color::Stream::Stderr),
        };
        let targets = targets_from_env(std::env::var(LOG_ENV).ok().as_deref(), log_level);

        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let layer = tracing_subscriber::fmt::layer()
                .event_format(HeadingFormat {
                    colorize: output.colorize_stderr,
                })
                .with_writer(std::io::stderr)
                .with_filter(targets);
            tracing_subscriber::registry().with(layer).init();
        });
        output
    }
}

/// Whether color was requested and is usable for a tool's stderr.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    colorize_stderr: bool,
}

impl OutputContext {
    /// Returns true if stderr output, including progress lines, should be colored.
    pub(crate) fn colorize_stderr(&self) -> bool {
        self.colorize_stderr
    }

    /// Returns the styles used when printing errors.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.colorize_stderr {
            StderrStyles {
                bold: Style::new().bold(),
            }
        } else {
            StderrStyles::default()
        }
    }
}

/// The `--color` setting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

impl Color {
    fn enabled_for(self, stream: supports_color::Stream) -> bool {
        match self {
            Self::Auto => supports_color::on_cached(stream).is_some(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Builds the log filter: `IGT_RUNNER_LOG` if it is set and valid, else the `--log-level`.
fn targets_from_env(value: Option<&str>, log_level: LogLevel) -> Targets {
    let default = || {
        Targets::new().with_default(match log_level {
            LogLevel::Quiet => LevelFilter::WARN,
            LogLevel::Normal => LevelFilter::INFO,
            LogLevel::Verbose => LevelFilter::DEBUG,
        })
    };
    match value.filter(|value| !value.is_empty()) {
        Some(value) => value.parse().unwrap_or_else(|error| {
            eprintln!("warning: ignoring invalid {LOG_ENV} `{value}`: {error}");
            default()
        }),
        None => default(),
    }
}

/// Prints `heading: message`, with the heading left out for [`NO_HEADING_TARGET`].
struct HeadingFormat {
    colorize: bool,
}

impl HeadingFormat {
    fn heading(level: Level) -> (&'static str, Style) {
        match level {
            Level::ERROR => ("error", Style::new().red().bold()),
            Level::WARN => ("warning", Style::new().yellow().bold()),
            Level::INFO => ("info", Style::new().bold()),
            Level::DEBUG => ("debug", Style::new().bold()),
            Level::TRACE => ("trace", Style::new().dimmed()),
        }
    }
}

impl<S, N> FormatEvent<S, N> for HeadingFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let (heading, style) = Self::heading(*metadata.level());
            if self.colorize {
                write!(writer, "{}: ", heading.style(style))?;
            } else {
                write!(writer, "{heading}: ")?;
            }
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Styles for errors printed by `ExpectedError::display_to_stderr`.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, LogLevel::Quiet, Level::WARN, Level::INFO ; "quiet")]
    #[test_case(None, LogLevel::Normal, Level::INFO, Level::DEBUG ; "normal")]
    #[test_case(None, LogLevel::Verbose, Level::DEBUG, Level::TRACE ; "verbose")]
    #[test_case(Some(""), LogLevel::Normal, Level::INFO, Level::DEBUG ; "empty env")]
    #[test_case(Some("trace"), LogLevel::Quiet, Level::TRACE, Level::TRACE ; "env overrides")]
    #[test_case(Some("igt_runner=loud"), LogLevel::Quiet, Level::WARN, Level::INFO ; "invalid env")]
    fn log_filters(value: Option<&str>, log_level: LogLevel, enabled: Level, disabled: Level) {
        let targets = targets_from_env(value, log_level);
        assert!(targets.would_enable("igt_runner::executor", &enabled));
        if enabled != disabled {
            assert!(!targets.would_enable("igt_runner::executor", &disabled));
        }
    }

    #[test]
    fn per_target_env_filter() {
        let targets = targets_from_env(Some("igt_runner::executor=debug"), LogLevel::Normal);
        assert!(targets.would_enable("igt_runner::executor", &Level::DEBUG));
        assert!(!targets.would_enable("igt_runner::job_list", &Level::ERROR));
    }
}
