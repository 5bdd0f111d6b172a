// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logging for test binaries.
//!
//! Test content logs with the `tracing` macros. [`IgtLogLayer`] receives every event, appends it
//! to the [`LogBuffer`] regardless of level, and prints it if the active level allows. The
//! buffer is dumped when a subtest fails so the output leading up to the failure is visible
//! even when it wasn't printed.

use crate::output::Output;
use igt_metadata::comms::LogStream;
use std::{
    collections::VecDeque,
    fmt::{self, Write as _},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

/// The number of lines the log buffer keeps.
pub const LOG_BUFFER_SIZE: usize = 256;

/// Selects the minimum level that gets printed.
pub const LOG_LEVEL_ENV: &str = "IGT_LOG_LEVEL";

/// Log levels, from most to least verbose.
///
/// Info goes to stdout; everything else that gets printed goes to stderr.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum IgtLogLevel {
    /// Debug output, hidden unless requested.
    Debug,
    /// Informational output, on stdout.
    Info,
    /// Warnings, on stderr.
    Warn,
    /// Critical messages such as assertion failures, on stderr.
    Critical,
    /// Nothing is printed.
    None,
}

impl IgtLogLevel {
    fn from_tracing(level: Level) -> Self {
        match level {
            Level::ERROR => Self::Critical,
            Level::WARN => Self::Warn,
            Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARNING",
            Self::Critical => "CRITICAL",
            Self::None => "NONE",
        }
    }
}

impl FromStr for IgtLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "critical" => Ok(Self::Critical),
            "none" => Ok(Self::None),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// A bounded ring of recent log lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    /// Creates an empty buffer holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a line, dropping the oldest if full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Removes all lines.
    pub fn reset(&mut self) {
        self.lines.clear();
    }

    /// Returns the number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns the buffered lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Formats the dump printed on failure, and empties the buffer.
    pub fn take_dump(&mut self) -> String {
        let mut out = String::from("**** DEBUG ****\n");
        for line in self.lines.drain(..) {
            out.push_str(&line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("****  END  ****\n");
        out
    }
}

#[derive(Debug)]
struct LogSettings {
    level: IgtLogLevel,
    /// `Some("all")` enables debug output for every domain.
    debug_domain: Option<String>,
    prefix: String,
}

/// Logging state shared between the [`Igt`](crate::Igt) context and the tracing layer.
#[derive(Debug)]
pub(crate) struct LogShared {
    buffer: Mutex<LogBuffer>,
    settings: Mutex<LogSettings>,
    output: Arc<Output>,
}

impl LogShared {
    pub(crate) fn new(output: Arc<Output>, binary: &str, level: IgtLogLevel) -> Self {
        Self {
            buffer: Mutex::new(LogBuffer::new(LOG_BUFFER_SIZE)),
            settings: Mutex::new(LogSettings {
                level,
                debug_domain: None,
                prefix: format!("({binary}:{})", std::process::id()),
            }),
            output,
        }
    }

    /// Enables debug output for `domain`, or for everything if it is `all`.
    pub(crate) fn set_debug_domain(&self, domain: &str) {
        let mut settings = lock(&self.settings);
        settings.level = IgtLogLevel::Debug;
        settings.debug_domain = Some(domain.to_owned());
    }

    pub(crate) fn set_prefix(&self, prefix: String) {
        lock(&self.settings).prefix = prefix;
    }

    pub(crate) fn reset_buffer(&self) {
        lock(&self.buffer).reset();
    }

    /// Writes the buffer contents to stderr between markers and empties it.
    pub(crate) fn dump_buffer(&self) {
        let dump = lock(&self.buffer).take_dump();
        self.output.write(LogStream::Stderr, &dump);
    }

    #[cfg(test)]
    pub(crate) fn buffered_lines(&self) -> Vec<String> {
        lock(&self.buffer).lines().map(str::to_owned).collect()
    }

    /// Logs one message.
    pub(crate) fn log(&self, level: IgtLogLevel, domain: &str, message: &str) {
        let (print, line) = {
            let settings = lock(&self.settings);
            let prefix = &settings.prefix;
            let line = match level {
                IgtLogLevel::Info => format!("{message}\n"),
                IgtLogLevel::Debug => format!("{prefix} {domain}-DEBUG: {message}\n"),
                _ => format!("{prefix} {}: {message}\n", level.label()),
            };
            let print = level >= settings.level
                && settings.level != IgtLogLevel::None
                && (level != IgtLogLevel::Debug
                    || settings
                        .debug_domain
                        .as_deref()
                        .is_none_or(|d| d == "all" || d == domain));
            (print, line)
        };

        lock(&self.buffer).push(format!(
            "{} {}",
            level.label(),
            line.trim_end_matches('\n')
        ));

        if print {
            let stream = if level == IgtLogLevel::Info {
                LogStream::Stdout
            } else {
                LogStream::Stderr
            };
            self.output.write(stream, &line);
        }
    }
}

/// A `tracing` layer that routes events through the test binary's log.
#[derive(Debug)]
pub struct IgtLogLayer {
    shared: Arc<LogShared>,
}

impl IgtLogLayer {
    pub(crate) fn new(shared: Arc<LogShared>) -> Self {
        Self { shared }
    }
}

impl<S: Subscriber> Layer<S> for IgtLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.shared.log(
            IgtLogLevel::from_tracing(*metadata.level()),
            metadata.target(),
            &visitor.message,
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            let _ = write!(self.message, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{value:?}"));
        } else {
            let _ = write!(self.message, " {}={value:?}", field.name());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn buffer_is_bounded() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.lines().collect::<Vec<_>>(), ["line 2", "line 3", "line 4"]);
        assert_eq!(
            buffer.take_dump(),
            "**** DEBUG ****\nline 2\nline 3\nline 4\n****  END  ****\n"
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn layer_buffers_everything_and_prints_by_level() {
        let output = Arc::new(Output::captured(false));
        let shared = Arc::new(LogShared::new(output.clone(), "bin", IgtLogLevel::Info));
        shared.set_prefix("(bin:1)".to_owned());
        let subscriber = tracing_subscriber::registry().with(IgtLogLayer::new(shared.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(target: "kms", "hidden");
            tracing::info!("shown on stdout");
            tracing::warn!(count = 3, "careful");
        });

        assert_eq!(
            shared.buffered_lines(),
            [
                "DEBUG (bin:1) kms-DEBUG: hidden",
                "INFO shown on stdout",
                "WARNING (bin:1) WARNING: careful count=3",
            ]
        );
        assert_eq!(
            output.captured_lines(),
            [
                (LogStream::Stdout, "shown on stdout\n".to_owned()),
                (LogStream::Stderr, "(bin:1) WARNING: careful count=3\n".to_owned()),
            ]
        );
    }

    #[test]
    fn debug_domain_filter() {
        let output = Arc::new(Output::captured(false));
        let shared = LogShared::new(output.clone(), "bin", IgtLogLevel::Info);
        shared.set_prefix("(bin:1)".to_owned());
        shared.set_debug_domain("kms");
        shared.log(IgtLogLevel::Debug, "kms", "a");
        shared.log(IgtLogLevel::Debug, "core", "b");
        assert_eq!(
            output.captured_lines(),
            [(LogStream::Stderr, "(bin:1) kms-DEBUG: a\n".to_owned())]
        );
    }
}
