// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Where a test binary's output goes: the terminal streams, the runner socket, or (in unit
//! tests) an in-memory capture.

use crate::comms::CommsClient;
use igt_metadata::{
    MarkerLine, SENTINEL_ON_STDERR_ENV, SubtestOutcome,
    comms::{LogStream, PacketBody},
    format_time,
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::Write,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

/// Set to any value to disable colors.
pub const PLAIN_OUTPUT_ENV: &str = "IGT_PLAIN_OUTPUT";


#[derive(Debug)]
enum Target {
    Terminal,
    Comms(CommsClient),
    Captured(Mutex<Vec<(LogStream, String)>>),
}

#[derive(Debug, Default)]
struct Styles {
    success: Style,
    skip: Style,
    fail: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.success = Style::new().green();
        self.skip = Style::new().yellow();
        self.fail = Style::new().red();
    }
}

/// The output sink shared by the logging layer and the subtest runtime.
#[derive(Debug)]
pub(crate) struct Output {
    target: Target,
    styles: Styles,
    sentinel_on_stderr: bool,
}

impl Output {
    /// Creates the output for a real test process.
    pub(crate) fn from_env() -> Self {
        let sentinel_on_stderr = std::env::var_os(SENTINEL_ON_STDERR_ENV).is_some();
        let mut styles = Styles::default();
        let target = match CommsClient::from_env() {
            Some(client) => Target::Comms(client),
            None => {
                if std::env::var_os(PLAIN_OUTPUT_ENV).is_none()
                    && supports_color::on_cached(supports_color::Stream::Stdout).is_some()
                {
                    styles.colorize();
                }
                Target::Terminal
            }
        };
        Self {
            target,
            styles,
            sentinel_on_stderr,
        }
    }

    /// Creates an output that records every line, for unit tests.
    pub(crate) fn captured(sentinel_on_stderr: bool) -> Self {
        Self {
            target: Target::Captured(Mutex::new(Vec::new())),
            styles: Styles::default(),
            sentinel_on_stderr,
        }
    }

    pub(crate) fn sentinel_on_stderr(&self) -> bool {
        self.sentinel_on_stderr
    }

    pub(crate) fn is_comms(&self) -> bool {
        matches!(self.target, Target::Comms(_))
    }

    /// Writes `text` (which should end with a newline) to `stream`.
    pub(crate) fn write(&self, stream: LogStream, text: &str) {
        match &self.target {
            Target::Terminal => {
                // Errors writing to the terminal are not actionable from a test binary.
                let _ = match stream {
                    LogStream::Stdout => {
                        let mut out = std::io::stdout().lock();
                        out.write_all(text.as_bytes()).and_then(|()| out.flush())
                    }
                    LogStream::Stderr => {
                        let mut err = std::io::stderr().lock();
                        err.write_all(text.as_bytes()).and_then(|()| err.flush())
                    }
                };
            }
            Target::Comms(client) => client.send(&PacketBody::Log {
                stream,
                text: text.into(),
            }),
            Target::Captured(lines) => lock(lines).push((stream, text.to_owned())),
        }
    }

    /// Prints a line to stdout, which is never redirected to the runner socket. Used for
    /// listing output.
    pub(crate) fn print_listing(&self, text: &str) {
        match &self.target {
            Target::Captured(lines) => lock(lines).push((LogStream::Stdout, format!("{text}\n"))),
            Target::Terminal | Target::Comms(_) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{text}").and_then(|()| out.flush());
            }
        }
    }

    /// Sends a structured packet if connected to the runner. Returns false otherwise.
    pub(crate) fn send_packet(&self, body: &PacketBody<'_>) -> bool {
        match &self.target {
            Target::Comms(client) => {
                client.send(body);
                true
            }
            Target::Terminal | Target::Captured(_) => false,
        }
    }

    /// Announces the start of a subtest or dynamic subtest.
    pub(crate) fn announce_start(&self, name: &str, dynamic: bool) {
        let body = if dynamic {
            PacketBody::DynamicSubtestStart { name: name.into() }
        } else {
            PacketBody::SubtestStart { name: name.into() }
        };
        if self.send_packet(&body) {
            return;
        }
        let marker = if dynamic {
            MarkerLine::DynamicSubtestStart {
                name: name.to_owned(),
            }
        } else {
            MarkerLine::SubtestStart {
                name: name.to_owned(),
            }
        };
        self.write_marker(&marker.to_string());
    }

    /// Announces the result of a subtest or dynamic subtest.
    pub(crate) fn announce_result(
        &self,
        name: &str,
        dynamic: bool,
        outcome: SubtestOutcome,
        time: Duration,
    ) {
        let timeused = format_time(time);
        let body = if dynamic {
            PacketBody::DynamicSubtestResult {
                name: name.into(),
                result: outcome.as_str().into(),
                timeused: timeused.as_str().into(),
                reason: "".into(),
            }
        } else {
            PacketBody::SubtestResult {
                name: name.into(),
                result: outcome.as_str().into(),
                timeused: timeused.as_str().into(),
                reason: "".into(),
            }
        };
        if self.send_packet(&body) {
            return;
        }

        let style = match outcome {
            SubtestOutcome::Success => self.styles.success,
            SubtestOutcome::Skip => self.styles.skip,
            SubtestOutcome::Fail | SubtestOutcome::Crash => self.styles.fail,
        };
        let kind = if dynamic { "Dynamic subtest" } else { "Subtest" };
        let plain = format!("{kind} {name}: {outcome} ({timeused}s)");
        let colored = format!(
            "{kind} {name}: {} ({timeused}s)",
            outcome.as_str().style(style)
        );
        self.write(LogStream::Stdout, &format!("{colored}\n"));
        if self.sentinel_on_stderr {
            self.write(LogStream::Stderr, &format!("{plain}\n"));
        }
    }

    /// Writes a marker line to stdout, and to stderr if the runner asked for sentinels.
    pub(crate) fn write_marker(&self, line: &str) {
        self.write(LogStream::Stdout, &format!("{line}\n"));
        if self.sentinel_on_stderr {
            self.write(LogStream::Stderr, &format!("{line}\n"));
        }
    }

    /// Returns the captured lines, for unit tests.
    #[cfg(test)]
    pub(crate) fn captured_lines(&self) -> Vec<(LogStream, String)> {
        match &self.target {
            Target::Captured(lines) => lock(lines).clone(),
            Target::Terminal | Target::Comms(_) => Vec::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
