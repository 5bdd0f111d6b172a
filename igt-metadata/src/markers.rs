// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable marker lines printed by test binaries.
//!
//! When no comms socket is attached, these lines on stdout are the only structured record of
//! which subtests ran. The runner parses them back with [`MarkerLine::parse`].

use crate::SubtestOutcome;
use regex::Regex;
use std::{fmt, sync::LazyLock, time::Duration};

/// Set by the runner so that test binaries duplicate marker lines on stderr.
pub const SENTINEL_ON_STDERR_ENV: &str = "IGT_SENTINEL_ON_STDERR";

/// Prefix of the version line printed at the start of a real run.
pub const VERSION_PREFIX: &str = "IGT-Version: ";

/// Prefix of the kernel log marker written when a subtest starts.
pub const KMSG_MARKER_PREFIX: &str = "[IGT] ";

/// A marker line, as printed by a test binary.
#[derive(Clone, Debug, PartialEq)]
pub enum MarkerLine {
    /// `Starting subtest: <name>`
    SubtestStart {
        /// The subtest name.
        name: String,
    },

    /// `Starting dynamic subtest: <name>`
    DynamicSubtestStart {
        /// The dynamic subtest name.
        name: String,
    },

    /// `Subtest <name>: <RESULT> (<secs>s)`
    SubtestResult {
        /// The subtest name.
        name: String,
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time spent in the subtest.
        time: Duration,
    },

    /// `Dynamic subtest <name>: <RESULT> (<secs>s)`
    DynamicSubtestResult {
        /// The dynamic subtest name.
        name: String,
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time spent in the dynamic subtest.
        time: Duration,
    },

    /// `<RESULT> (<secs>s)`, printed at exit by a binary without subtests.
    PlainResult {
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time since the binary started.
        time: Duration,
    },
}

static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Result lines may carry an ANSI color around the outcome word.
    Regex::new(
        r"^(?P<dynamic>Dynamic s|S)ubtest (?P<name>[A-Za-z0-9_-]+): (?:\x1b\[[0-9;]*m)?(?P<outcome>[A-Z]+)(?:\x1b\[[0-9;]*m)? \((?P<time>[0-9]+(?:\.[0-9]+)?)s\)\s*$",
    )
    .expect("result regex is valid")
});

static PLAIN_RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\x1b\[[0-9;]*m)?(?P<outcome>[A-Z]+)(?:\x1b\[[0-9;]*m)? \((?P<time>[0-9]+(?:\.[0-9]+)?)s\)\s*$")
        .expect("plain result regex is valid")
});

impl MarkerLine {
    /// Parses a single line of output, returning `None` if it isn't a marker.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(name) = line.strip_prefix("Starting subtest: ") {
            return Some(Self::SubtestStart {
                name: name.trim().to_owned(),
            });
        }
        if let Some(name) = line.strip_prefix("Starting dynamic subtest: ") {
            return Some(Self::DynamicSubtestStart {
                name: name.trim().to_owned(),
            });
        }

        if let Some(captures) = PLAIN_RESULT_RE.captures(line) {
            return Some(Self::PlainResult {
                outcome: captures["outcome"].parse().ok()?,
                time: parse_time(&captures["time"])?,
            });
        }

        let captures = RESULT_RE.captures(line)?;
        let name = captures["name"].to_owned();
        let outcome = captures["outcome"].parse().ok()?;
        let time = parse_time(&captures["time"])?;
        if &captures["dynamic"] == "S" {
            Some(Self::SubtestResult {
                name,
                outcome,
                time,
            })
        } else {
            Some(Self::DynamicSubtestResult {
                name,
                outcome,
                time,
            })
        }
    }

    /// Returns true if this line is one of the markers a test binary may also write to stderr.
    pub fn is_marker(line: &str) -> bool {
        Self::parse(line).is_some() || line.starts_with(VERSION_PREFIX)
    }
}

impl fmt::Display for MarkerLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SubtestStart { name } => write!(f, "Starting subtest: {name}"),
            Self::DynamicSubtestStart { name } => write!(f, "Starting dynamic subtest: {name}"),
            Self::SubtestResult {
                name,
                outcome,
                time,
            } => write!(f, "Subtest {name}: {outcome} ({})", DisplayTime(*time)),
            Self::DynamicSubtestResult {
                name,
                outcome,
                time,
            } => write!(
                f,
                "Dynamic subtest {name}: {outcome} ({})",
                DisplayTime(*time)
            ),
            Self::PlainResult { outcome, time } => write!(f, "{outcome} ({})", DisplayTime(*time)),
        }
    }
}

/// Displays a duration the way markers and journals record it: seconds with three decimals and
/// a trailing `s`.
#[derive(Clone, Copy, Debug)]
pub struct DisplayTime(pub Duration);

impl fmt::Display for DisplayTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

/// Formats a duration as seconds with three decimals, without a unit.
pub fn format_time(time: Duration) -> String {
    format!("{:.3}", time.as_secs_f64())
}

/// Parses a time in seconds such as `1.234`, with or without a trailing `s`.
pub fn parse_time(input: &str) -> Option<Duration> {
    let input = input.trim();
    let input = input.strip_suffix('s').unwrap_or(input);
    let (whole, frac) = input.split_once('.').unwrap_or((input, ""));
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: u64 = whole.parse().ok()?;
    // Nanosecond precision is plenty; extra digits are truncated.
    let mut nanos = 0u32;
    for i in 0..9 {
        let digit = frac.as_bytes().get(i).map_or(0, |b| u32::from(b - b'0'));
        nanos = nanos * 10 + digit;
    }
    Some(Duration::new(secs, nanos))
}

/// Formats the kernel log marker for a subtest start.
pub fn kmsg_subtest_marker(binary: &str, subtest: &str) -> String {
    format!("{KMSG_MARKER_PREFIX}{binary}: starting subtest {subtest}")
}

/// Formats the kernel log marker for a dynamic subtest start.
pub fn kmsg_dynamic_marker(binary: &str, dynamic: &str) -> String {
    format!("{KMSG_MARKER_PREFIX}{binary}: starting dynamic subtest {dynamic}")
}

/// A kernel log marker, parsed back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KmsgMarker<'a> {
    /// A subtest started.
    Subtest {
        /// The binary name.
        binary: &'a str,
        /// The subtest name.
        name: &'a str,
    },
    /// A dynamic subtest started.
    Dynamic {
        /// The binary name.
        binary: &'a str,
        /// The dynamic subtest name.
        name: &'a str,
    },
}

impl<'a> KmsgMarker<'a> {
    /// Parses the message part of a kernel log record.
    pub fn parse(message: &'a str) -> Option<Self> {
        let rest = message.strip_prefix(KMSG_MARKER_PREFIX)?;
        let (binary, rest) = rest.split_once(": ")?;
        if let Some(name) = rest.strip_prefix("starting dynamic subtest ") {
            Some(Self::Dynamic {
                binary,
                name: name.trim_end(),
            })
        } else {
            let name = rest.strip_prefix("starting subtest ")?;
            Some(Self::Subtest {
                binary,
                name: name.trim_end(),
            })
        }
    }
}
