// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::OutcomeParseError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The terminal state of a subtest or dynamic subtest, as reported by the test binary itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubtestOutcome {
    /// The subtest ran to completion without a failed assertion.
    Success,

    /// A requirement wasn't met.
    Skip,

    /// An assertion failed.
    Fail,

    /// The process was killed by a fatal signal while the subtest was running.
    Crash,
}

impl SubtestOutcome {
    /// Returns the string variants this type can be parsed from.
    pub fn variants() -> [&'static str; 4] {
        ["SUCCESS", "SKIP", "FAIL", "CRASH"]
    }

    /// Returns the marker word for this outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            SubtestOutcome::Success => "SUCCESS",
            SubtestOutcome::Skip => "SKIP",
            SubtestOutcome::Fail => "FAIL",
            SubtestOutcome::Crash => "CRASH",
        }
    }

    /// Returns true if this outcome counts against the process exit code.
    pub fn is_failure(self) -> bool {
        matches!(self, SubtestOutcome::Fail | SubtestOutcome::Crash)
    }
}

impl fmt::Display for SubtestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SubtestOutcome {
    type Err = OutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let val = match s {
            "SUCCESS" => SubtestOutcome::Success,
            "SKIP" => SubtestOutcome::Skip,
            "FAIL" => SubtestOutcome::Fail,
            "CRASH" => SubtestOutcome::Crash,
            other => return Err(OutcomeParseError::new(other)),
        };
        Ok(val)
    }
}
