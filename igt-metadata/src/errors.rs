// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error that occurs while parsing a [`SubtestOutcome`](crate::SubtestOutcome).
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized subtest outcome `{input}` (known outcomes: {})",
    crate::SubtestOutcome::variants().join(", ")
)]
pub struct OutcomeParseError {
    input: String,
}

impl OutcomeParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// An error that occurs while parsing a [`TestName`](crate::TestName).
#[derive(Clone, Debug, Error)]
#[error("invalid test name `{input}`: {reason}")]
pub struct TestNameParseError {
    input: String,
    reason: &'static str,
}

impl TestNameParseError {
    pub(crate) fn new(input: impl Into<String>, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// An error that occurs while parsing a wildcard pattern list.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum PatternParseError {
    /// A pattern in the list was empty.
    #[error("empty pattern `{input}` in pattern list")]
    Empty {
        /// The offending list element.
        input: String,
    },

    /// A pattern was not a valid wildcard.
    #[error("invalid wildcard pattern `{input}`")]
    InvalidGlob {
        /// The offending list element.
        input: String,

        /// The underlying error.
        #[source]
        error: globset::Error,
    },

    /// The wildcard could not be compiled to a regular expression.
    #[error("failed to compile wildcard pattern `{input}`: {message}")]
    Regex {
        /// The offending list element.
        input: String,

        /// The compiler's message.
        message: String,
    },
}

/// An error that occurs while decoding a comms packet.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The header declared a size smaller than the header itself or larger than the maximum.
    #[error("packet declares invalid size {size}")]
    InvalidSize {
        /// The declared size.
        size: u32,
    },

    /// The packet kind is not known.
    #[error("unknown packet kind {kind}")]
    UnknownKind {
        /// The kind tag.
        kind: u32,
    },

    /// The payload ended before a field was complete.
    #[error("packet payload truncated while reading {field}")]
    Truncated {
        /// The field being read.
        field: &'static str,
    },

    /// A string field was not valid UTF-8.
    #[error("packet field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// The field being read.
        field: &'static str,
    },

    /// An enumerated field had an unknown value.
    #[error("packet field {field} has invalid value")]
    InvalidField {
        /// The field being read.
        field: &'static str,
    },
}
