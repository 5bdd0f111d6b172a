// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the igt runner.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error parsing a disk usage limit such as `4k` or `1G`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error(
    "invalid disk usage limit `{input}`: expected a number of bytes with an optional k, M or G \
     suffix"
)]
pub struct DiskLimitParseError {
    input: String,
}

impl DiskLimitParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error parsing an `--abort-on-monitored-error` value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown abort condition `{input}` (known conditions: taint, lockdep, all)")]
pub struct AbortMaskParseError {
    input: String,
}

impl AbortMaskParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error parsing one of the runner's named settings values, such as a prune mode.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown {kind} `{input}` (known values: {})", known.join(", "))]
pub struct EnumParseError {
    kind: &'static str,
    input: String,
    known: &'static [&'static str],
}

impl EnumParseError {
    pub(crate) fn new(
        kind: &'static str,
        input: impl Into<String>,
        known: &'static [&'static str],
    ) -> Self {
        Self {
            kind,
            input: input.into(),
            known,
        }
    }
}

/// An error building [`Settings`](crate::settings::Settings).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// A `--include`, `--exclude` or blacklist pattern is not a valid regex.
    #[error("invalid regular expression `{pattern}`")]
    InvalidRegex {
        /// The pattern.
        pattern: String,

        /// The underlying error.
        #[source]
        error: Box<regex::Error>,
    },

    /// An `--environment` value is not of the form `KEY=VALUE`.
    #[error("invalid environment assignment `{input}`: expected KEY=VALUE")]
    InvalidEnvironment {
        /// The input.
        input: String,
    },

    /// A blacklist file couldn't be read.
    #[error("failed to read blacklist file `{path}`")]
    ReadBlacklist {
        /// The path to the blacklist.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// No test root was given.
    #[error("no test root given: pass it as an argument or set IGT_TEST_ROOT")]
    NoTestRoot,

    /// The test root is not a directory.
    #[error("test root `{path}` is not a directory")]
    TestRootNotDirectory {
        /// The test root.
        path: Utf8PathBuf,
    },
}

/// An error reading a persisted file in a results directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateReadError {
    /// The file couldn't be read.
    #[error("failed to read `{path}`")]
    Read {
        /// The path.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A line wasn't in the expected format.
    #[error("`{path}` line {line}: malformed line `{text}`")]
    MalformedLine {
        /// The path.
        path: Utf8PathBuf,

        /// The 1-based line number.
        line: usize,

        /// The line's text.
        text: String,
    },

    /// A value couldn't be parsed.
    #[error("`{path}`: invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// The path.
        path: Utf8PathBuf,

        /// The key.
        key: String,

        /// The value.
        value: String,
    },
}

/// An error writing a file in a results directory.
#[derive(Debug, Error)]
#[error("failed to write `{path}`")]
pub struct StateWriteError {
    path: Utf8PathBuf,
    #[source]
    error: io::Error,
}

impl StateWriteError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, error: io::Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }

    pub(crate) fn atomic(
        path: impl Into<Utf8PathBuf>,
        error: atomicwrites::Error<io::Error>,
    ) -> Self {
        let error = match error {
            atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => error,
        };
        Self::new(path, error)
    }
}

/// An error building a [`JobList`](crate::job_list::JobList).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobListError {
    /// The test root couldn't be read.
    #[error("failed to read test root `{path}`")]
    ReadTestRoot {
        /// The test root.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A test list file couldn't be read.
    #[error("failed to read test list `{path}`")]
    ReadTestList {
        /// The test list.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A test list file entry is malformed.
    #[error("test list `{path}` line {line}: invalid entry `{text}`")]
    InvalidTestListEntry {
        /// The test list.
        path: Utf8PathBuf,

        /// The 1-based line number.
        line: usize,

        /// The entry.
        text: String,
    },

    /// A test list names a binary that isn't in the test root.
    #[error("test binary `{binary}` not found in `{test_root}`")]
    BinaryNotFound {
        /// The binary name.
        binary: String,

        /// The test root.
        test_root: Utf8PathBuf,
    },

    /// Running a binary with `--list-subtests` failed.
    #[error("failed to list subtests of `{binary}`")]
    ListSubtests {
        /// The binary path.
        binary: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A binary exited with an unexpected status when listing subtests.
    #[error("`{binary} --list-subtests` exited with {}", display_code(*.code))]
    ListSubtestsFailed {
        /// The binary path.
        binary: Utf8PathBuf,

        /// The exit code, or `None` if killed by a signal.
        code: Option<i32>,
    },

    /// Nothing matched the filters.
    #[error("no tests matched the given filters")]
    Empty,

    /// The job list couldn't be read back.
    #[error(transparent)]
    Read(#[from] StateReadError),

    /// The job list couldn't be written.
    #[error(transparent)]
    Write(#[from] StateWriteError),
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_owned(),
    }
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// An error writing a progress event.
#[derive(Debug, Error)]
#[error("error writing progress output")]
pub struct WriteEventError(#[from] io::Error);

/// An error setting up or running the job list.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecuteError {
    /// The results directory already has results in it.
    #[error("results directory `{path}` is not empty (pass --overwrite to replace its contents)")]
    ResultsDirNotEmpty {
        /// The results directory.
        path: Utf8PathBuf,
    },

    /// The runner is not running as root.
    #[error("refusing to run as a non-root user (pass --allow-non-root to override)")]
    NotRoot,

    /// The results directory couldn't be created or cleared.
    #[error("failed to prepare results directory `{path}`")]
    PrepareResultsDir {
        /// The results directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The results directory has nothing to resume.
    #[error("`{path}` does not contain a resumable run")]
    NothingToResume {
        /// The results directory.
        path: Utf8PathBuf,
    },

    /// A test binary couldn't be spawned.
    #[error("failed to spawn `{binary}`")]
    Spawn {
        /// The binary path.
        binary: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The socket pair for structured communication couldn't be created.
    #[error("failed to create the runner socket")]
    Socket(#[source] io::Error),

    /// An I/O error occurred while collecting a test binary's output.
    #[error("I/O error while running `{binary}`")]
    ChildIo {
        /// The binary path.
        binary: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The async runtime couldn't be created.
    #[error("failed to create the async runtime")]
    Runtime(#[source] io::Error),

    /// The signal handler couldn't be set up.
    #[error(transparent)]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),

    /// Progress output couldn't be written.
    #[error(transparent)]
    WriteEvent(#[from] WriteEventError),

    /// A persisted file couldn't be read.
    #[error(transparent)]
    Read(#[from] StateReadError),

    /// A persisted file couldn't be written.
    #[error(transparent)]
    Write(#[from] StateWriteError),

    /// The persisted job list couldn't be read.
    #[error(transparent)]
    JobList(#[from] JobListError),
}

/// An error generating results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResultsError {
    /// The results directory is missing a run.
    #[error("`{path}` does not contain a run")]
    NoRun {
        /// The results directory.
        path: Utf8PathBuf,
    },

    /// A persisted file couldn't be read.
    #[error(transparent)]
    Read(#[from] StateReadError),

    /// The persisted job list couldn't be read.
    #[error(transparent)]
    JobList(#[from] JobListError),

    /// The results couldn't be serialized.
    #[error("failed to serialize results")]
    Serialize(#[source] serde_json::Error),

    /// The results couldn't be written.
    #[error(transparent)]
    Write(#[from] StateWriteError),
}
