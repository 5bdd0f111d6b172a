// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use igt_metadata::RunnerExitCode;
use igt_runner::errors::{ExecuteError, JobListError, ResultsError, SettingsError};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are meant to be printed with
// display_to_stderr, which colorizes them.

/// An error the command-line tools know how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("invalid settings")]
    Settings {
        #[from]
        err: SettingsError,
    },
    #[error("failed to create job list")]
    JobList {
        #[from]
        err: JobListError,
    },
    #[error("failed to execute job list")]
    Execute {
        #[from]
        err: ExecuteError,
    },
    #[error("failed to generate results")]
    Results {
        err: ResultsError,
        results_path: Utf8PathBuf,
    },
    #[error("failed to write results")]
    WriteResults {
        err: ResultsError,
        results_path: Utf8PathBuf,
    },
    #[error("failed to write to output")]
    WriteOutput {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn results(err: ResultsError, results_path: impl Into<Utf8PathBuf>) -> Self {
        Self::Results {
            err,
            results_path: results_path.into(),
        }
    }

    pub(crate) fn write_results(err: ResultsError, results_path: impl Into<Utf8PathBuf>) -> Self {
        Self::WriteResults {
            err,
            results_path: results_path.into(),
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::Settings { .. } => RunnerExitCode::SETUP_ERROR,
            Self::JobList { .. } => RunnerExitCode::JOB_LIST_CREATION_FAILED,
            Self::Execute { .. } => RunnerExitCode::EXECUTION_FAILED,
            Self::Results { .. } => RunnerExitCode::RESULTS_FAILED,
            Self::WriteResults { .. } | Self::WriteOutput { .. } => {
                RunnerExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr, along with its chain of causes.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::Settings { err } => {
                tracing::error!("{err}");
                err.source()
            }
            Self::JobList { err } => {
                tracing::error!("{err}");
                err.source()
            }
            Self::Execute { err } => {
                tracing::error!("{err}");
                err.source()
            }
            Self::Results { err, results_path } => {
                tracing::error!(
                    "failed to generate results for `{}`",
                    results_path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::WriteResults { err, results_path } => {
                tracing::error!(
                    "failed to write results for `{}`",
                    results_path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::WriteOutput { err } => {
                tracing::error!("failed to write to output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            tracing::error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
