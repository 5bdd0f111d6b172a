// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `igt_runner`, `igt_resume` and `igt_results` command-line tools.
//!
//! The binaries are thin wrappers over the apps defined here. Library functionality lives in
//! [`igt_runner`].

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::{IgtResultsApp, IgtResumeApp, IgtRunnerApp};
#[doc(hidden)]
pub use errors::ExpectedError;
pub use output::{Color, LOG_ENV, OutputContext, StderrStyles};
