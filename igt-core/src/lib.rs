// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The subtest runtime linked into every igt test binary.
//!
//! A test binary hands its body to [`main`] (or [`simple_main`] for binaries without subtests)
//! and structures its work with the methods on [`Igt`]:
//!
//! * [`Igt::fixture`] for setup and teardown shared by subtests,
//! * [`Igt::subtest`] and [`Igt::subtest_with_dynamic`] for named units of work,
//! * [`Igt::dynamic`] for units discovered at runtime,
//! * [`Igt::skip`], [`Igt::fail`], [`Igt::require`] and [`Igt::assert`] to resolve them.
//!
//! Results are reported as marker lines on stdout (and stderr, if the runner asks for it) or as
//! packets on the runner socket, in the formats defined by [`igt_metadata`].

mod cli;
mod comms;
mod config;
mod context;
pub mod exit_handler;
mod fork;
mod kmsg;
mod log;
mod output;
mod signal;
mod sigsafe;
mod subtest;
mod test_main;
mod version;

pub use cli::TestArgs;
pub use config::{
    CONFIG_PATH_ENV, DEVICE_ENV, FORCE_DRIVER_ENV, FRAME_DUMP_PATH_ENV, IgtConfig, IgtConfigError,
};
pub use context::Igt;
pub use fork::{HelperProcess, MAX_CHILDREN, MAX_HELPERS};
pub use log::{IgtLogLayer, IgtLogLevel, LOG_BUFFER_SIZE, LOG_LEVEL_ENV, LogBuffer};
pub use igt_metadata::{SENTINEL_ON_STDERR_ENV, comms::RUNNER_SOCKET_FD_ENV};
pub use output::PLAIN_OUTPUT_ENV;
pub use test_main::{TestMain, main, simple_main};
pub use version::version_line;
