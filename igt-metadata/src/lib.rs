// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Formats shared between igt test binaries and the igt runner.
//!
//! Test binaries and the runner live in different processes and communicate in three ways: the
//! process exit code, the human-readable marker lines on stdout/stderr, and the binary comms
//! packet stream. This crate defines all three so both sides agree on them.

pub mod comms;
mod errors;
mod exit_codes;
mod markers;
mod name;
mod outcome;
mod pattern;

pub use errors::*;
pub use exit_codes::*;
pub use markers::*;
pub use name::*;
pub use outcome::*;
pub use pattern::*;
