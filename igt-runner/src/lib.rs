// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for running batches of igt test binaries.
//!
//! A run goes through three stages:
//!
//! 1. [`job_list::JobList::create`] turns [`settings::Settings`] into an ordered list of test
//!    binary invocations.
//! 2. [`executor`] runs them one at a time, capturing everything each job writes into a
//!    numbered directory under the results directory. An interrupted run can be picked up
//!    again with [`executor::initialize_execute_state_from_resume`].
//! 3. [`resultgen`] folds the results directory into a single result document.

pub mod errors;
pub mod executor;
mod helpers;
pub mod job_list;
pub mod monitor;
pub mod replay;
pub mod reporter;
pub mod resultgen;
pub mod settings;
pub mod signal;
