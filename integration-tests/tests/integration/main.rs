// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests.
//!
//! `runner` drives the runner library over a temporary test root holding links to the testdata
//! binaries. `termination` runs `runner-selftest` under the runner's timeouts, disk limit, kernel
//! monitoring and signal handling, checking the written `results.json`. `core_runtime` runs the
//! `core-selftest` and testdata binaries directly and checks what they print and how they exit.

mod core_runtime;
mod fixtures;
mod runner;
mod termination;
