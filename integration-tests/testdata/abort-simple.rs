// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A binary without subtests that aborts the run.

fn main() {
    igt_core::simple_main(|igt| igt.abort_on(true, "Aborting simply"));
}
