// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A binary without subtests that passes.

fn main() {
    igt_core::simple_main(|_| {
        tracing::info!("nothing to see here");
    });
}
