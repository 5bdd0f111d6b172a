// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aborts the run from a fixture, before any subtest starts.

fn main() {
    igt_core::main(|igt| {
        igt.fixture(|igt| igt.abort_on(true, "Aborting in a fixture"));
        igt.subtest("a-subtest", |_| {});
        igt.subtest("b-subtest", |_| {});
    });
}
