// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aborts the run from the middle subtest.

fn main() {
    igt_core::main(|igt| {
        igt.subtest("a-subtest", |_| {});
        igt.subtest("b-subtest", |igt| igt.abort_on(true, "Aborting dramatically"));
        igt.subtest("c-subtest", |_| {});
    });
}
