// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subtests that skip in the two supported ways.

fn main() {
    igt_core::main(|igt| {
        igt.subtest("skip-one", |igt| igt.skip("This subtest always skips"));
        igt.subtest("skip-two", |igt| {
            igt.require(std::env::var_os("IGT_TESTDATA_NEVER_SET").is_some(), "variable set");
        });
    });
}
