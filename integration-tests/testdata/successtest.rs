// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two subtests that pass.

fn main() {
    igt_core::TestMain::new()
        .description("Two subtests that always pass.")
        .subtests(true)
        .run(|igt| {
            igt.describe("Passes without doing anything.");
            igt.subtest("first-subtest", |_| {});

            igt.describe("Passes after checking some arithmetic.");
            igt.subtest("second-subtest", |igt| {
                tracing::info!("checking arithmetic");
                igt.assert_eq(2 + 2, 4);
            });
        });
}
