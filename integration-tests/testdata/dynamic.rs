// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A dynamic subtest container with one failing child, between two passing subtests.

fn main() {
    igt_core::main(|igt| {
        igt.subtest("first-subtest", |_| {
            tracing::debug!("this line only shows up if first-subtest fails");
        });

        igt.subtest_with_dynamic("dynamic", |igt| {
            igt.dynamic("passing", |_| {
                tracing::debug!("passing dynamic subtest");
            });
            igt.dynamic("failing", |igt| {
                tracing::debug!("about to fail");
                igt.fail();
            });
        });

        igt.subtest("last-subtest", |_| {});
    });
}
