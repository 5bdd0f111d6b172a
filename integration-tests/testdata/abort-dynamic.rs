// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aborts the run from a dynamic subtest.

fn main() {
    igt_core::main(|igt| {
        igt.subtest_with_dynamic("a-subtest", |igt| {
            igt.dynamic("a-dynamic", |_| {});
        });
        igt.subtest_with_dynamic("b-subtest", |igt| {
            igt.dynamic("b-passing", |_| {});
            igt.dynamic("b-aborting", |igt| igt.abort_on(true, "Aborting dynamically"));
        });
        igt.subtest("c-subtest", |_| {});
    });
}
