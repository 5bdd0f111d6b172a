// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fs::File, io::Write};

const KMSG_PATH: &str = "/dev/kmsg";

/// Writes markers into the kernel log, so kernel messages can be attributed to subtests.
///
/// Opening `/dev/kmsg` for writing usually requires root; without it, markers are silently
/// dropped.
#[derive(Debug)]
pub(crate) struct KmsgWriter {
    file: File,
}

impl KmsgWriter {
    pub(crate) fn open() -> Option<Self> {
        File::options()
            .write(true)
            .open(KMSG_PATH)
            .ok()
            .map(|file| Self { file })
    }

    /// Writes `message` at info level.
    pub(crate) fn write(&mut self, message: &str) {
        // Each write(2) is one record.
        let record = format!("<6>{message}\n");
        if let Err(error) = self.file.write_all(record.as_bytes()) {
            tracing::debug!(target: "igt_core::kmsg", "writing to {KMSG_PATH} failed: {error}");
        }
    }
}
